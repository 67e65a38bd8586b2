//! Scenario catalog
//!
//! Maps scenario ids to the module a worker loads to declare them.

use stagehand_common::{Error, Result};
use std::collections::HashMap;

pub struct ScenarioCatalog {
    modules: HashMap<String, String>,
}

impl ScenarioCatalog {
    pub fn new(modules: HashMap<String, String>) -> Self {
        Self { modules }
    }

    pub fn resolve(&self, scenario_name: &str) -> Result<String> {
        self.modules
            .get(scenario_name)
            .cloned()
            .ok_or_else(|| Error::UnknownScenario {
                name: scenario_name.to_string(),
            })
    }

    pub fn scenario_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }
}
