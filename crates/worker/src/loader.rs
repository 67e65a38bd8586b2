//! Scenario loading
//!
//! A loader turns the module reference from the setup call into scenario
//! declarations on the compiler. The master stays ignorant of how modules
//! are actually executed; workers plug in whatever mechanism fits.

use crate::context::TestContext;
use crate::lifecycle::LifecycleCompiler;
use async_trait::async_trait;
use stagehand_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait ScenarioLoader: Send + Sync {
    async fn load(
        &self,
        module: &str,
        context: Arc<TestContext>,
        compiler: &mut LifecycleCompiler,
    ) -> Result<()>;
}

type ModuleFn = Box<dyn Fn(Arc<TestContext>, &mut LifecycleCompiler) -> Result<()> + Send + Sync>;

/// Loader over modules compiled into the worker binary.
#[derive(Default)]
pub struct StaticLoader {
    modules: HashMap<String, ModuleFn>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, module: &str, declare: F) -> Self
    where
        F: Fn(Arc<TestContext>, &mut LifecycleCompiler) -> Result<()> + Send + Sync + 'static,
    {
        self.modules.insert(module.to_string(), Box::new(declare));
        self
    }
}

#[async_trait]
impl ScenarioLoader for StaticLoader {
    async fn load(
        &self,
        module: &str,
        context: Arc<TestContext>,
        compiler: &mut LifecycleCompiler,
    ) -> Result<()> {
        let declare = self
            .modules
            .get(module)
            .ok_or_else(|| Error::Internal(format!("unknown scenario module \"{module}\"")))?;
        declare(context, compiler)
    }
}
