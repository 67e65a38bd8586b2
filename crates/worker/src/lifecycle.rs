//! Scenario lifecycle compiler
//!
//! Collects the `setup`/`step`/`teardown` callbacks a scenario declares
//! into an ordered lifecycle. A small state machine keeps declaration
//! misuse (nested scenarios, double setup, registration outside a
//! compiling declaration) from silently producing a broken lifecycle.

use futures::future::BoxFuture;
use stagehand_common::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::future::Future;

/// One lifecycle callback. Runs at most once.
pub type Callback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// The body of a scenario declaration, invoked during compilation.
pub type DeclarationFn = Box<dyn FnOnce(&mut LifecycleCompiler) -> Result<()> + Send>;

/// Wrap an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scenario,
    Lifecycle,
    Done,
}

pub struct LifecycleCompiler {
    phase: Phase,
    declarations: HashMap<String, DeclarationFn>,
    setup: Option<Callback>,
    steps: VecDeque<Callback>,
    teardown: Option<Callback>,
}

impl Default for LifecycleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCompiler {
    pub fn new() -> Self {
        Self {
            phase: Phase::Scenario,
            declarations: HashMap::new(),
            setup: None,
            steps: VecDeque::new(),
            teardown: None,
        }
    }

    /// Declare a scenario by id. Valid only before any compilation.
    pub fn scenario(&mut self, id: &str, declaration: DeclarationFn) -> Result<()> {
        if self.phase != Phase::Scenario {
            return Err(Error::Internal(format!(
                "scenario \"{id}\" declared outside the declaration phase"
            )));
        }
        if self.declarations.contains_key(id) {
            return Err(Error::Internal(format!("scenario \"{id}\" declared twice")));
        }
        self.declarations.insert(id.to_string(), declaration);
        Ok(())
    }

    /// Register the lifecycle's setup. Exactly one is required.
    pub fn setup(&mut self, callback: Callback) -> Result<()> {
        self.expect_lifecycle("setup")?;
        if self.setup.is_some() {
            return Err(Error::Internal("setup registered twice".to_string()));
        }
        self.setup = Some(callback);
        Ok(())
    }

    /// Append a step. Steps run in registration order.
    pub fn step(&mut self, callback: Callback) -> Result<()> {
        self.expect_lifecycle("step")?;
        self.steps.push_back(callback);
        Ok(())
    }

    /// Register the optional teardown. At most one.
    pub fn teardown(&mut self, callback: Callback) -> Result<()> {
        self.expect_lifecycle("teardown")?;
        if self.teardown.is_some() {
            return Err(Error::Internal("teardown registered twice".to_string()));
        }
        self.teardown = Some(callback);
        Ok(())
    }

    fn expect_lifecycle(&self, what: &str) -> Result<()> {
        if self.phase != Phase::Lifecycle {
            return Err(Error::Internal(format!(
                "{what} registered outside a compiling scenario declaration"
            )));
        }
        Ok(())
    }

    /// Harvest the declared ids. The compiler is spent afterwards.
    pub fn collect_scenario_ids(&mut self) -> Vec<String> {
        self.phase = Phase::Done;
        let mut ids: Vec<String> = self.declarations.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Invoke one declaration and compile its lifecycle.
    pub fn compile_lifecycle(&mut self, scenario_id: &str) -> Result<CompiledLifecycle> {
        if self.phase != Phase::Scenario {
            return Err(Error::Internal(
                "compiler has already produced a lifecycle".to_string(),
            ));
        }
        let declaration =
            self.declarations
                .remove(scenario_id)
                .ok_or_else(|| Error::UnknownScenario {
                    name: scenario_id.to_string(),
                })?;

        self.phase = Phase::Lifecycle;
        let declared = declaration(self);
        self.phase = Phase::Done;
        declared?;

        let setup = self.setup.take().ok_or_else(|| {
            Error::Internal(format!("scenario \"{scenario_id}\" declared no setup"))
        })?;
        Ok(CompiledLifecycle {
            setup,
            steps: std::mem::take(&mut self.steps),
            teardown: self.teardown.take(),
        })
    }
}

pub struct CompiledLifecycle {
    pub setup: Callback,
    pub steps: VecDeque<Callback>,
    pub teardown: Option<Callback>,
}

/// One running scenario: the compiled lifecycle minus its setup, which
/// the runtime executes before the instance exists.
pub struct ScenarioInstance {
    scenario_id: String,
    steps: VecDeque<Callback>,
    teardown: Option<Callback>,
}

impl ScenarioInstance {
    pub fn new(scenario_id: String, lifecycle: CompiledLifecycle) -> (Callback, Self) {
        (
            lifecycle.setup,
            Self {
                scenario_id,
                steps: lifecycle.steps,
                teardown: lifecycle.teardown,
            },
        )
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Consume the next step, front to back. Steps never replay.
    pub fn next_step(&mut self) -> Option<Callback> {
        self.steps.pop_front()
    }

    pub fn take_teardown(&mut self) -> Option<Callback> {
        self.teardown.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> Callback {
        let log = log.clone();
        callback(move || async move {
            log.lock().push(entry);
            Ok(())
        })
    }

    #[tokio::test]
    async fn compiles_and_runs_a_full_lifecycle_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut compiler = LifecycleCompiler::new();

        let declaration_log = log.clone();
        compiler
            .scenario(
                "login:successful",
                Box::new(move |c| {
                    c.setup(record(&declaration_log, "setup"))?;
                    c.step(record(&declaration_log, "first"))?;
                    c.step(record(&declaration_log, "second"))?;
                    c.teardown(record(&declaration_log, "teardown"))?;
                    Ok(())
                }),
            )
            .unwrap();

        let lifecycle = compiler.compile_lifecycle("login:successful").unwrap();
        let (setup, mut instance) = ScenarioInstance::new("login:successful".to_string(), lifecycle);

        setup().await.unwrap();
        while let Some(step) = instance.next_step() {
            step().await.unwrap();
        }
        instance.take_teardown().unwrap()().await.unwrap();

        assert_eq!(*log.lock(), vec!["setup", "first", "second", "teardown"]);
        assert!(instance.next_step().is_none());
        assert!(instance.take_teardown().is_none());
    }

    #[test]
    fn duplicate_scenario_ids_are_rejected() {
        let mut compiler = LifecycleCompiler::new();
        compiler
            .scenario("dup", Box::new(|_| Ok(())))
            .unwrap();
        assert!(compiler.scenario("dup", Box::new(|_| Ok(()))).is_err());
    }

    #[test]
    fn two_setups_fail_compilation() {
        let mut compiler = LifecycleCompiler::new();
        compiler
            .scenario(
                "greedy",
                Box::new(|c| {
                    c.setup(callback(|| async { Ok(()) }))?;
                    c.setup(callback(|| async { Ok(()) }))
                }),
            )
            .unwrap();
        assert!(compiler.compile_lifecycle("greedy").is_err());
    }

    #[test]
    fn registration_outside_a_declaration_fails() {
        let mut compiler = LifecycleCompiler::new();
        assert!(compiler.setup(callback(|| async { Ok(()) })).is_err());
        assert!(compiler.step(callback(|| async { Ok(()) })).is_err());
        assert!(compiler.teardown(callback(|| async { Ok(()) })).is_err());
    }

    #[test]
    fn compiling_an_undeclared_id_fails() {
        let mut compiler = LifecycleCompiler::new();
        assert!(matches!(
            compiler.compile_lifecycle("missing"),
            Err(Error::UnknownScenario { .. })
        ));
    }

    #[test]
    fn a_lifecycle_without_setup_fails() {
        let mut compiler = LifecycleCompiler::new();
        compiler
            .scenario("bare", Box::new(|_| Ok(())))
            .unwrap();
        assert!(compiler.compile_lifecycle("bare").is_err());
    }

    #[test]
    fn collecting_ids_spends_the_compiler() {
        let mut compiler = LifecycleCompiler::new();
        compiler.scenario("b", Box::new(|_| Ok(()))).unwrap();
        compiler.scenario("a", Box::new(|_| Ok(()))).unwrap();

        assert_eq!(compiler.collect_scenario_ids(), vec!["a", "b"]);
        assert!(compiler.compile_lifecycle("a").is_err());
        assert!(compiler.scenario("c", Box::new(|_| Ok(()))).is_err());
    }
}
