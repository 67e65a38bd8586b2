//! Master orchestrator
//!
//! Owns the test and socket registries, spawns one worker process per
//! test, and drives scenario lifecycles over the RPC channel. Any
//! lifecycle failure kills the worker; scenario state is assumed
//! corrupted after the first exception.

use crate::catalog::ScenarioCatalog;
use crate::config::{BindingType, MasterConfig};
use crate::socket_registry::{SocketCommand, SocketRegistry};
use crate::test_log;
use crate::test_registry::TestRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use stagehand_common::rpc::{decode_chunk, Request, SetupParams};
use stagehand_common::{Error, Result, RpcChannel, RpcHandler, WireError, WireErrorKind};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How long a worker gets to exit on its own after a clean teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(3);

/// A live worker process serving one test.
pub struct WorkerHandle {
    test_id: String,
    pid: u32,
    channel: RpcChannel,
    disconnecting: AtomicBool,
    exited: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// SIGKILL the worker. Idempotent: ESRCH means it is already gone.
    pub fn kill(&self) {
        let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
    }

    /// Close the RPC transport so the worker sees EOF and exits on its own.
    pub fn disconnect(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
        self.channel.close();
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `grace` for the process to exit.
    pub async fn wait_exit(&self, grace: Duration) -> bool {
        let mut exited = self.exited.clone();
        tokio::time::timeout(grace, async move {
            while !*exited.borrow_and_update() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

#[derive(Clone, Copy)]
enum LifecyclePhase {
    Setup,
    Step,
    Teardown,
}

impl LifecyclePhase {
    fn failure(self, test_id: &str, scenario_id: Option<String>) -> Error {
        let test_id = test_id.to_string();
        match self {
            LifecyclePhase::Setup => Error::SetupFailed { test_id, scenario_id },
            LifecyclePhase::Step => Error::StepFailed { test_id, scenario_id },
            LifecyclePhase::Teardown => Error::TeardownFailed { test_id, scenario_id },
        }
    }
}

pub struct Master {
    pub(crate) config: MasterConfig,
    pub(crate) catalog: ScenarioCatalog,
    pub(crate) tests: TestRegistry<Arc<WorkerHandle>>,
    pub(crate) sockets: SocketRegistry,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let catalog = ScenarioCatalog::new(config.scenarios.clone());
        let tests = TestRegistry::new(config.test_concurrency_limit);
        Self {
            config,
            catalog,
            tests,
            sockets: SocketRegistry::new(),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Number of tests currently holding a slot.
    pub fn active_tests(&self) -> usize {
        self.tests.active()
    }

    /// Admit a test, spawn its worker, and run the scenario's setup.
    ///
    /// Returns the port the worker bound for `port` binding, `None` for
    /// `header` binding.
    pub async fn setup(
        self: &Arc<Self>,
        test_id: &str,
        scenario_name: &str,
        binding: BindingType,
    ) -> Result<Option<u16>> {
        self.tests.allocate(test_id)?;
        match self.run_setup(test_id, scenario_name, binding).await {
            Ok(port) => Ok(port),
            Err(err) => {
                // Once a worker exists its exit watcher frees the slot;
                // before that the slot has to be put back by hand.
                if matches!(self.tests.get_worker(test_id), Err(Error::WorkerNotAssigned { .. })) {
                    self.tests.release(test_id);
                }
                Err(err)
            }
        }
    }

    async fn run_setup(
        self: &Arc<Self>,
        test_id: &str,
        scenario_name: &str,
        binding: BindingType,
    ) -> Result<Option<u16>> {
        let module = self.catalog.resolve(scenario_name)?;

        let worker = self.spawn_worker(test_id).await?;
        self.tests.assign_worker(test_id, worker.clone())?;
        self.arm_kill_timer(worker.clone());

        // The port is acquired here but bound by the worker; another
        // process could grab it in the window between. Accepted.
        let port = match binding {
            BindingType::Port => match unused_port(&self.config.host).await {
                Ok(port) => Some(port),
                Err(err) => {
                    worker.kill();
                    return Err(err);
                }
            },
            BindingType::Header => None,
        };

        let params = SetupParams {
            module,
            scenario_name: scenario_name.to_string(),
            log_path: test_log::test_log_path(&self.config.log_directory, test_id),
            host: self.config.host.clone(),
            port,
        };
        self.lifecycle_call(&worker, Request::Setup(params), LifecyclePhase::Setup)
            .await?;

        info!("Test {} set up with scenario {}", test_id, scenario_name);
        Ok(port)
    }

    /// Run the next step of the test's scenario.
    pub async fn step(&self, test_id: &str) -> Result<()> {
        let worker = self.tests.get_worker(test_id)?;
        self.lifecycle_call(&worker, Request::Step, LifecyclePhase::Step)
            .await?;
        Ok(())
    }

    /// Run the scenario's teardown, then let the worker exit on its own.
    pub async fn teardown(&self, test_id: &str) -> Result<()> {
        let worker = self.tests.get_worker(test_id)?;
        self.lifecycle_call(&worker, Request::Teardown, LifecyclePhase::Teardown)
            .await?;

        worker.disconnect();
        if !worker.wait_exit(TEARDOWN_GRACE).await {
            error!(
                "Worker {} for test {} did not exit after teardown, killing it",
                worker.pid, worker.test_id
            );
            worker.kill();
        }
        Ok(())
    }

    async fn lifecycle_call(
        &self,
        worker: &WorkerHandle,
        request: Request,
        phase: LifecyclePhase,
    ) -> Result<Value> {
        match worker.channel.call(request).await {
            Ok(value) => Ok(value),
            Err(err) => {
                worker.kill();
                Err(translate_lifecycle_error(err, phase, &worker.test_id))
            }
        }
    }

    async fn spawn_worker(self: &Arc<Self>, test_id: &str) -> Result<Arc<WorkerHandle>> {
        let mut child = Command::new(&self.config.worker.binary_path)
            .args(&self.config.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Worker(format!("Failed to spawn worker: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Worker("Worker exited during startup".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("Worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("Worker stdout unavailable".to_string()))?;

        let handler = Arc::new(RelayHandler {
            master: self.clone(),
        });
        let channel = RpcChannel::spawn(stdout, stdin, handler);

        let (exit_tx, exit_rx) = watch::channel(false);
        let worker = Arc::new(WorkerHandle {
            test_id: test_id.to_string(),
            pid,
            channel,
            disconnecting: AtomicBool::new(false),
            exited: exit_rx,
        });

        info!("Worker {} started for test {}", pid, test_id);

        // The exit watcher owns the child. It frees the registry slot
        // whenever the process goes away, however that happens.
        let master = self.clone();
        let handle = worker.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);
            handle.channel.close();
            master.tests.release(&handle.test_id);
            match status {
                Ok(status) if handle.is_disconnecting() => {
                    debug!(
                        "Worker {} for test {} exited ({})",
                        handle.pid, handle.test_id, status
                    );
                }
                Ok(status) => {
                    error!(
                        "Worker {} for test {} exited unexpectedly ({})",
                        handle.pid, handle.test_id, status
                    );
                }
                Err(e) => error!("Failed to await worker {}: {}", handle.pid, e),
            }
        });

        Ok(worker)
    }

    fn arm_kill_timer(&self, worker: Arc<WorkerHandle>) {
        let timeout = Duration::from_secs(self.config.test_duration_timeout);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !worker.has_exited() {
                error!(
                    "Test {} exceeded its {}s duration limit, killing worker {}",
                    worker.test_id,
                    timeout.as_secs(),
                    worker.pid
                );
                worker.kill();
            }
        });
    }
}

/// Map a failed lifecycle RPC to the phase's error, keeping everything
/// else (protocol errors, dead channel) intact.
fn translate_lifecycle_error(err: Error, phase: LifecyclePhase, test_id: &str) -> Error {
    match err {
        Error::Remote(wire) => match wire.kind {
            WireErrorKind::Lifecycle => phase.failure(test_id, wire.scenario_id),
            WireErrorKind::UnexpectedStep => Error::UnexpectedStep {
                test_id: test_id.to_string(),
                scenario_id: wire.scenario_id,
            },
            _ => Error::Remote(wire),
        },
        other => other,
    }
}

/// Ask the OS for a currently unused port.
async fn unused_port(host: &str) -> Result<u16> {
    let listener = tokio::net::TcpListener::bind((host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Serves socket-relay calls arriving from workers.
struct RelayHandler {
    master: Arc<Master>,
}

#[async_trait]
impl RpcHandler for RelayHandler {
    async fn handle(
        &self,
        _channel: RpcChannel,
        request: Request,
    ) -> std::result::Result<Value, WireError> {
        match request {
            Request::Send { socket_id, chunk } => {
                let command = match decode_chunk(chunk.as_deref()) {
                    Ok(Some(bytes)) => SocketCommand::Write(Bytes::from(bytes)),
                    Ok(None) => SocketCommand::End,
                    Err(e) => return Err(WireError::protocol(e.to_string())),
                };
                self.master
                    .sockets
                    .send(socket_id, command)
                    .map_err(to_wire)?;
                Ok(Value::Null)
            }
            Request::SetTimeout { socket_id, timeout_ms } => {
                self.master
                    .sockets
                    .send(socket_id, SocketCommand::SetTimeout(Duration::from_millis(timeout_ms)))
                    .map_err(to_wire)?;
                Ok(Value::Null)
            }
            Request::SetNoDelay { socket_id, no_delay } => {
                self.master
                    .sockets
                    .send(socket_id, SocketCommand::SetNoDelay(no_delay))
                    .map_err(to_wire)?;
                Ok(Value::Null)
            }
            Request::Setup(_) | Request::Step | Request::Teardown | Request::Receive { .. } => {
                Err(WireError::protocol("call type not served by the master"))
            }
        }
    }
}

fn to_wire(err: Error) -> WireError {
    WireError::internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_wire_errors_map_to_the_phase() {
        let err = translate_lifecycle_error(
            Error::Remote(WireError::lifecycle("login:successful", "boom")),
            LifecyclePhase::Step,
            "test-1",
        );
        match err {
            Error::StepFailed { test_id, scenario_id } => {
                assert_eq!(test_id, "test-1");
                assert_eq!(scenario_id.as_deref(), Some("login:successful"));
            }
            other => panic!("expected step failure, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_step_survives_translation() {
        let err = translate_lifecycle_error(
            Error::Remote(WireError::unexpected_step("login:successful")),
            LifecyclePhase::Step,
            "test-1",
        );
        assert!(matches!(err, Error::UnexpectedStep { .. }));
    }

    #[test]
    fn other_errors_pass_through_unchanged() {
        let err = translate_lifecycle_error(Error::ChannelClosed, LifecyclePhase::Teardown, "t");
        assert!(matches!(err, Error::ChannelClosed));

        let err = translate_lifecycle_error(
            Error::Remote(WireError::protocol("bad frame")),
            LifecyclePhase::Setup,
            "t",
        );
        assert!(matches!(err, Error::Remote(_)));
    }

    #[tokio::test]
    async fn unused_port_is_nonzero() {
        let port = unused_port("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
    }
}
