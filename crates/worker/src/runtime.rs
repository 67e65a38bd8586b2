//! Worker runtime
//!
//! Serves the master's calls: lifecycle phases against the one active
//! scenario, and `receive` for relayed traffic, which it replays into
//! fake sockets wired to the scenario's mounted service.

use crate::context::TestContext;
use crate::fake_socket::{fake_socket_pair, FakeSocketHandle, SocketEvent};
use crate::lifecycle::{LifecycleCompiler, ScenarioInstance};
use crate::loader::ScenarioLoader;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use stagehand_common::rpc::{decode_chunk, encode_chunk, Request, SetupParams};
use stagehand_common::{RpcChannel, RpcHandler, WireError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Inbound chunks a fake socket may hold before the relay backs off.
const SOCKET_BUFFER_CHUNKS: usize = 64;

struct ActiveTest {
    context: Arc<TestContext>,
    scenario: ScenarioInstance,
}

pub struct WorkerRuntime {
    loader: Box<dyn ScenarioLoader>,
    state: Mutex<Option<ActiveTest>>,
    sockets: Mutex<HashMap<Uuid, FakeSocketHandle>>,
}

impl WorkerRuntime {
    pub fn new(loader: Box<dyn ScenarioLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(None),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    async fn setup(&self, params: SetupParams) -> Result<Value, WireError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(WireError::internal("test already set up"));
        }

        let log = open_log(&params).map_err(|e| {
            WireError::internal(format!("cannot open log {}: {e}", params.log_path.display()))
        })?;
        let context = Arc::new(TestContext::new(params.host, params.port, Some(log)));

        let mut compiler = LifecycleCompiler::new();
        self.loader
            .load(&params.module, context.clone(), &mut compiler)
            .await
            .map_err(|e| WireError::internal(e.to_string()))?;
        let lifecycle = compiler
            .compile_lifecycle(&params.scenario_name)
            .map_err(|e| WireError::internal(e.to_string()))?;

        let (setup, scenario) = ScenarioInstance::new(params.scenario_name, lifecycle);
        if let Err(e) = setup().await {
            context.log(&format!("setup failed: {e}"));
            error!("Scenario {} setup failed: {}", scenario.scenario_id(), e);
            return Err(WireError::lifecycle(scenario.scenario_id(), e.to_string()));
        }

        context.log("setup complete");
        *state = Some(ActiveTest { context, scenario });
        Ok(Value::Null)
    }

    async fn step(&self) -> Result<Value, WireError> {
        let mut state = self.state.lock().await;
        let active = state
            .as_mut()
            .ok_or_else(|| WireError::internal("test is not set up"))?;

        let Some(step) = active.scenario.next_step() else {
            return Err(WireError::unexpected_step(active.scenario.scenario_id()));
        };
        if let Err(e) = step().await {
            active.context.log(&format!("step failed: {e}"));
            error!("Scenario {} step failed: {}", active.scenario.scenario_id(), e);
            return Err(WireError::lifecycle(
                active.scenario.scenario_id(),
                e.to_string(),
            ));
        }
        active.context.log("step complete");
        Ok(Value::Null)
    }

    async fn teardown(&self) -> Result<Value, WireError> {
        let mut state = self.state.lock().await;
        let active = state
            .as_mut()
            .ok_or_else(|| WireError::internal("test is not set up"))?;

        if let Some(teardown) = active.scenario.take_teardown() {
            if let Err(e) = teardown().await {
                active.context.log(&format!("teardown failed: {e}"));
                error!(
                    "Scenario {} teardown failed: {}",
                    active.scenario.scenario_id(),
                    e
                );
                return Err(WireError::lifecycle(
                    active.scenario.scenario_id(),
                    e.to_string(),
                ));
            }
        }
        active.context.log("teardown complete");
        // The test is over; drop the context so nothing serves after this.
        *state = None;
        Ok(Value::Null)
    }

    async fn receive(
        &self,
        channel: RpcChannel,
        socket_id: Uuid,
        chunk: Option<String>,
    ) -> Result<Value, WireError> {
        let bytes = decode_chunk(chunk.as_deref()).map_err(|e| WireError::protocol(e.to_string()))?;
        let end = bytes.is_none();

        let handle = self.socket(channel, socket_id).await?;
        let delivered = handle.deliver(bytes.map(Bytes::from)).await;
        if end || !delivered {
            self.sockets.lock().await.remove(&socket_id);
        }
        Ok(Value::Null)
    }

    /// Look up the fake socket for a relay id, creating it on first use.
    async fn socket(
        &self,
        channel: RpcChannel,
        socket_id: Uuid,
    ) -> Result<FakeSocketHandle, WireError> {
        let mut sockets = self.sockets.lock().await;
        if let Some(handle) = sockets.get(&socket_id) {
            return Ok(handle.clone());
        }

        let service = {
            let state = self.state.lock().await;
            state.as_ref().and_then(|active| active.context.service())
        }
        .ok_or_else(|| WireError::internal("no listener mounted for relayed socket"))?;

        let (socket, handle, mut events) = fake_socket_pair(SOCKET_BUFFER_CHUNKS);
        sockets.insert(socket_id, handle.clone());
        debug!("Fake socket created for relay id {}", socket_id);

        // Events go out one at a time, awaited, so the byte stream keeps
        // its order on the master side.
        tokio::spawn(async move {
            let mut finalized = false;
            while let Some(event) = events.recv().await {
                let is_final = matches!(event, SocketEvent::Send(None));
                let request = match event {
                    SocketEvent::Send(bytes) => Request::Send {
                        socket_id,
                        chunk: encode_chunk(bytes.as_deref()),
                    },
                    SocketEvent::SetTimeout(timeout_ms) => Request::SetTimeout {
                        socket_id,
                        timeout_ms,
                    },
                    SocketEvent::SetNoDelay(no_delay) => Request::SetNoDelay {
                        socket_id,
                        no_delay,
                    },
                };
                if channel.call(request).await.is_err() {
                    return;
                }
                if is_final {
                    finalized = true;
                    break;
                }
            }
            // A dropped socket ends the stream even without a shutdown.
            if !finalized {
                let _ = channel
                    .call(Request::Send {
                        socket_id,
                        chunk: None,
                    })
                    .await;
            }
        });

        tokio::spawn(async move {
            service.serve(Box::new(socket)).await;
        });

        Ok(handle)
    }
}

fn open_log(params: &SetupParams) -> std::io::Result<std::fs::File> {
    if let Some(parent) = params.log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::File::create(&params.log_path)
}

#[async_trait]
impl RpcHandler for WorkerRuntime {
    async fn handle(
        &self,
        channel: RpcChannel,
        request: Request,
    ) -> Result<Value, WireError> {
        match request {
            Request::Setup(params) => self.setup(params).await,
            Request::Step => self.step().await,
            Request::Teardown => self.teardown().await,
            Request::Receive { socket_id, chunk } => self.receive(channel, socket_id, chunk).await,
            Request::Send { .. } | Request::SetTimeout { .. } | Request::SetNoDelay { .. } => {
                Err(WireError::protocol("call type not served by the worker"))
            }
        }
    }
}
