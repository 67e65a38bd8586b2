//! Stagehand worker
//!
//! Runs inside the process the master spawns per test. Owns one
//! scenario's lifecycle and its fake sockets, and serves the master's
//! calls over stdin/stdout until the master disconnects.

pub mod context;
pub mod fake_socket;
pub mod lifecycle;
pub mod loader;
pub mod runtime;

pub use context::{ConnectionService, TestContext, TestStream};
pub use lifecycle::{callback, LifecycleCompiler};
pub use loader::{ScenarioLoader, StaticLoader};
pub use runtime::WorkerRuntime;

use stagehand_common::RpcChannel;
use std::sync::Arc;

/// Serve the master over stdin/stdout. Returns once the master
/// disconnects, which is the worker's signal to exit.
pub async fn run(loader: Box<dyn ScenarioLoader>) -> anyhow::Result<()> {
    let runtime = Arc::new(WorkerRuntime::new(loader));
    let channel = RpcChannel::spawn(tokio::io::stdin(), tokio::io::stdout(), runtime);
    channel.closed().await;
    Ok(())
}
