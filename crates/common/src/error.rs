//! Error types for Stagehand

use crate::rpc::WireError;
use thiserror::Error;

/// Result type alias using Stagehand Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stagehand error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate test: {id}")]
    DuplicateTest { id: String },

    #[error("Test concurrency limit of {limit} reached")]
    ConcurrencyLimit { limit: usize },

    #[error("Unknown test: {id}")]
    UnknownTest { id: String },

    #[error("Worker has not been set yet for test {id}")]
    WorkerNotAssigned { id: String },

    #[error("Unknown scenario: {name}")]
    UnknownScenario { name: String },

    #[error("Unknown socket: {id}")]
    UnknownSocket { id: uuid::Uuid },

    #[error("Setup of test {test_id} failed")]
    SetupFailed { test_id: String, scenario_id: Option<String> },

    #[error("Step of test {test_id} failed")]
    StepFailed { test_id: String, scenario_id: Option<String> },

    #[error("Unexpected step of test {test_id}")]
    UnexpectedStep { test_id: String, scenario_id: Option<String> },

    #[error("Teardown of test {test_id} failed")]
    TeardownFailed { test_id: String, scenario_id: Option<String> },

    #[error("RPC channel is closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(WireError),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}
