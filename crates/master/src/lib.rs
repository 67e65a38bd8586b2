//! Stagehand master process
//!
//! Exposes the HTTP control API, manages one worker process per active
//! test, and relays client traffic between real sockets and the workers'
//! emulated ones.

pub mod catalog;
pub mod config;
pub mod control_api;
pub mod orchestrator;
pub mod relay;
pub mod socket_registry;
pub mod test_log;
pub mod test_registry;

pub use config::{BindingType, MasterConfig, WorkerConfig};
pub use orchestrator::Master;
