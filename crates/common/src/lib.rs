//! Stagehand Common Library
//!
//! Shared error types and the correlated RPC channel used between the
//! master process and its scenario workers.

pub mod error;
pub mod rpc;

pub use error::{Error, Result};
pub use rpc::{RpcChannel, RpcHandler, WireError, WireErrorKind};

/// Stagehand version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
