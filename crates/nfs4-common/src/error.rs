//! Error types for shared server state

use thiserror::Error;

/// Errors raised by the shared state tables
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommonError {
    /// Filehandle could not be parsed or failed its checksum
    #[error("invalid filehandle: {0}")]
    InvalidHandle(String),

    /// Filehandle was valid once but no longer names an object
    #[error("stale filehandle: {0}")]
    StaleHandle(String),

    /// Client id unknown, superseded or not yet confirmed
    #[error("stale client id {0:#018x}")]
    StaleClient(u64),

    /// Client name is registered to a different principal
    #[error("client id {0:#018x} in use")]
    ClientInUse(u64),
}

/// Result type for shared state operations
pub type CommonResult<T> = Result<T, CommonError>;
