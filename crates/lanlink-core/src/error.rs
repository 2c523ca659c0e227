//! Core error types

use thiserror::Error;

/// Errors from the overlay engine
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network edge error
    #[error(transparent)]
    Net(#[from] lanlink_net::NetError),

    /// Wire decoding error
    #[error(transparent)]
    Proto(#[from] lanlink_proto::ProtoError),

    /// The engine is already running
    #[error("already running")]
    AlreadyRunning,

    /// The engine is not running
    #[error("not running")]
    NotRunning,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TUN bridge failed to start
    #[error("bridge start failed: {0}")]
    BridgeStart(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
