//! Network layer error types

use thiserror::Error;

/// Errors from the network edges
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Substrate refused or failed a send
    #[error("substrate send failed: {0}")]
    Send(#[from] crate::substrate::SendError),

    /// No session exists for the peer
    #[error("no session with peer {0}")]
    NoSession(lanlink_proto::UserId),

    /// Platform not supported
    #[error("platform not supported for this operation")]
    PlatformNotSupported,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
