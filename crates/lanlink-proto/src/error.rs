//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding wire frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer shorter than the fixed header
    #[error("message too short: {0} bytes")]
    Truncated(usize),

    /// Header type byte does not name a known message
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    /// Tunnel frame type word does not name a known frame
    #[error("unknown tunnel frame type: {0}")]
    UnknownFrameType(u32),

    /// Declared payload length exceeds the bytes actually present
    #[error("header length mismatch: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },

    /// Payload shorter than its fixed layout requires
    #[error("payload too short for {kind}: {len} bytes")]
    PayloadTooShort { kind: &'static str, len: usize },

    /// Session id is not 6 alphanumeric characters
    #[error("invalid session id")]
    InvalidSessionId,

    /// Buffer does not start with the discovery magic
    #[error("not a discovery frame")]
    BadMagic,
}

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;
