//! TCP tunnel multiplex framing
//!
//! Each frame is `id || NUL || type || payload`: a 6-character
//! alphanumeric session id, a NUL terminator, a little-endian u32 frame
//! type, and (for data frames) the payload bytes. Payloads larger than
//! [`MUX_CHUNK`] are split into consecutive data frames with the same id.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{ProtoError, ProtoResult};

/// Characters in a session id
pub const MUX_ID_LEN: usize = 6;

/// Frame header size: id, NUL terminator, type word
pub const MUX_HEADER_LEN: usize = MUX_ID_LEN + 1 + 4;

/// Maximum payload carried by a single data frame
pub const MUX_CHUNK: usize = 32 * 1024;

/// Pending-reliable threshold at which sends are refused
pub const MUX_HIGH_WATER: usize = 6 * 1024 * 1024;

/// Pending-reliable threshold at which sends resume
pub const MUX_LOW_WATER: usize = 4 * 1024 * 1024;

/// Initial flush backoff
pub const BACKOFF_INIT_MS: u64 = 5;

/// Backoff ceiling while the transport stays saturated
pub const BACKOFF_MAX_MS: u64 = 200;

const ID_ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Opaque 6-character session id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; MUX_ID_LEN]);

impl SessionId {
    /// Uniform random id over the 62-character alphabet
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; MUX_ID_LEN];
        for b in &mut bytes {
            *b = ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Parse an id from the start of a wire frame
    pub fn try_from_slice(slice: &[u8]) -> ProtoResult<Self> {
        if slice.len() < MUX_ID_LEN {
            return Err(ProtoError::InvalidSessionId);
        }
        let mut bytes = [0u8; MUX_ID_LEN];
        bytes.copy_from_slice(&slice[..MUX_ID_LEN]);
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtoError::InvalidSessionId);
        }
        Ok(Self(bytes))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII alphanumerics.
        std::str::from_utf8(&self.0).unwrap_or("??????")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.as_str())
    }
}

/// Frame type word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MuxFrameType {
    /// Carries payload bytes for the session
    Data = 0,

    /// Session teardown; no payload
    Disconnect = 1,
}

impl TryFrom<u32> for MuxFrameType {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Disconnect),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub id: SessionId,
    pub kind: MuxFrameType,
    pub payload: Bytes,
}

/// Build a wire frame
///
/// Payload bytes are only attached to data frames; control frames carry
/// the header alone.
pub fn build_frame(id: SessionId, kind: MuxFrameType, payload: &[u8]) -> Bytes {
    let payload_len = if kind == MuxFrameType::Data {
        payload.len()
    } else {
        0
    };
    let mut buf = BytesMut::with_capacity(MUX_HEADER_LEN + payload_len);
    buf.put_slice(&id.0);
    buf.put_u8(0);
    buf.put_u32_le(kind as u32);
    if payload_len > 0 {
        buf.put_slice(payload);
    }
    buf.freeze()
}

/// Parse a wire frame
pub fn parse_frame(buf: &[u8]) -> ProtoResult<MuxFrame> {
    if buf.len() < MUX_HEADER_LEN {
        return Err(ProtoError::Truncated(buf.len()));
    }
    let id = SessionId::try_from_slice(buf)?;
    let type_word = u32::from_le_bytes([
        buf[MUX_ID_LEN + 1],
        buf[MUX_ID_LEN + 2],
        buf[MUX_ID_LEN + 3],
        buf[MUX_ID_LEN + 4],
    ]);
    let kind = MuxFrameType::try_from(type_word)?;
    Ok(MuxFrame {
        id,
        kind,
        payload: Bytes::copy_from_slice(&buf[MUX_HEADER_LEN..]),
    })
}
