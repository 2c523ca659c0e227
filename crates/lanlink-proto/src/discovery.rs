//! LAN discovery bridge framing
//!
//! Local UDP broadcasts on the discovery port are carried over the tunnel
//! as request/response pairs:
//!
//! ```text
//! 0-3: 'U' 'D' 'P' 'B'
//! 4:   type (0 = request, 1 = response)
//! 5-6: request id (u16 little endian)
//! 7-8: payload length (u16 little endian)
//! 9-:  payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};

/// Magic prefix identifying discovery frames inside the tunnel
pub const DISCOVERY_MAGIC: [u8; 4] = *b"UDPB";

/// Fixed header size
pub const DISCOVERY_HEADER_LEN: usize = 9;

/// Well-known LAN discovery port bridged by the overlay
pub const DISCOVERY_PORT: u16 = 4445;

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryKind {
    /// Client-side broadcast forwarded toward the host LAN
    Request = 0,

    /// Host-side answer travelling back to the original requester
    Response = 1,
}

/// A decoded discovery frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    pub kind: DiscoveryKind,
    pub request_id: u16,
    pub payload: Bytes,
}

impl DiscoveryFrame {
    /// Serialize to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DISCOVERY_HEADER_LEN + self.payload.len());
        buf.put_slice(&DISCOVERY_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.request_id);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire bytes
    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < DISCOVERY_HEADER_LEN {
            return Err(ProtoError::Truncated(buf.len()));
        }
        if buf[..4] != DISCOVERY_MAGIC {
            return Err(ProtoError::BadMagic);
        }
        let kind = match buf[4] {
            0 => DiscoveryKind::Request,
            1 => DiscoveryKind::Response,
            other => return Err(ProtoError::UnknownType(other)),
        };
        let request_id = u16::from_le_bytes([buf[5], buf[6]]);
        let declared = u16::from_le_bytes([buf[7], buf[8]]) as usize;
        let available = buf.len() - DISCOVERY_HEADER_LEN;
        if declared > available {
            return Err(ProtoError::LengthMismatch {
                declared,
                available,
            });
        }
        Ok(Self {
            kind,
            request_id,
            payload: Bytes::copy_from_slice(&buf[DISCOVERY_HEADER_LEN..DISCOVERY_HEADER_LEN + declared]),
        })
    }
}

/// Quick check used by the inbound dispatcher to route tunnel bytes
pub fn is_discovery_frame(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[..4] == DISCOVERY_MAGIC
}
