//! VPN message wire format
//!
//! Every overlay message is `header || payload` where the header is
//! `{ type: u8, length: u16 }` and `length` counts payload bytes.
//! Multi-byte integers in control payloads are network byte order; the
//! one exception is the user id inside route updates, which is carried
//! little-endian exactly as the substrate emits it.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};
use crate::identity::{NodeId, UserId, NODE_ID_SIZE};

/// Header size: type byte plus big-endian payload length
pub const VPN_HEADER_LEN: usize = 3;

/// Size of the sender wrapper prefixed to tunnelled IP datagrams
pub const IP_WRAPPER_LEN: usize = NODE_ID_SIZE + 4;

/// Bytes per route-update entry: u64 user id + u32 address
pub const ROUTE_PAIR_LEN: usize = 12;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VpnMessageType {
    /// Wrapped IPv4 datagram
    IpPacket = 1,

    /// Full route table push
    RouteUpdate = 3,

    /// Address-claim probe
    ProbeRequest = 10,

    /// Conflict answer to a probe
    ProbeResponse = 11,

    /// Claim of a settled address
    AddressAnnounce = 12,

    /// Order to the losing claimant to give an address up
    ForcedRelease = 13,

    /// Periodic liveness beacon
    Heartbeat = 14,

    /// Zero-length session primer
    SessionHello = 20,
}

impl TryFrom<u8> for VpnMessageType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(Self::IpPacket),
            3 => Ok(Self::RouteUpdate),
            10 => Ok(Self::ProbeRequest),
            11 => Ok(Self::ProbeResponse),
            12 => Ok(Self::AddressAnnounce),
            13 => Ok(Self::ForcedRelease),
            14 => Ok(Self::Heartbeat),
            20 => Ok(Self::SessionHello),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

/// One `{ user_id, ipv4 }` entry of a route update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePair {
    pub user_id: UserId,
    pub ipv4: Ipv4Addr,
}

/// A decoded overlay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnMessage {
    /// A raw IPv4 datagram wrapped with its sender identity
    IpPacket {
        sender: NodeId,
        source: Ipv4Addr,
        datagram: Bytes,
    },

    /// Sequence of user-id/address pairs
    RouteUpdate { routes: Vec<RoutePair> },

    /// "I intend to claim this address"
    ProbeRequest { ipv4: Ipv4Addr, node_id: NodeId },

    /// "That address is mine"; carries the responder's last heartbeat
    /// wall-clock so stale owners can be ignored
    ProbeResponse {
        ipv4: Ipv4Addr,
        node_id: NodeId,
        last_heartbeat_ms: i64,
    },

    /// Settled-claim announcement
    AddressAnnounce { ipv4: Ipv4Addr, node_id: NodeId },

    /// Arbitration verdict sent to the loser
    ForcedRelease { ipv4: Ipv4Addr, winner: NodeId },

    /// Liveness beacon with wall-clock epoch millis
    Heartbeat {
        ipv4: Ipv4Addr,
        node_id: NodeId,
        timestamp_ms: i64,
    },

    /// Session primer; no payload
    SessionHello,
}

impl VpnMessage {
    /// Wire type of this message
    pub fn message_type(&self) -> VpnMessageType {
        match self {
            Self::IpPacket { .. } => VpnMessageType::IpPacket,
            Self::RouteUpdate { .. } => VpnMessageType::RouteUpdate,
            Self::ProbeRequest { .. } => VpnMessageType::ProbeRequest,
            Self::ProbeResponse { .. } => VpnMessageType::ProbeResponse,
            Self::AddressAnnounce { .. } => VpnMessageType::AddressAnnounce,
            Self::ForcedRelease { .. } => VpnMessageType::ForcedRelease,
            Self::Heartbeat { .. } => VpnMessageType::Heartbeat,
            Self::SessionHello => VpnMessageType::SessionHello,
        }
    }

    /// Serialize to `header || payload`
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(VPN_HEADER_LEN + payload_len);
        buf.put_u8(self.message_type() as u8);
        buf.put_u16(payload_len as u16);

        match self {
            Self::IpPacket {
                sender,
                source,
                datagram,
            } => {
                buf.put_slice(sender.as_bytes());
                buf.put_u32(u32::from(*source));
                buf.put_slice(datagram);
            }
            Self::RouteUpdate { routes } => {
                for pair in routes {
                    buf.put_u64_le(pair.user_id.0);
                    buf.put_u32(u32::from(pair.ipv4));
                }
            }
            Self::ProbeRequest { ipv4, node_id } | Self::AddressAnnounce { ipv4, node_id } => {
                buf.put_u32(u32::from(*ipv4));
                buf.put_slice(node_id.as_bytes());
            }
            Self::ProbeResponse {
                ipv4,
                node_id,
                last_heartbeat_ms,
            } => {
                buf.put_u32(u32::from(*ipv4));
                buf.put_slice(node_id.as_bytes());
                buf.put_i64(*last_heartbeat_ms);
            }
            Self::ForcedRelease { ipv4, winner } => {
                buf.put_u32(u32::from(*ipv4));
                buf.put_slice(winner.as_bytes());
            }
            Self::Heartbeat {
                ipv4,
                node_id,
                timestamp_ms,
            } => {
                buf.put_u32(u32::from(*ipv4));
                buf.put_slice(node_id.as_bytes());
                buf.put_i64(*timestamp_ms);
            }
            Self::SessionHello => {}
        }

        buf.freeze()
    }

    /// Parse `header || payload` into a message
    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.len() < VPN_HEADER_LEN {
            return Err(ProtoError::Truncated(buf.len()));
        }
        let msg_type = VpnMessageType::try_from(buf[0])?;
        let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let available = buf.len() - VPN_HEADER_LEN;
        if declared > available {
            return Err(ProtoError::LengthMismatch {
                declared,
                available,
            });
        }
        let mut payload = &buf[VPN_HEADER_LEN..VPN_HEADER_LEN + declared];

        match msg_type {
            VpnMessageType::IpPacket => {
                if payload.len() < IP_WRAPPER_LEN {
                    return Err(ProtoError::PayloadTooShort {
                        kind: "IP_PACKET",
                        len: payload.len(),
                    });
                }
                let sender = read_node_id(&mut payload);
                let source = Ipv4Addr::from(payload.get_u32());
                let datagram = Bytes::copy_from_slice(payload);
                Ok(Self::IpPacket {
                    sender,
                    source,
                    datagram,
                })
            }
            VpnMessageType::RouteUpdate => {
                let mut routes = Vec::with_capacity(payload.len() / ROUTE_PAIR_LEN);
                while payload.len() >= ROUTE_PAIR_LEN {
                    let user_id = UserId(payload.get_u64_le());
                    let ipv4 = Ipv4Addr::from(payload.get_u32());
                    routes.push(RoutePair { user_id, ipv4 });
                }
                Ok(Self::RouteUpdate { routes })
            }
            VpnMessageType::ProbeRequest => {
                let (ipv4, node_id) = read_addr_claim(&mut payload, "PROBE_REQUEST")?;
                Ok(Self::ProbeRequest { ipv4, node_id })
            }
            VpnMessageType::ProbeResponse => {
                if payload.len() < 4 + NODE_ID_SIZE + 8 {
                    return Err(ProtoError::PayloadTooShort {
                        kind: "PROBE_RESPONSE",
                        len: payload.len(),
                    });
                }
                let ipv4 = Ipv4Addr::from(payload.get_u32());
                let node_id = read_node_id(&mut payload);
                let last_heartbeat_ms = payload.get_i64();
                Ok(Self::ProbeResponse {
                    ipv4,
                    node_id,
                    last_heartbeat_ms,
                })
            }
            VpnMessageType::AddressAnnounce => {
                let (ipv4, node_id) = read_addr_claim(&mut payload, "ADDRESS_ANNOUNCE")?;
                Ok(Self::AddressAnnounce { ipv4, node_id })
            }
            VpnMessageType::ForcedRelease => {
                let (ipv4, winner) = read_addr_claim(&mut payload, "FORCED_RELEASE")?;
                Ok(Self::ForcedRelease { ipv4, winner })
            }
            VpnMessageType::Heartbeat => {
                if payload.len() < 4 + NODE_ID_SIZE + 8 {
                    return Err(ProtoError::PayloadTooShort {
                        kind: "HEARTBEAT",
                        len: payload.len(),
                    });
                }
                let ipv4 = Ipv4Addr::from(payload.get_u32());
                let node_id = read_node_id(&mut payload);
                let timestamp_ms = payload.get_i64();
                Ok(Self::Heartbeat {
                    ipv4,
                    node_id,
                    timestamp_ms,
                })
            }
            VpnMessageType::SessionHello => Ok(Self::SessionHello),
        }
    }

    /// Raw wire type of a buffer, if it is long enough to carry one
    pub fn peek_type(buf: &[u8]) -> Option<u8> {
        buf.first().copied()
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::IpPacket { datagram, .. } => IP_WRAPPER_LEN + datagram.len(),
            Self::RouteUpdate { routes } => routes.len() * ROUTE_PAIR_LEN,
            Self::ProbeRequest { .. } | Self::AddressAnnounce { .. } | Self::ForcedRelease { .. } => {
                4 + NODE_ID_SIZE
            }
            Self::ProbeResponse { .. } | Self::Heartbeat { .. } => 4 + NODE_ID_SIZE + 8,
            Self::SessionHello => 0,
        }
    }
}

fn read_node_id(payload: &mut &[u8]) -> NodeId {
    let mut bytes = [0u8; NODE_ID_SIZE];
    bytes.copy_from_slice(&payload[..NODE_ID_SIZE]);
    payload.advance(NODE_ID_SIZE);
    NodeId::from_bytes(bytes)
}

fn read_addr_claim(payload: &mut &[u8], kind: &'static str) -> ProtoResult<(Ipv4Addr, NodeId)> {
    if payload.len() < 4 + NODE_ID_SIZE {
        return Err(ProtoError::PayloadTooShort {
            kind,
            len: payload.len(),
        });
    }
    let ipv4 = Ipv4Addr::from(payload.get_u32());
    let node_id = read_node_id(payload);
    Ok((ipv4, node_id))
}
