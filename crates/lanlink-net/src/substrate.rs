//! Session substrate contract
//!
//! The overlay rides on an external peer-to-peer messaging substrate that
//! owns identity, authentication, encryption and NAT traversal. This
//! module pins down the narrow surface the overlay actually uses, so the
//! rest of the system can be driven by the real platform bindings or by
//! the in-memory hub in [`crate::memory`].
//!
//! All calls are non-blocking; the substrate never re-enters the overlay.

use std::fmt;

use bytes::Bytes;
use lanlink_proto::UserId;
use thiserror::Error;

/// How a payload should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Ordered, retransmitted, subject to the pending-reliable window
    Reliable,

    /// Fire-and-forget, Nagle and batching disabled for latency
    Unreliable,
}

/// Session link state as reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session
    None,
    /// Handshake in flight
    Connecting,
    /// Path selection (ICE probing) in progress
    FindingRoute,
    /// Traffic can flow
    Connected,
    /// Remote side closed
    ClosedByPeer,
    /// Local stack gave up on the link
    ProblemDetected,
}

impl LinkState {
    /// True while the link has not yet carried traffic
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::FindingRoute)
    }
}

/// Point-in-time link measurements
#[derive(Debug, Clone, Copy)]
pub struct RealtimeStatus {
    pub state: LinkState,
    /// Round-trip estimate; <= 0 when unknown
    pub ping_ms: i32,
    /// Local-side quality in [0, 1]
    pub quality_local: f32,
    /// Remote-side quality in [0, 1]
    pub quality_remote: f32,
    /// Bytes accepted for reliable delivery but not yet acknowledged
    pub pending_reliable: usize,
}

/// A message drained from the substrate
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: UserId,
    pub payload: Bytes,
}

/// Session lifecycle notification
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote peer asked to open a session with us
    Requested { peer: UserId },

    /// The link changed state; `reason` carries the substrate's
    /// diagnostic string on failures
    StateChanged {
        peer: UserId,
        old: LinkState,
        new: LinkState,
        reason: String,
    },
}

/// Substrate configuration applied by the overlay
///
/// Penalties are virtual latency offsets in milliseconds: a positive
/// relay penalty biases path selection toward direct (ICE) links and
/// vice versa. `relay_only` disables direct paths outright for the next
/// connection attempt. The defaults match what the overlay applies once
/// at startup: buffers sized for large reliable bursts, a conservative
/// send-rate clamp so the reliable window stays stable, Nagle off for
/// tunnelled traffic, neutral path penalties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTuning {
    pub send_buffer_bytes: u32,
    pub recv_buffer_bytes: u32,
    pub recv_buffer_messages: u32,
    pub send_rate_bytes_per_sec: u32,
    pub nagle_time_us: u32,
    pub ice_penalty_ms: i32,
    pub relay_penalty_ms: i32,
    pub relay_only: bool,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            send_buffer_bytes: 2 * 1024 * 1024,
            recv_buffer_bytes: 2 * 1024 * 1024,
            recv_buffer_messages: 2048,
            send_rate_bytes_per_sec: 1024 * 1024,
            nagle_time_us: 0,
            ice_penalty_ms: 0,
            relay_penalty_ms: 0,
            relay_only: false,
        }
    }
}

/// Why a send did not happen
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Reliable window full; retry after backoff
    #[error("send limit exceeded")]
    LimitExceeded,

    /// No session with that peer
    #[error("no session")]
    NoSession,

    /// The substrate rejected the call outright
    #[error("invalid parameter")]
    InvalidParameter,

    /// Anything else the substrate reports
    #[error("substrate error: {0}")]
    Other(String),
}

impl SendError {
    /// Transient errors are retried with backoff; the rest drop the data
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LimitExceeded)
    }
}

/// The substrate surface the overlay depends on
pub trait Substrate: Send + Sync {
    /// The local user's id
    fn local_user(&self) -> UserId;

    /// Human-readable name for a peer, best effort
    fn display_name(&self, peer: UserId) -> String;

    /// Queue a payload to a peer
    fn send(&self, peer: UserId, payload: &[u8], delivery: Delivery) -> Result<(), SendError>;

    /// Drain up to `max` inbound messages
    fn receive(&self, max: usize) -> Vec<InboundMessage>;

    /// Realtime link measurements, `None` when no session exists
    fn status(&self, peer: UserId) -> Option<RealtimeStatus>;

    /// Accept/open a messaging session with a peer
    fn open_session(&self, peer: UserId);

    /// Close the session, flushing nothing
    fn close_session(&self, peer: UserId, reason: &str);

    /// Pop the next pending lifecycle event
    fn next_event(&self) -> Option<SessionEvent>;

    /// Apply path-selection tuning for subsequent connections
    fn set_tuning(&self, tuning: TransportTuning);

    /// Estimated round trip through the nearest relay point of
    /// presence, both legs approximated as symmetric
    fn relay_ping_estimate_ms(&self) -> Option<u32>;
}

impl fmt::Debug for dyn Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Substrate(local={})", self.local_user())
    }
}
