//! Lanlink protocol primitives
//!
//! Wire-level building blocks shared by every other crate:
//! - Node identity (salted 256-bit digest of the platform user id)
//! - VPN control/data message framing
//! - TCP tunnel multiplex framing
//! - LAN discovery bridge framing

pub mod discovery;
pub mod error;
pub mod identity;
pub mod mux;
pub mod vpn;

pub use discovery::{DiscoveryFrame, DiscoveryKind};
pub use error::{ProtoError, ProtoResult};
pub use identity::{NodeId, UserId, NODE_ID_SIZE};
pub use mux::{MuxFrame, MuxFrameType, SessionId, MUX_CHUNK, MUX_ID_LEN};
pub use vpn::{RoutePair, VpnMessage, VpnMessageType};

/// Window during which probe conflicts are collected
pub const PROBE_TIMEOUT_MS: i64 = 500;

/// Local heartbeat broadcast period
pub const HEARTBEAT_INTERVAL_MS: i64 = 60_000;

/// Age at which a remote node is declared inactive
pub const HEARTBEAT_EXPIRY_MS: i64 = 180_000;

/// Age at which a remote node's address lease is erased
pub const LEASE_EXPIRY_MS: i64 = 360_000;

/// Current wall-clock time as milliseconds since the Unix epoch
pub fn epoch_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_monotonicish() {
        let a = epoch_millis();
        let b = epoch_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
