//! Node identity
//!
//! Every node derives a 32-byte id from its platform user id by hashing
//! `user_id || salt` with BLAKE3. The id is stable for the life of the
//! account, and its lexicographic byte order is the single total order
//! used for every conflict election in the overlay.

use std::fmt;

/// Size of a node id in bytes
pub const NODE_ID_SIZE: usize = 32;

/// Salt mixed into the digest so ids are specific to this application
const NODE_ID_SALT: &[u8] = b"Lanlink_Overlay_Salt_v1";

/// Opaque 64-bit user id handed out by the session substrate
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 256-bit node identifier with total ordering
///
/// "A has priority over B" iff A's bytes compare lexicographically
/// greater than B's.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    bytes: [u8; NODE_ID_SIZE],
}

impl NodeId {
    /// Derive the node id for a user
    ///
    /// Deterministic: the same user id always produces the same node id,
    /// on every machine.
    pub fn from_user_id(user: UserId) -> Self {
        let mut input = [0u8; 8 + NODE_ID_SALT.len()];
        input[..8].copy_from_slice(&user.0.to_le_bytes());
        input[8..].copy_from_slice(NODE_ID_SALT);

        let hash = blake3::hash(&input);
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[..NODE_ID_SIZE]);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != NODE_ID_SIZE {
            return None;
        }
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(slice);
        Some(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.bytes
    }

    /// All-zero id, used as a sentinel before initialisation
    pub fn zero() -> Self {
        Self {
            bytes: [0u8; NODE_ID_SIZE],
        }
    }

    /// True if every byte is zero
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Whether this node wins an election against `other`
    ///
    /// Strict: an id never has priority over itself.
    pub fn has_priority_over(&self, other: &NodeId) -> bool {
        self > other
    }

    /// The trailing 24 bits of the id as an unsigned integer
    ///
    /// Seeds the virtual-address candidate sequence, so two nodes with
    /// different ids usually start probing different host parts.
    pub fn trailing_u24(&self) -> u32 {
        u32::from(self.bytes[NODE_ID_SIZE - 1])
            | (u32::from(self.bytes[NODE_ID_SIZE - 2]) << 8)
            | (u32::from(self.bytes[NODE_ID_SIZE - 3]) << 16)
    }

    /// Full lowercase hex rendering
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(NODE_ID_SIZE * 2);
        for b in &self.bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Short rendering for logs: first 8 hex chars and an ellipsis
    pub fn short(&self) -> String {
        format!("{}...", &self.to_hex()[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_derivation() {
        let a = NodeId::from_user_id(UserId(76561198000000001));
        let b = NodeId::from_user_id(UserId(76561198000000001));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_users_distinct_ids() {
        let a = NodeId::from_user_id(UserId(1));
        let b = NodeId::from_user_id(UserId(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_priority_is_antisymmetric() {
        let a = NodeId::from_user_id(UserId(11));
        let b = NodeId::from_user_id(UserId(22));
        assert_ne!(a.has_priority_over(&b), b.has_priority_over(&a));
        assert!(!a.has_priority_over(&a));
    }

    #[test]
    fn test_priority_is_byte_order() {
        let hi = NodeId::from_bytes([0xFF; NODE_ID_SIZE]);
        let lo = NodeId::from_bytes([0x00; NODE_ID_SIZE]);
        assert!(hi.has_priority_over(&lo));
        assert!(!lo.has_priority_over(&hi));

        // First differing byte decides
        let mut almost = [0xFF; NODE_ID_SIZE];
        almost[0] = 0xFE;
        let almost = NodeId::from_bytes(almost);
        assert!(hi.has_priority_over(&almost));
    }

    #[test]
    fn test_trailing_u24() {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[NODE_ID_SIZE - 3] = 0xAB;
        bytes[NODE_ID_SIZE - 2] = 0xCD;
        bytes[NODE_ID_SIZE - 1] = 0xEF;
        let id = NodeId::from_bytes(bytes);
        assert_eq!(id.trailing_u24(), 0x00AB_CDEF);
    }

    #[test]
    fn test_short_rendering() {
        let id = NodeId::from_bytes([0xAB; NODE_ID_SIZE]);
        assert_eq!(id.short(), "abababab...");
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(NodeId::zero().is_zero());
        assert!(!NodeId::from_user_id(UserId(7)).is_zero());
    }
}
