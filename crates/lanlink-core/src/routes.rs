//! Virtual-subnet routing table
//!
//! Maps virtual IPv4 addresses to the peers that own them. Invariants:
//! at most one entry per address, at most one local entry, and one
//! address per user (re-announcing under a new address drops the old
//! entry).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use lanlink_proto::{NodeId, RoutePair, UserId};

/// One routing table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub user_id: UserId,
    pub ipv4: Ipv4Addr,
    pub display_name: String,
    pub is_local: bool,
    pub node_id: NodeId,
}

/// Routing map keyed by virtual address
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<Ipv4Addr, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route for an address
    ///
    /// Any other address owned by the same user is dropped first, so a
    /// user renegotiating its address never leaves a stale entry.
    pub fn upsert(&mut self, entry: RouteEntry) {
        let user = entry.user_id;
        let ipv4 = entry.ipv4;
        self.entries
            .retain(|addr, e| e.user_id != user || *addr == ipv4);
        self.entries.insert(ipv4, entry);
    }

    /// Remove the route for an address
    pub fn remove(&mut self, ipv4: Ipv4Addr) -> Option<RouteEntry> {
        self.entries.remove(&ipv4)
    }

    /// Remove every route owned by a user, returning what was dropped
    pub fn remove_user(&mut self, user: UserId) -> Vec<RouteEntry> {
        let dropped: Vec<RouteEntry> = self
            .entries
            .values()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect();
        self.entries.retain(|_, e| e.user_id != user);
        dropped
    }

    /// Look up the route for an address
    pub fn get(&self, ipv4: Ipv4Addr) -> Option<&RouteEntry> {
        self.entries.get(&ipv4)
    }

    /// Whether an address has a route
    pub fn contains(&self, ipv4: Ipv4Addr) -> bool {
        self.entries.contains_key(&ipv4)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no routes exist
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<RouteEntry> {
        self.entries.values().cloned().collect()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Wire pairs for a route-update message
    pub fn to_pairs(&self) -> Vec<RoutePair> {
        self.entries
            .values()
            .map(|e| RoutePair {
                user_id: e.user_id,
                ipv4: e.ipv4,
            })
            .collect()
    }
}
