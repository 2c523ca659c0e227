//! Distributed virtual-address negotiation
//!
//! Each node picks a candidate IPv4 inside the shared subnet, probes the
//! overlay for conflicts, and claims the address if every live objector
//! has lower priority. Ties are broken by node-id order; losers bump a
//! probe offset and try the next candidate. The state machine never
//! blocks: probing is bounded by a timeout and every restart strictly
//! advances the candidate sequence.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Instant;

use lanlink_net::Delivery;
use lanlink_proto::{
    epoch_millis, NodeId, UserId, VpnMessage, HEARTBEAT_EXPIRY_MS, PROBE_TIMEOUT_MS,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Not negotiating
    Idle,
    /// Candidate probe in flight
    Probing,
    /// Address claimed and defended
    Stable,
}

/// Outbound control traffic produced by the negotiator and heartbeat
/// layers; the owner pumps these into the transport
#[derive(Debug)]
pub enum ControlOut {
    Unicast {
        peer: UserId,
        message: VpnMessage,
        delivery: Delivery,
    },
    Broadcast {
        message: VpnMessage,
        delivery: Delivery,
    },
}

/// Notifications to the negotiator's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    /// The local node now owns `ipv4`
    Claimed { ipv4: Ipv4Addr, node_id: NodeId },
}

#[derive(Debug, Clone)]
struct ConflictInfo {
    node_id: NodeId,
    last_heartbeat_ms: i64,
    sender: UserId,
}

/// Virtual-address negotiation state machine
///
/// Not internally synchronised; the owner serialises access.
pub struct IpNegotiator {
    node_id: NodeId,
    base: u32,
    mask: u32,

    phase: NegotiationPhase,
    local_ip: u32,
    candidate: u32,
    probe_offset: u32,
    probe_start: Option<Instant>,

    conflicts: Vec<ConflictInfo>,
    used: HashSet<u32>,

    outbound: mpsc::UnboundedSender<ControlOut>,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
}

impl IpNegotiator {
    pub fn new(
        node_id: NodeId,
        base: Ipv4Addr,
        mask: Ipv4Addr,
        outbound: mpsc::UnboundedSender<ControlOut>,
        events: mpsc::UnboundedSender<NegotiatorEvent>,
    ) -> Self {
        info!(target: "network", node_id = %node_id.short(), "negotiator initialised");
        Self {
            node_id,
            base: u32::from(base),
            mask: u32::from(mask),
            phase: NegotiationPhase::Idle,
            local_ip: 0,
            candidate: 0,
            probe_offset: 0,
            probe_start: None,
            conflicts: Vec::new(),
            used: HashSet::new(),
            outbound,
            events,
        }
    }

    /// Current phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// The claimed address, once Stable
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        (self.local_ip != 0).then(|| Ipv4Addr::from(self.local_ip))
    }

    /// The address currently being probed
    pub fn candidate_ip(&self) -> Option<Ipv4Addr> {
        (self.candidate != 0).then(|| Ipv4Addr::from(self.candidate))
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current probe offset
    pub fn probe_offset(&self) -> u32 {
        self.probe_offset
    }

    /// Whether an address is marked in use
    pub fn is_used(&self, ip: Ipv4Addr) -> bool {
        self.used.contains(&u32::from(ip))
    }

    /// Forget all negotiation state
    pub fn reset(&mut self) {
        self.used.clear();
        self.conflicts.clear();
        self.phase = NegotiationPhase::Idle;
        self.candidate = 0;
        self.probe_offset = 0;
        self.local_ip = 0;
        self.probe_start = None;
    }

    /// Begin (or restart) probing for an address
    pub fn start_negotiation(&mut self) {
        self.conflicts.clear();

        let generated = self.generate_candidate(self.probe_offset);
        self.candidate = self.find_next_available(generated);
        self.phase = NegotiationPhase::Probing;
        self.probe_start = Some(Instant::now());

        debug!(
            target: "network",
            candidate = %Ipv4Addr::from(self.candidate),
            offset = self.probe_offset,
            "probing virtual address"
        );
        self.broadcast(VpnMessage::ProbeRequest {
            ipv4: Ipv4Addr::from(self.candidate),
            node_id: self.node_id,
        });
    }

    /// Resolve the probe window if it has elapsed
    ///
    /// Called at least every 50 ms while the negotiator is alive.
    pub fn check_timeout(&mut self) {
        if self.phase != NegotiationPhase::Probing {
            return;
        }
        let elapsed_ms = self
            .probe_start
            .map(|s| s.elapsed().as_millis() as i64)
            .unwrap_or(0);
        if elapsed_ms < PROBE_TIMEOUT_MS {
            return;
        }

        let conflicts = std::mem::take(&mut self.conflicts);
        let now_ms = epoch_millis();

        let mut can_claim = true;
        let mut losers = Vec::new();
        for conflict in &conflicts {
            let heartbeat_age = now_ms - conflict.last_heartbeat_ms;
            if heartbeat_age >= HEARTBEAT_EXPIRY_MS {
                debug!(
                    target: "network",
                    node = %conflict.node_id.short(),
                    age_ms = heartbeat_age,
                    "ignoring stale conflict"
                );
                continue;
            }
            if self.node_id.has_priority_over(&conflict.node_id) {
                losers.push(conflict.sender);
            } else {
                can_claim = false;
                break;
            }
        }

        if can_claim {
            for loser in losers {
                self.send_forced_release(Ipv4Addr::from(self.candidate), loser);
            }
            self.phase = NegotiationPhase::Stable;
            self.local_ip = self.candidate;
            self.used.insert(self.local_ip);
            info!(
                target: "network",
                ip = %Ipv4Addr::from(self.local_ip),
                "virtual address claimed"
            );
            self.send_address_announce();
            let _ = self.events.send(NegotiatorEvent::Claimed {
                ipv4: Ipv4Addr::from(self.local_ip),
                node_id: self.node_id,
            });
        } else {
            debug!(target: "network", "lost address arbitration, reselecting");
            self.probe_offset += 1;
            self.start_negotiation();
        }
    }

    /// Another node is probing an address
    pub fn handle_probe_request(&mut self, ipv4: Ipv4Addr, node_id: NodeId, sender: UserId) {
        let requested = u32::from(ipv4);
        let should_respond = match self.phase {
            NegotiationPhase::Stable => requested == self.local_ip,
            NegotiationPhase::Probing if requested == self.candidate => {
                if self.node_id.has_priority_over(&node_id) {
                    true
                } else {
                    debug!(target: "network", "lost probe contention, reselecting");
                    self.probe_offset += 1;
                    self.start_negotiation();
                    return;
                }
            }
            _ => false,
        };

        if should_respond {
            self.unicast(
                sender,
                VpnMessage::ProbeResponse {
                    ipv4,
                    node_id: self.node_id,
                    last_heartbeat_ms: epoch_millis(),
                },
            );
            debug!(target: "network", %ipv4, "answered conflicting probe");
        }
    }

    /// An answer to our own probe arrived
    pub fn handle_probe_response(
        &mut self,
        ipv4: Ipv4Addr,
        node_id: NodeId,
        last_heartbeat_ms: i64,
        sender: UserId,
    ) {
        if self.phase != NegotiationPhase::Probing || u32::from(ipv4) != self.candidate {
            return;
        }
        debug!(
            target: "network",
            node = %node_id.short(),
            "collected probe conflict"
        );
        self.conflicts.push(ConflictInfo {
            node_id,
            last_heartbeat_ms,
            sender,
        });
    }

    /// A node announced a settled claim
    pub fn handle_address_announce(&mut self, ipv4: Ipv4Addr, node_id: NodeId, sender: UserId) {
        let announced = u32::from(ipv4);

        if announced == self.local_ip && self.phase == NegotiationPhase::Stable {
            if !self.node_id.has_priority_over(&node_id) {
                info!(target: "network", %ipv4, "address conflict with announcing peer, reselecting");
                self.local_ip = 0;
                self.probe_offset += 1;
                self.start_negotiation();
            } else {
                self.send_forced_release(ipv4, sender);
            }
            return;
        }

        self.used.insert(announced);
    }

    /// A winner ordered us off an address
    pub fn handle_forced_release(&mut self, ipv4: Ipv4Addr, winner: NodeId) {
        let released = u32::from(ipv4);
        let concerns_us = (released == self.local_ip && self.phase == NegotiationPhase::Stable)
            || (released == self.candidate && self.phase == NegotiationPhase::Probing);

        if concerns_us && !self.node_id.has_priority_over(&winner) {
            info!(target: "network", %ipv4, "releasing address on higher-priority claim");
            self.used.remove(&released);
            self.local_ip = 0;
            self.probe_offset += 1;
            self.phase = NegotiationPhase::Idle;
            self.start_negotiation();
        }
    }

    /// Re-announce the claimed address to everyone
    pub fn send_address_announce(&self) {
        if self.local_ip == 0 {
            return;
        }
        self.broadcast(VpnMessage::AddressAnnounce {
            ipv4: Ipv4Addr::from(self.local_ip),
            node_id: self.node_id,
        });
    }

    /// Announce the claimed address to one peer
    pub fn send_address_announce_to(&self, peer: UserId) {
        if self.phase != NegotiationPhase::Stable || self.local_ip == 0 {
            return;
        }
        self.unicast(
            peer,
            VpnMessage::AddressAnnounce {
                ipv4: Ipv4Addr::from(self.local_ip),
                node_id: self.node_id,
            },
        );
    }

    /// Order a losing claimant off an address
    pub fn send_forced_release(&self, ipv4: Ipv4Addr, peer: UserId) {
        self.unicast(
            peer,
            VpnMessage::ForcedRelease {
                ipv4,
                winner: self.node_id,
            },
        );
        debug!(target: "network", %ipv4, %peer, "sent forced release");
    }

    /// Mark an address as taken
    pub fn mark_used(&mut self, ip: Ipv4Addr) {
        self.used.insert(u32::from(ip));
    }

    /// Mark an address as free
    pub fn mark_unused(&mut self, ip: Ipv4Addr) {
        self.used.remove(&u32::from(ip));
    }

    /// Deterministic candidate for a probe offset
    ///
    /// The trailing 24 bits of the node id plus the offset, mapped into
    /// `[1, host_count - 1]`; host parts 0 and broadcast are never
    /// produced.
    fn generate_candidate(&self, offset: u32) -> u32 {
        let hash = self.node_id.trailing_u24().wrapping_add(offset) & 0x00FF_FFFF;
        let host_mask = !self.mask;
        let max_hosts = host_mask.saturating_sub(1).max(1);
        let host_part = (hash % max_hosts) + 1;
        (self.base & self.mask) | host_part
    }

    /// Walk forward from a candidate, skipping addresses already in use
    fn find_next_available(&self, start: u32) -> u32 {
        let host_mask = !self.mask;
        let max_hosts = host_mask.saturating_sub(1).max(1);

        let mut host_part = start & host_mask;
        if host_part == 0 || host_part >= host_mask {
            host_part = 1;
        }

        let mut candidate = (self.base & self.mask) | host_part;
        let mut attempts = 0;
        while self.used.contains(&candidate) && attempts < max_hosts {
            host_part += 1;
            if host_part >= host_mask {
                host_part = 1;
            }
            candidate = (self.base & self.mask) | host_part;
            attempts += 1;
        }
        candidate
    }

    fn unicast(&self, peer: UserId, message: VpnMessage) {
        let _ = self.outbound.send(ControlOut::Unicast {
            peer,
            message,
            delivery: Delivery::Reliable,
        });
    }

    fn broadcast(&self, message: VpnMessage) {
        let _ = self.outbound.send(ControlOut::Broadcast {
            message,
            delivery: Delivery::Reliable,
        });
    }

    #[cfg(test)]
    pub(crate) fn backdate_probe(&mut self, ms: u64) {
        self.probe_start = Instant::now().checked_sub(std::time::Duration::from_millis(ms));
    }
}
