//! Heartbeat liveness table
//!
//! Tracks every known node, broadcasts the local node's beacon once per
//! interval, sweeps expired leases, and resolves packet-level address
//! conflicts by node-id priority. The node table and its address
//! reverse map are kept coherent under one lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lanlink_net::Delivery;
use lanlink_proto::{
    epoch_millis, NodeId, UserId, VpnMessage, HEARTBEAT_EXPIRY_MS, HEARTBEAT_INTERVAL_MS,
    LEASE_EXPIRY_MS,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::negotiator::ControlOut;

/// A known overlay node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub user_id: UserId,
    pub ipv4: Ipv4Addr,
    pub last_heartbeat: Instant,
    pub display_name: String,
    pub is_local: bool,
}

impl NodeInfo {
    /// Heard from recently enough to be routable
    pub fn is_active(&self) -> bool {
        (self.last_heartbeat.elapsed().as_millis() as i64) < HEARTBEAT_EXPIRY_MS
    }

    /// Silent long enough that the address lease is void
    pub fn is_lease_expired(&self) -> bool {
        (self.last_heartbeat.elapsed().as_millis() as i64) >= LEASE_EXPIRY_MS
    }
}

/// Outcome of packet-level conflict detection
///
/// `winner` owns the address after resolution; `offender` is the user
/// that should be told to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConflict {
    pub offender: UserId,
    pub winner: NodeId,
    pub ipv4: Ipv4Addr,
}

/// Notifications to the heartbeat manager's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A remote node's lease ran out and it was dropped
    NodeExpired { node_id: NodeId, ipv4: Ipv4Addr },
}

#[derive(Default)]
struct Table {
    nodes: HashMap<NodeId, NodeInfo>,
    ip_to_node: HashMap<Ipv4Addr, NodeId>,
}

struct State {
    local_node: NodeId,
    local_ip: Option<Ipv4Addr>,
    last_sent: tokio::time::Instant,
    table: Table,
}

/// Periodic liveness broadcaster and node table owner
pub struct HeartbeatManager {
    state: Arc<Mutex<State>>,
    outbound: mpsc::UnboundedSender<ControlOut>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl HeartbeatManager {
    pub fn new(
        outbound: mpsc::UnboundedSender<ControlOut>,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                local_node: NodeId::zero(),
                local_ip: None,
                last_sent: tokio::time::Instant::now(),
                table: Table::default(),
            })),
            outbound,
            events,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Set the local identity after negotiation settles
    pub fn initialize(&self, local_node: NodeId, local_ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.local_node = local_node;
        state.local_ip = Some(local_ip);
        state.last_sent = tokio::time::Instant::now();
    }

    /// Update the local address after a renegotiation
    pub fn update_local_ip(&self, ip: Ipv4Addr) {
        self.state.lock().unwrap().local_ip = Some(ip);
    }

    /// Start the 1 Hz worker
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let outbound = self.outbound.clone();
        let events = self.events.clone();
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            info!(target: "network", "heartbeat worker started");
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        Self::tick(&state, &outbound, &events);
                    }
                    _ = shutdown.notified() => break,
                }
            }
            info!(target: "network", "heartbeat worker stopped");
        });
    }

    /// Stop the worker
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    /// Stop and forget everything
    pub fn reset(&self) {
        self.stop();
        let mut state = self.state.lock().unwrap();
        state.table = Table::default();
        state.local_node = NodeId::zero();
        state.local_ip = None;
        state.last_sent = tokio::time::Instant::now();
    }

    fn tick(
        state: &Arc<Mutex<State>>,
        outbound: &mpsc::UnboundedSender<ControlOut>,
        events: &mpsc::UnboundedSender<HeartbeatEvent>,
    ) {
        let beacon = {
            let mut state = state.lock().unwrap();
            let due = state.last_sent.elapsed().as_millis() as i64 >= HEARTBEAT_INTERVAL_MS;
            match state.local_ip {
                Some(ip) if due => {
                    state.last_sent = tokio::time::Instant::now();
                    Some(VpnMessage::Heartbeat {
                        ipv4: ip,
                        node_id: state.local_node,
                        timestamp_ms: epoch_millis(),
                    })
                }
                _ => None,
            }
        };
        if let Some(message) = beacon {
            let _ = outbound.send(ControlOut::Broadcast {
                message,
                delivery: Delivery::Reliable,
            });
        }

        let expired = {
            let mut state = state.lock().unwrap();
            let table = &mut state.table;
            let dead: Vec<(NodeId, Ipv4Addr)> = table
                .nodes
                .values()
                .filter(|n| !n.is_local && n.is_lease_expired())
                .map(|n| (n.node_id, n.ipv4))
                .collect();
            for (node_id, ipv4) in &dead {
                info!(target: "network", node = %node_id.short(), "node lease expired");
                table.nodes.remove(node_id);
                table.ip_to_node.remove(ipv4);
            }
            dead
        };
        for (node_id, ipv4) in expired {
            let _ = events.send(HeartbeatEvent::NodeExpired { node_id, ipv4 });
        }
    }

    /// Record a peer's beacon
    pub fn handle_heartbeat(
        &self,
        ipv4: Ipv4Addr,
        node_id: NodeId,
        peer: UserId,
        peer_name: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.table;
        if let Some(existing) = table.nodes.get_mut(&node_id) {
            existing.last_heartbeat = Instant::now();
        } else {
            table.nodes.insert(
                node_id,
                NodeInfo {
                    node_id,
                    user_id: peer,
                    ipv4,
                    last_heartbeat: Instant::now(),
                    display_name: peer_name.to_string(),
                    is_local: false,
                },
            );
            table.ip_to_node.insert(ipv4, node_id);
            debug!(target: "network", node = %node_id.short(), %ipv4, "node joined heartbeat table");
        }
    }

    /// Insert a node outright (local self-claim or route learning)
    pub fn register_node(&self, node_id: NodeId, user: UserId, ipv4: Ipv4Addr, name: &str) {
        let mut state = self.state.lock().unwrap();
        let is_local = node_id == state.local_node;
        let table = &mut state.table;
        table.nodes.insert(
            node_id,
            NodeInfo {
                node_id,
                user_id: user,
                ipv4,
                last_heartbeat: Instant::now(),
                display_name: name.to_string(),
                is_local,
            },
        );
        table.ip_to_node.insert(ipv4, node_id);
    }

    /// Remove a node and its reverse mapping
    pub fn unregister_node(&self, node_id: NodeId) {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.table;
        if let Some(info) = table.nodes.remove(&node_id) {
            table.ip_to_node.remove(&info.ipv4);
        }
    }

    /// Who owns an address, if anyone
    pub fn find_node_by_ip(&self, ip: Ipv4Addr) -> Option<NodeId> {
        self.state.lock().unwrap().table.ip_to_node.get(&ip).copied()
    }

    /// Snapshot of the node table
    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.state
            .lock()
            .unwrap()
            .table
            .nodes
            .values()
            .cloned()
            .collect()
    }

    /// Resolve an observed source address against the recorded owner
    ///
    /// If the established owner outranks the claimant, the claimant is
    /// the offender and the map is untouched. Otherwise ownership
    /// transfers to the claimant and the previous owner is the one told
    /// to release.
    pub fn detect_conflict(&self, source_ip: Ipv4Addr, claimant: NodeId) -> Option<PacketConflict> {
        let mut state = self.state.lock().unwrap();
        let table = &mut state.table;
        let owner = *table.ip_to_node.get(&source_ip)?;
        if owner == claimant {
            return None;
        }
        debug!(target: "network", %source_ip, "packet-level address conflict detected");

        if owner.has_priority_over(&claimant) {
            let offender = table.nodes.get(&claimant)?.user_id;
            Some(PacketConflict {
                offender,
                winner: owner,
                ipv4: source_ip,
            })
        } else {
            let previous = table.nodes.get(&owner)?.user_id;
            table.ip_to_node.insert(source_ip, claimant);
            Some(PacketConflict {
                offender: previous,
                winner: claimant,
                ipv4: source_ip,
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_node(&self, node_id: NodeId, age: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.table.nodes.get_mut(&node_id) {
            if let Some(then) = Instant::now().checked_sub(age) {
                info.last_heartbeat = then;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn run_sweep(&self) {
        Self::tick(&self.state, &self.outbound, &self.events);
    }
}
