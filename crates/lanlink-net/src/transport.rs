//! Overlay transport
//!
//! Owns the peer set on top of the session substrate: membership diffing,
//! session priming, broadcast fan-out and the narrow listener capability
//! that upper layers use to observe joins and leaves. Nothing here parses
//! payloads; it moves opaque bytes.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use lanlink_proto::{UserId, VpnMessage};
use tracing::{debug, info, warn};

use crate::substrate::{Delivery, InboundMessage, RealtimeStatus, SendError, Substrate, TransportTuning};

/// Hooks fired on peer membership changes
///
/// Deliberately narrow: upper layers get told who joined or left, and
/// may call back into the transport through its public surface only.
pub trait PeerListener: Send + Sync {
    fn peer_joined(&self, peer: UserId);
    fn peer_left(&self, peer: UserId);
}

/// Peer membership and send fan-out over the substrate
pub struct OverlayTransport {
    substrate: Arc<dyn Substrate>,
    peers: Mutex<BTreeSet<UserId>>,
    listener: Mutex<Option<Arc<dyn PeerListener>>>,
}

impl OverlayTransport {
    /// Wrap a substrate and apply the startup tuning
    pub fn new(substrate: Arc<dyn Substrate>) -> Arc<Self> {
        substrate.set_tuning(TransportTuning::default());
        Arc::new(Self {
            substrate,
            peers: Mutex::new(BTreeSet::new()),
            listener: Mutex::new(None),
        })
    }

    /// Register the single membership listener
    pub fn attach_listener(&self, listener: Arc<dyn PeerListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Remove the membership listener
    pub fn detach_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }

    /// The local user's id
    pub fn local_user(&self) -> UserId {
        self.substrate.local_user()
    }

    /// Best-effort display name for a peer
    pub fn display_name(&self, peer: UserId) -> String {
        self.substrate.display_name(peer)
    }

    /// Direct access for components that watch link health
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Add a peer to the overlay
    ///
    /// Opens the messaging session and primes it with a reliable
    /// zero-length hello so the first real message does not eat the
    /// session handshake latency. The local user is never added.
    pub fn add_peer(&self, peer: UserId) {
        if peer == self.substrate.local_user() {
            return;
        }
        let is_new = self.peers.lock().unwrap().insert(peer);
        if !is_new {
            return;
        }

        self.substrate.open_session(peer);
        match self
            .substrate
            .send(peer, &VpnMessage::SessionHello.encode(), Delivery::Reliable)
        {
            Ok(()) => info!(target: "substrate", %peer, "sent session hello"),
            Err(e) => warn!(target: "substrate", %peer, error = %e, "failed to send session hello"),
        }

        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.peer_joined(peer);
        }
    }

    /// Remove a peer and close its session
    pub fn remove_peer(&self, peer: UserId) {
        let removed = self.peers.lock().unwrap().remove(&peer);
        if !removed {
            return;
        }
        self.substrate.close_session(peer, "peer removed");
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.peer_left(peer);
        }
    }

    /// Reconcile the peer set against a desired membership
    pub fn sync_peers(&self, desired: &BTreeSet<UserId>) {
        let current: Vec<UserId> = self.peers();
        for peer in desired {
            self.add_peer(*peer);
        }
        for peer in current {
            if !desired.contains(&peer) {
                self.remove_peer(peer);
            }
        }
    }

    /// Drop every peer, closing all sessions
    pub fn clear_peers(&self) {
        for peer in self.peers() {
            self.remove_peer(peer);
        }
    }

    /// Snapshot of current peers
    pub fn peers(&self) -> Vec<UserId> {
        self.peers.lock().unwrap().iter().copied().collect()
    }

    /// Number of current peers
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Whether `peer` is currently in the overlay
    pub fn has_peer(&self, peer: UserId) -> bool {
        self.peers.lock().unwrap().contains(&peer)
    }

    /// Send bytes to one peer
    pub fn send_to(&self, peer: UserId, payload: &[u8], delivery: Delivery) -> Result<(), SendError> {
        self.substrate.send(peer, payload, delivery)
    }

    /// Send bytes to every peer; returns how many sends were attempted
    pub fn broadcast(&self, payload: &[u8], delivery: Delivery) -> usize {
        let peers = self.peers();
        for peer in &peers {
            if let Err(e) = self.substrate.send(*peer, payload, delivery) {
                debug!(target: "substrate", peer = %peer, error = %e, "broadcast send failed");
            }
        }
        peers.len()
    }

    /// Realtime link measurements for a peer
    pub fn peer_status(&self, peer: UserId) -> Option<RealtimeStatus> {
        self.substrate.status(peer)
    }

    /// Close a single peer's session without removing it from the set
    ///
    /// Part of the capability surface used by the link supervisor.
    pub fn close_peer(&self, peer: UserId, reason: &str) {
        self.substrate.close_session(peer, reason);
    }

    /// Drain inbound messages from the substrate
    pub fn receive(&self, max: usize) -> Vec<InboundMessage> {
        self.substrate.receive(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::substrate::Delivery;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }

    impl PeerListener for CountingListener {
        fn peer_joined(&self, _peer: UserId) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }
        fn peer_left(&self, _peer: UserId) {
            self.leaves.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (MemoryHub, Arc<OverlayTransport>) {
        let hub = MemoryHub::new();
        let endpoint = hub.endpoint(UserId(100), "local");
        let _peer = hub.endpoint(UserId(200), "remote");
        let transport = OverlayTransport::new(endpoint);
        (hub, transport)
    }

    #[test]
    fn test_add_peer_primes_session() {
        let (hub, transport) = setup();
        transport.add_peer(UserId(200));

        assert!(transport.has_peer(UserId(200)));
        let sent = hub.sent_by(UserId(100));
        assert_eq!(sent.len(), 1);
        // Zero-length hello: type 20, length 0.
        assert_eq!(&sent[0].1[..], &[20, 0, 0]);
        assert_eq!(sent[0].2, Delivery::Reliable);
    }

    #[test]
    fn test_add_peer_is_idempotent() {
        let (hub, transport) = setup();
        transport.add_peer(UserId(200));
        transport.add_peer(UserId(200));
        assert_eq!(hub.sent_by(UserId(100)).len(), 1);
        assert_eq!(transport.peer_count(), 1);
    }

    #[test]
    fn test_local_user_never_added() {
        let (_hub, transport) = setup();
        transport.add_peer(UserId(100));
        assert_eq!(transport.peer_count(), 0);
    }

    #[test]
    fn test_listener_sees_membership() {
        let (_hub, transport) = setup();
        let listener = Arc::new(CountingListener {
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
        });
        transport.attach_listener(listener.clone());

        transport.add_peer(UserId(200));
        transport.remove_peer(UserId(200));
        transport.remove_peer(UserId(200)); // second remove is a no-op

        assert_eq!(listener.joins.load(Ordering::SeqCst), 1);
        assert_eq!(listener.leaves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_peers_diffs() {
        let hub = MemoryHub::new();
        let local = hub.endpoint(UserId(1), "local");
        for id in 2..=4 {
            hub.endpoint(UserId(id), "peer");
        }
        let transport = OverlayTransport::new(local);
        transport.add_peer(UserId(2));
        transport.add_peer(UserId(3));

        let desired: BTreeSet<UserId> = [UserId(3), UserId(4)].into_iter().collect();
        transport.sync_peers(&desired);

        let mut peers = transport.peers();
        peers.sort();
        assert_eq!(peers, vec![UserId(3), UserId(4)]);
    }

    #[test]
    fn test_broadcast_reaches_every_peer() {
        let hub = MemoryHub::new();
        let local = hub.endpoint(UserId(1), "local");
        for id in 2..=4 {
            hub.endpoint(UserId(id), "peer");
        }
        let transport = OverlayTransport::new(local);
        for id in 2..=4 {
            transport.add_peer(UserId(id));
        }
        hub.clear_sent(UserId(1));

        let count = transport.broadcast(b"payload", Delivery::Unreliable);
        assert_eq!(count, 3);
        assert_eq!(hub.sent_by(UserId(1)).len(), 3);
    }

    #[test]
    fn test_startup_tuning_applied() {
        let (hub, _transport) = setup();
        let tuning = hub.tuning_of(UserId(100));
        assert_eq!(tuning, TransportTuning::default());
        assert_eq!(tuning.nagle_time_us, 0);
        assert_eq!(tuning.send_buffer_bytes, 2 * 1024 * 1024);
    }
}
