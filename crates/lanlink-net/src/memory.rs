//! In-memory session substrate
//!
//! A loss-free hub connecting any number of endpoints inside one
//! process. Link measurements (ping, quality, pending-reliable bytes)
//! and send failures are test-controlled, which makes the backpressure,
//! negotiation and supervisor paths exercisable without a real network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lanlink_proto::UserId;

use crate::substrate::{
    Delivery, InboundMessage, LinkState, RealtimeStatus, SendError, SessionEvent, Substrate,
    TransportTuning,
};

#[derive(Debug, Clone)]
struct LinkSim {
    state: LinkState,
    ping_ms: i32,
    quality_local: f32,
    quality_remote: f32,
    pending_reliable: usize,
}

impl Default for LinkSim {
    fn default() -> Self {
        Self {
            state: LinkState::Connected,
            ping_ms: 10,
            quality_local: 1.0,
            quality_remote: 1.0,
            pending_reliable: 0,
        }
    }
}

#[derive(Default)]
struct NodeState {
    name: String,
    inbox: VecDeque<InboundMessage>,
    events: VecDeque<SessionEvent>,
    links: HashMap<UserId, LinkSim>,
    fail_queue: VecDeque<SendError>,
    tuning: TransportTuning,
    relay_ping_ms: Option<u32>,
    sent_log: Vec<(UserId, Bytes, Delivery)>,
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<UserId, NodeState>,
}

/// Shared in-memory hub; clone handles freely
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and get its substrate endpoint
    pub fn endpoint(&self, user: UserId, name: &str) -> Arc<MemoryEndpoint> {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(user).or_default().name = name.to_string();
        Arc::new(MemoryEndpoint {
            inner: Arc::clone(&self.inner),
            user,
        })
    }

    /// Mark the link between two nodes connected in both directions
    pub fn connect(&self, a: UserId, b: UserId) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .nodes
            .entry(a)
            .or_default()
            .links
            .insert(b, LinkSim::default());
        inner
            .nodes
            .entry(b)
            .or_default()
            .links
            .insert(a, LinkSim::default());
    }

    /// Override pending-reliable bytes on `user`'s link toward `peer`
    pub fn set_pending_reliable(&self, user: UserId, peer: UserId, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            node.links.entry(peer).or_default().pending_reliable = bytes;
        }
    }

    /// Override link measurements on `user`'s link toward `peer`
    pub fn set_link_quality(
        &self,
        user: UserId,
        peer: UserId,
        state: LinkState,
        ping_ms: i32,
        quality: f32,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            let link = node.links.entry(peer).or_default();
            link.state = state;
            link.ping_ms = ping_ms;
            link.quality_local = quality;
            link.quality_remote = quality;
        }
    }

    /// Queue send failures returned by the next sends from `user`
    pub fn inject_send_failures(&self, user: UserId, failures: Vec<SendError>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            node.fail_queue.extend(failures);
        }
    }

    /// Queue a session lifecycle event for `user`
    pub fn push_event(&self, user: UserId, event: SessionEvent) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            node.events.push_back(event);
        }
    }

    /// Set the relay round-trip estimate reported to `user`
    pub fn set_relay_ping(&self, user: UserId, ping_ms: Option<u32>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            node.relay_ping_ms = ping_ms;
        }
    }

    /// The tuning last applied by `user`
    pub fn tuning_of(&self, user: UserId) -> TransportTuning {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&user)
            .map(|n| n.tuning)
            .unwrap_or_default()
    }

    /// Everything `user` has sent so far, in order
    pub fn sent_by(&self, user: UserId) -> Vec<(UserId, Bytes, Delivery)> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&user)
            .map(|n| n.sent_log.clone())
            .unwrap_or_default()
    }

    /// Drop the send log for `user`
    pub fn clear_sent(&self, user: UserId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&user) {
            node.sent_log.clear();
        }
    }

    /// Whether `user` currently has a link entry for `peer`
    pub fn has_link(&self, user: UserId, peer: UserId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&user)
            .map(|n| n.links.contains_key(&peer))
            .unwrap_or(false)
    }
}

/// One node's view of the hub
pub struct MemoryEndpoint {
    inner: Arc<Mutex<HubInner>>,
    user: UserId,
}

impl Substrate for MemoryEndpoint {
    fn local_user(&self) -> UserId {
        self.user
    }

    fn display_name(&self, peer: UserId) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&peer)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| peer.to_string())
    }

    fn send(&self, peer: UserId, payload: &[u8], delivery: Delivery) -> Result<(), SendError> {
        let mut inner = self.inner.lock().unwrap();

        let sender = inner
            .nodes
            .get_mut(&self.user)
            .ok_or(SendError::InvalidParameter)?;
        if let Some(err) = sender.fail_queue.pop_front() {
            return Err(err);
        }
        let payload = Bytes::copy_from_slice(payload);
        sender.sent_log.push((peer, payload.clone(), delivery));

        let receiver = inner.nodes.get_mut(&peer).ok_or(SendError::NoSession)?;
        receiver.inbox.push_back(InboundMessage {
            from: self.user,
            payload,
        });
        Ok(())
    }

    fn receive(&self, max: usize) -> Vec<InboundMessage> {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(&self.user) else {
            return Vec::new();
        };
        let take = max.min(node.inbox.len());
        node.inbox.drain(..take).collect()
    }

    fn status(&self, peer: UserId) -> Option<RealtimeStatus> {
        let inner = self.inner.lock().unwrap();
        let link = inner.nodes.get(&self.user)?.links.get(&peer)?;
        Some(RealtimeStatus {
            state: link.state,
            ping_ms: link.ping_ms,
            quality_local: link.quality_local,
            quality_remote: link.quality_remote,
            pending_reliable: link.pending_reliable,
        })
    }

    fn open_session(&self, peer: UserId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.user) {
            node.links.entry(peer).or_default();
        }
    }

    fn close_session(&self, peer: UserId, _reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.user) {
            node.links.remove(&peer);
        }
    }

    fn next_event(&self) -> Option<SessionEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.get_mut(&self.user)?.events.pop_front()
    }

    fn set_tuning(&self, tuning: TransportTuning) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.get_mut(&self.user) {
            node.tuning = tuning;
        }
    }

    fn relay_ping_estimate_ms(&self) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&self.user)?.relay_ping_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_receive() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(UserId(1), "a");
        let _b = hub.endpoint(UserId(2), "b");
        hub.connect(UserId(1), UserId(2));

        a.send(UserId(2), b"hello", Delivery::Reliable).unwrap();

        let b = hub.endpoint(UserId(2), "b");
        let got = b.receive(10);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, UserId(1));
        assert_eq!(&got[0].payload[..], b"hello");
    }

    #[test]
    fn test_injected_failures_surface_in_order() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(UserId(1), "a");
        let _b = hub.endpoint(UserId(2), "b");
        hub.inject_send_failures(UserId(1), vec![SendError::LimitExceeded]);

        assert_eq!(
            a.send(UserId(2), b"x", Delivery::Reliable),
            Err(SendError::LimitExceeded)
        );
        assert!(a.send(UserId(2), b"x", Delivery::Reliable).is_ok());
    }

    #[test]
    fn test_status_reflects_overrides() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(UserId(1), "a");
        hub.connect(UserId(1), UserId(2));
        hub.set_pending_reliable(UserId(1), UserId(2), 7 * 1024 * 1024);

        let status = a.status(UserId(2)).unwrap();
        assert_eq!(status.pending_reliable, 7 * 1024 * 1024);
        assert!(a.status(UserId(9)).is_none());
    }

    #[test]
    fn test_receive_respects_max() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(UserId(1), "a");
        let b = hub.endpoint(UserId(2), "b");
        hub.connect(UserId(1), UserId(2));
        for _ in 0..5 {
            a.send(UserId(2), b"m", Delivery::Unreliable).unwrap();
        }
        assert_eq!(b.receive(3).len(), 3);
        assert_eq!(b.receive(3).len(), 2);
    }
}
