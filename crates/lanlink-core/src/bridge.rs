//! TUN bridge
//!
//! Connects a virtual Layer-3 device to the overlay: packets read from
//! the TUN are classified (loopback, broadcast, routed unicast, drop)
//! and wrapped for the transport; incoming overlay messages are
//! demultiplexed into the negotiator, the heartbeat table or the TUN.
//! The bridge owns the negotiator, the heartbeat manager and the
//! routing table for its entire lifetime.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lanlink_net::tun::ip;
use lanlink_net::{Delivery, OverlayTransport, TunDevice};
use lanlink_proto::{NodeId, UserId, VpnMessage};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::config::OverlayConfig;
use crate::error::{CoreError, CoreResult};
use crate::heartbeat::{HeartbeatEvent, HeartbeatManager};
use crate::negotiator::{ControlOut, IpNegotiator, NegotiationPhase, NegotiatorEvent};
use crate::routes::{RouteEntry, RoutingTable};

/// How often negotiator timeouts are polled while the bridge runs
const NEGOTIATOR_POLL: Duration = Duration::from_millis(50);

/// Rolling traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
}

/// Bridge between the TUN device and the overlay transport
pub struct TunBridge {
    transport: Arc<OverlayTransport>,
    subnet: Ipv4Addr,
    subnet_mask: Ipv4Addr,

    tun: tokio::sync::RwLock<Option<Arc<dyn TunDevice>>>,
    negotiator: Mutex<IpNegotiator>,
    heartbeat: HeartbeatManager,
    routes: Mutex<RoutingTable>,
    local_ip: Mutex<Option<Ipv4Addr>>,

    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,

    running: AtomicBool,
    shutdown: Arc<Notify>,

    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlOut>>>,
    negotiator_rx: Mutex<Option<mpsc::UnboundedReceiver<NegotiatorEvent>>>,
    heartbeat_rx: Mutex<Option<mpsc::UnboundedReceiver<HeartbeatEvent>>>,
}

impl TunBridge {
    /// Build a bridge for the configured virtual subnet
    pub fn new(transport: Arc<OverlayTransport>, config: &OverlayConfig) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (negotiator_tx, negotiator_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();

        let node_id = NodeId::from_user_id(transport.local_user());
        let negotiator = IpNegotiator::new(
            node_id,
            config.subnet,
            config.subnet_mask,
            control_tx.clone(),
            negotiator_tx,
        );
        let heartbeat = HeartbeatManager::new(control_tx, heartbeat_tx);

        Arc::new(Self {
            transport,
            subnet: config.subnet,
            subnet_mask: config.subnet_mask,
            tun: tokio::sync::RwLock::new(None),
            negotiator: Mutex::new(negotiator),
            heartbeat,
            routes: Mutex::new(RoutingTable::new()),
            local_ip: Mutex::new(None),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            control_rx: Mutex::new(Some(control_rx)),
            negotiator_rx: Mutex::new(Some(negotiator_rx)),
            heartbeat_rx: Mutex::new(Some(heartbeat_rx)),
        })
    }

    /// Start the bridge on an opened TUN device
    pub async fn start(self: &Arc<Self>, tun: Arc<dyn TunDevice>) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyRunning);
        }
        info!(target: "network", device = tun.name(), "starting TUN bridge");
        *self.tun.write().await = Some(tun);

        self.spawn_control_pump();
        self.spawn_negotiator_events();
        self.spawn_heartbeat_events();

        self.negotiator.lock().unwrap().start_negotiation();
        self.spawn_tun_reader();
        Ok(())
    }

    /// Stop the bridge and tear down all state
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        self.heartbeat.reset();
        if let Some(tun) = self.tun.write().await.take() {
            if let Err(e) = tun.close().await {
                warn!(target: "network", error = %e, "error closing TUN device");
            }
        }
        self.routes.lock().unwrap().clear();
        self.negotiator.lock().unwrap().reset();
        *self.local_ip.lock().unwrap() = None;
        info!(target: "network", "TUN bridge stopped");
    }

    /// The negotiated local address, if any
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        *self.local_ip.lock().unwrap()
    }

    /// Current negotiation phase
    pub fn phase(&self) -> NegotiationPhase {
        self.negotiator.lock().unwrap().phase()
    }

    /// Traffic counters snapshot
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    /// Routing table snapshot
    pub fn routes(&self) -> Vec<RouteEntry> {
        self.routes.lock().unwrap().entries()
    }

    /// Re-announce the local address and routes after membership churn
    pub fn rebroadcast_state(&self) {
        let negotiator = self.negotiator.lock().unwrap();
        if negotiator.phase() != NegotiationPhase::Stable {
            return;
        }
        negotiator.send_address_announce();
        drop(negotiator);
        self.broadcast_route_update();
    }

    /// Transport-level peer join hook
    pub fn on_peer_joined(&self, peer: UserId) {
        let negotiator = self.negotiator.lock().unwrap();
        if negotiator.phase() == NegotiationPhase::Stable {
            debug!(target: "network", %peer, "sending address and routes to new peer");
            negotiator.send_address_announce_to(peer);
            drop(negotiator);
            self.send_route_update_to(peer);
        }
    }

    /// Transport-level peer leave hook
    pub fn on_peer_left(self: &Arc<Self>, peer: UserId) {
        let dropped = self.routes.lock().unwrap().remove_user(peer);
        {
            let mut negotiator = self.negotiator.lock().unwrap();
            for entry in &dropped {
                self.heartbeat.unregister_node(entry.node_id);
                negotiator.mark_unused(entry.ipv4);
            }
        }

        if peer == self.transport.local_user() {
            // We left the room ourselves; wind the bridge down.
            let bridge = Arc::clone(self);
            tokio::spawn(async move {
                bridge.stop().await;
            });
        }
    }

    /// Demultiplex one overlay message
    pub async fn handle_message(&self, peer: UserId, message: VpnMessage) {
        match message {
            VpnMessage::IpPacket {
                sender,
                source,
                datagram,
            } => {
                self.handle_ip_packet(peer, sender, source, datagram).await;
            }
            VpnMessage::RouteUpdate { routes } => {
                self.handle_route_update(routes);
            }
            VpnMessage::ProbeRequest { ipv4, node_id } => {
                self.negotiator
                    .lock()
                    .unwrap()
                    .handle_probe_request(ipv4, node_id, peer);
            }
            VpnMessage::ProbeResponse {
                ipv4,
                node_id,
                last_heartbeat_ms,
            } => {
                self.negotiator.lock().unwrap().handle_probe_response(
                    ipv4,
                    node_id,
                    last_heartbeat_ms,
                    peer,
                );
            }
            VpnMessage::AddressAnnounce { ipv4, node_id } => {
                let is_new = !self.routes.lock().unwrap().contains(ipv4);
                self.negotiator
                    .lock()
                    .unwrap()
                    .handle_address_announce(ipv4, node_id, peer);
                let name = self.transport.display_name(peer);
                self.update_route(node_id, peer, ipv4, &name);
                if is_new {
                    self.broadcast_route_update();
                }
            }
            VpnMessage::ForcedRelease { ipv4, winner } => {
                self.negotiator
                    .lock()
                    .unwrap()
                    .handle_forced_release(ipv4, winner);
            }
            VpnMessage::Heartbeat {
                ipv4,
                node_id,
                timestamp_ms: _,
            } => {
                let name = self.transport.display_name(peer);
                self.heartbeat.handle_heartbeat(ipv4, node_id, peer, &name);
            }
            VpnMessage::SessionHello => {}
        }
    }

    async fn handle_ip_packet(
        &self,
        peer: UserId,
        sender: NodeId,
        source: Ipv4Addr,
        datagram: Bytes,
    ) {
        // A packet stamped with our own id has looped back through the
        // mesh; forwarding it again could cycle forever.
        if sender == self.negotiator.lock().unwrap().node_id() {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let dest = ip::destination(&datagram);
        let conflict_ip = if source != Ipv4Addr::UNSPECIFIED {
            Some(source)
        } else {
            dest
        };
        if let Some(conflict_ip) = conflict_ip {
            if let Some(conflict) = self.heartbeat.detect_conflict(conflict_ip, sender) {
                debug!(
                    target: "network",
                    ip = %conflict.ipv4,
                    offender = %conflict.offender,
                    "resolving packet-level conflict"
                );
                // The release only goes to a conflicting node heard
                // about second-hand; the peer that carried this packet
                // is never answered directly.
                if conflict.offender != peer {
                    let release = VpnMessage::ForcedRelease {
                        ipv4: conflict.ipv4,
                        winner: conflict.winner,
                    };
                    let _ = self
                        .transport
                        .send_to(conflict.offender, &release.encode(), Delivery::Reliable);
                }
            }
        }

        let Some(dest) = dest else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if Some(dest) == self.local_ip() || self.is_broadcast(dest) {
            if let Some(tun) = self.tun.read().await.as_ref() {
                match tun.write(&datagram).await {
                    Ok(n) => {
                        self.packets_received.fetch_add(1, Ordering::Relaxed);
                        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(target: "network", error = %e, "TUN write failed");
                        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            return;
        }

        // Single mesh-forward hop: relay only toward the routed owner,
        // never back to the peer the packet came from.
        let target = {
            let routes = self.routes.lock().unwrap();
            routes
                .get(dest)
                .filter(|e| !e.is_local && e.user_id != peer)
                .map(|e| e.user_id)
        };
        if let Some(target) = target {
            let relayed = VpnMessage::IpPacket {
                sender,
                source,
                datagram,
            };
            let _ = self
                .transport
                .send_to(target, &relayed.encode(), Delivery::Unreliable);
            trace!(target: "network", %dest, %target, "relayed packet one hop");
        } else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_route_update(&self, routes: Vec<lanlink_proto::RoutePair>) {
        let local_user = self.transport.local_user();
        let network = u32::from(self.subnet) & u32::from(self.subnet_mask);
        for pair in routes {
            if pair.user_id == local_user {
                continue;
            }
            if self.routes.lock().unwrap().contains(pair.ipv4) {
                continue;
            }
            if u32::from(pair.ipv4) & u32::from(self.subnet_mask) != network {
                debug!(target: "network", ip = %pair.ipv4, "ignoring route outside subnet");
                continue;
            }
            let node_id = NodeId::from_user_id(pair.user_id);
            let name = self.transport.display_name(pair.user_id);
            self.update_route(node_id, pair.user_id, pair.ipv4, &name);
        }
    }

    /// Classify one packet read from the TUN and forward it
    pub(crate) async fn forward_outbound(&self, packet: Bytes) {
        let Some(dest) = ip::destination(&packet) else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let source = ip::source(&packet).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let local_ip = self.local_ip();

        if Some(dest) == local_ip {
            self.loopback(&packet).await;
            return;
        }

        if self.is_broadcast(dest) {
            let message = self.wrap_packet(source, packet.clone());
            let peers = self.transport.broadcast(&message, Delivery::Unreliable);
            self.packets_sent.fetch_add(peers as u64, Ordering::Relaxed);
            self.bytes_sent
                .fetch_add(packet.len() as u64 * peers as u64, Ordering::Relaxed);
            trace!(target: "network", %dest, peers, "broadcast packet");
            return;
        }

        let target = {
            let routes = self.routes.lock().unwrap();
            routes.get(dest).map(|entry| (entry.is_local, entry.user_id))
        };

        match target {
            Some((false, peer)) => {
                let message = self.wrap_packet(source, packet.clone());
                if self
                    .transport
                    .send_to(peer, &message, Delivery::Unreliable)
                    .is_ok()
                {
                    self.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.bytes_sent
                        .fetch_add(packet.len() as u64, Ordering::Relaxed);
                    trace!(target: "network", %dest, %peer, "forwarded packet");
                } else {
                    self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            // A routed entry marked local is our own claim; loop it back.
            Some((true, _)) => self.loopback(&packet).await,
            None => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn loopback(&self, packet: &[u8]) {
        if let Some(tun) = self.tun.read().await.as_ref() {
            match tun.write(packet).await {
                Ok(n) => {
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(target: "network", error = %e, "TUN loopback write failed");
                    self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn wrap_packet(&self, source: Ipv4Addr, datagram: Bytes) -> Bytes {
        let sender = self.negotiator.lock().unwrap().node_id();
        VpnMessage::IpPacket {
            sender,
            source,
            datagram,
        }
        .encode()
    }

    /// Broadcast / subnet-broadcast / multicast classifier
    pub(crate) fn is_broadcast(&self, ip: Ipv4Addr) -> bool {
        if ip == Ipv4Addr::BROADCAST {
            return true;
        }
        let subnet_broadcast =
            (u32::from(self.subnet) & u32::from(self.subnet_mask)) | !u32::from(self.subnet_mask);
        if u32::from(ip) == subnet_broadcast {
            return true;
        }
        let first_octet = ip.octets()[0];
        (224..=239).contains(&first_octet)
    }

    fn update_route(&self, node_id: NodeId, user: UserId, ipv4: Ipv4Addr, name: &str) {
        let is_local = user == self.transport.local_user();
        self.routes.lock().unwrap().upsert(RouteEntry {
            user_id: user,
            ipv4,
            display_name: name.to_string(),
            is_local,
            node_id,
        });
        self.negotiator.lock().unwrap().mark_used(ipv4);
        debug!(target: "network", %ipv4, name, "route updated");
    }

    fn broadcast_route_update(&self) {
        let pairs = self.routes.lock().unwrap().to_pairs();
        debug!(target: "network", entries = pairs.len(), "broadcasting route update");
        let message = VpnMessage::RouteUpdate { routes: pairs }.encode();
        self.transport.broadcast(&message, Delivery::Reliable);
    }

    fn send_route_update_to(&self, peer: UserId) {
        let pairs = self.routes.lock().unwrap().to_pairs();
        let message = VpnMessage::RouteUpdate { routes: pairs }.encode();
        let _ = self.transport.send_to(peer, &message, Delivery::Reliable);
    }

    // =====================
    // Background tasks
    // =====================

    fn spawn_control_pump(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let mut rx = self
            .control_rx
            .lock()
            .unwrap()
            .take()
            .expect("control pump started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    out = rx.recv() => {
                        let Some(out) = out else { break };
                        match out {
                            ControlOut::Unicast { peer, message, delivery } => {
                                if let Err(e) = bridge.transport.send_to(peer, &message.encode(), delivery) {
                                    debug!(target: "substrate", %peer, error = %e, "control send failed");
                                }
                            }
                            ControlOut::Broadcast { message, delivery } => {
                                bridge.transport.broadcast(&message.encode(), delivery);
                            }
                        }
                    }
                    _ = bridge.shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_negotiator_events(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let mut rx = self
            .negotiator_rx
            .lock()
            .unwrap()
            .take()
            .expect("negotiator event task started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            NegotiatorEvent::Claimed { ipv4, node_id } => {
                                bridge.on_address_claimed(ipv4, node_id).await;
                            }
                        }
                    }
                    _ = bridge.shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_heartbeat_events(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let mut rx = self
            .heartbeat_rx
            .lock()
            .unwrap()
            .take()
            .expect("heartbeat event task started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            HeartbeatEvent::NodeExpired { node_id, ipv4 } => {
                                debug!(target: "network", node = %node_id.short(), %ipv4, "dropping expired node");
                                bridge.routes.lock().unwrap().remove(ipv4);
                                bridge.negotiator.lock().unwrap().mark_unused(ipv4);
                            }
                        }
                    }
                    _ = bridge.shutdown.notified() => break,
                }
            }
        });
    }

    async fn on_address_claimed(&self, ipv4: Ipv4Addr, node_id: NodeId) {
        *self.local_ip.lock().unwrap() = Some(ipv4);

        let tun = self.tun.read().await.as_ref().cloned();
        let Some(tun) = tun else { return };

        if let Err(e) = tun.configure(ipv4, self.subnet_mask).await {
            warn!(target: "network", error = %e, "failed to configure TUN address");
            return;
        }
        if let Err(e) = tun.set_enabled(true).await {
            warn!(target: "network", error = %e, "failed to bring TUN up");
            return;
        }
        // Connected route so the OS hands subnet traffic to the device;
        // failure is survivable, traffic may still flow with an explicit
        // route added by the operator.
        let network = Ipv4Addr::from(u32::from(self.subnet) & u32::from(self.subnet_mask));
        if let Err(e) = tun.add_route(network, self.subnet_mask).await {
            warn!(target: "network", error = %e, "failed to add connected route");
        }

        let local_user = self.transport.local_user();
        let name = self.transport.display_name(local_user);
        self.update_route(node_id, local_user, ipv4, &name);
        self.heartbeat.initialize(node_id, ipv4);
        self.heartbeat.register_node(node_id, local_user, ipv4, &name);
        self.heartbeat.start();
        self.broadcast_route_update();
        info!(target: "network", %ipv4, "virtual address configured");
    }

    fn spawn_tun_reader(self: &Arc<Self>) {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            info!(target: "network", "TUN read loop started");
            let mut last_check = tokio::time::Instant::now();

            while bridge.running.load(Ordering::Relaxed) {
                let tun = bridge.tun.read().await.as_ref().cloned();
                let Some(tun) = tun else { break };

                match tokio::time::timeout(NEGOTIATOR_POLL, tun.read()).await {
                    Ok(Ok(packet)) => {
                        trace!(target: "network", len = packet.len(), "TUN read");
                        bridge.forward_outbound(packet).await;
                    }
                    Ok(Err(e)) => {
                        if !bridge.running.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(target: "network", error = %e, "TUN read error");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(_) => {} // poll deadline, fall through to the timeout check
                }

                if last_check.elapsed() >= NEGOTIATOR_POLL {
                    last_check = tokio::time::Instant::now();
                    bridge.negotiator.lock().unwrap().check_timeout();
                }
            }
            info!(target: "network", "TUN read loop stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_net::tun::memory::MemoryTun;
    use lanlink_net::MemoryHub;
    use lanlink_proto::{RoutePair, NODE_ID_SIZE};

    fn id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; NODE_ID_SIZE])
    }

    fn ip_packet(src: [u8; 4], dst: [u8; 4]) -> Bytes {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        Bytes::from(p)
    }

    struct Fixture {
        hub: MemoryHub,
        bridge: Arc<TunBridge>,
        tun: Arc<MemoryTun>,
    }

    async fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let local = hub.endpoint(UserId(1), "local");
        let transport = OverlayTransport::new(local);
        let config = OverlayConfig::default();
        let bridge = TunBridge::new(transport.clone(), &config);
        let tun = Arc::new(MemoryTun::new("test0", 1400));
        *bridge.tun.write().await = Some(tun.clone() as Arc<dyn TunDevice>);
        bridge.running.store(true, Ordering::SeqCst);
        bridge.spawn_control_pump();
        Fixture { hub, bridge, tun }
    }

    fn claim(fixture: &Fixture, ipv4: Ipv4Addr) {
        let node_id = fixture.bridge.negotiator.lock().unwrap().node_id();
        *fixture.bridge.local_ip.lock().unwrap() = Some(ipv4);
        fixture.bridge.update_route(node_id, UserId(1), ipv4, "local");
        fixture.bridge.heartbeat.initialize(node_id, ipv4);
        fixture
            .bridge
            .heartbeat
            .register_node(node_id, UserId(1), ipv4, "local");
    }

    fn add_peer_route(fixture: &Fixture, user: u64, node: NodeId, ipv4: Ipv4Addr) {
        fixture.hub.endpoint(UserId(user), "peer");
        fixture.bridge.transport.add_peer(UserId(user));
        fixture
            .bridge
            .update_route(node, UserId(user), ipv4, "peer");
        fixture
            .bridge
            .heartbeat
            .register_node(node, UserId(user), ipv4, "peer");
    }

    #[tokio::test]
    async fn test_broadcast_classifier() {
        let fixture = fixture().await;
        let bridge = &fixture.bridge;
        assert!(bridge.is_broadcast(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(bridge.is_broadcast(Ipv4Addr::new(10, 255, 255, 255))); // subnet broadcast for 10/8
        assert!(bridge.is_broadcast(Ipv4Addr::new(224, 0, 0, 251)));
        assert!(bridge.is_broadcast(Ipv4Addr::new(239, 255, 255, 250)));
        assert!(!bridge.is_broadcast(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(!bridge.is_broadcast(Ipv4Addr::new(192, 168, 1, 255)));
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_all_peers() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        for user in 2..=4 {
            fixture.hub.endpoint(UserId(user), "peer");
            fixture.bridge.transport.add_peer(UserId(user));
        }
        fixture.hub.clear_sent(UserId(1));

        let packet = ip_packet([10, 0, 0, 1], [255, 255, 255, 255]);
        let len = packet.len() as u64;
        fixture.bridge.forward_outbound(packet).await;

        let sent = fixture.hub.sent_by(UserId(1));
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, _, d)| *d == Delivery::Unreliable));
        let stats = fixture.bridge.stats();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.bytes_sent, 3 * len);
    }

    #[tokio::test]
    async fn test_routed_unicast() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        add_peer_route(&fixture, 2, id(0x22), Ipv4Addr::new(10, 0, 0, 2));
        fixture.hub.clear_sent(UserId(1));

        fixture
            .bridge
            .forward_outbound(ip_packet([10, 0, 0, 1], [10, 0, 0, 2]))
            .await;

        let sent = fixture.hub.sent_by(UserId(1));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, UserId(2));
        // The frame is a wrapped IP packet.
        let decoded = VpnMessage::decode(&sent[0].1).unwrap();
        assert!(matches!(decoded, VpnMessage::IpPacket { .. }));
        assert_eq!(fixture.bridge.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_unroutable_dropped() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));

        fixture
            .bridge
            .forward_outbound(ip_packet([10, 0, 0, 1], [10, 9, 9, 9]))
            .await;

        assert_eq!(fixture.bridge.stats().packets_dropped, 1);
        assert!(fixture.hub.sent_by(UserId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_local_destination_loops_back() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));

        let packet = ip_packet([10, 0, 0, 1], [10, 0, 0, 1]);
        fixture.bridge.forward_outbound(packet.clone()).await;

        let written = fixture.tun.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], packet);
        assert_eq!(fixture.bridge.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_incoming_packet_for_us_hits_tun() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));

        let datagram = ip_packet([10, 0, 0, 2], [10, 0, 0, 1]);
        fixture
            .bridge
            .handle_message(
                UserId(2),
                VpnMessage::IpPacket {
                    sender: id(0x22),
                    source: Ipv4Addr::new(10, 0, 0, 2),
                    datagram: datagram.clone(),
                },
            )
            .await;

        assert_eq!(fixture.tun.written(), vec![datagram]);
        assert_eq!(fixture.bridge.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_own_sender_id_dropped() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        let own_id = fixture.bridge.negotiator.lock().unwrap().node_id();

        fixture
            .bridge
            .handle_message(
                UserId(2),
                VpnMessage::IpPacket {
                    sender: own_id,
                    source: Ipv4Addr::new(10, 0, 0, 1),
                    datagram: ip_packet([10, 0, 0, 1], [10, 0, 0, 1]),
                },
            )
            .await;

        assert!(fixture.tun.written().is_empty());
        assert_eq!(fixture.bridge.stats().packets_dropped, 1);
    }

    #[tokio::test]
    async fn test_single_hop_relay_not_back_to_sender() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        add_peer_route(&fixture, 2, id(0x22), Ipv4Addr::new(10, 0, 0, 2));
        add_peer_route(&fixture, 3, id(0x33), Ipv4Addr::new(10, 0, 0, 3));
        fixture.hub.clear_sent(UserId(1));

        // Peer 2 sends a packet destined for peer 3: relay exactly once.
        fixture
            .bridge
            .handle_message(
                UserId(2),
                VpnMessage::IpPacket {
                    sender: id(0x22),
                    source: Ipv4Addr::new(10, 0, 0, 2),
                    datagram: ip_packet([10, 0, 0, 2], [10, 0, 0, 3]),
                },
            )
            .await;

        let sent = fixture.hub.sent_by(UserId(1));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, UserId(3));
        assert_eq!(sent[0].2, Delivery::Unreliable);

        // A packet destined back to its own sender is not relayed.
        fixture.hub.clear_sent(UserId(1));
        fixture
            .bridge
            .handle_message(
                UserId(2),
                VpnMessage::IpPacket {
                    sender: id(0x22),
                    source: Ipv4Addr::new(10, 0, 0, 2),
                    datagram: ip_packet([10, 0, 0, 9], [10, 0, 0, 2]),
                },
            )
            .await;
        assert!(fixture.hub.sent_by(UserId(1)).is_empty());
    }

    #[tokio::test]
    async fn test_packet_conflict_from_offender_not_bounced() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        // Established owner with high priority.
        add_peer_route(&fixture, 2, id(0x80), Ipv4Addr::new(10, 0, 0, 5));
        // The offender is known to the heartbeat table.
        fixture.hub.endpoint(UserId(3), "offender");
        fixture
            .bridge
            .heartbeat
            .register_node(id(0x10), UserId(3), Ipv4Addr::new(10, 0, 0, 6), "offender");
        fixture.hub.clear_sent(UserId(1));

        // The conflicting packet arrives from the offender itself: no
        // release goes back to the carrying peer.
        fixture
            .bridge
            .handle_message(
                UserId(3),
                VpnMessage::IpPacket {
                    sender: id(0x10),
                    source: Ipv4Addr::new(10, 0, 0, 5),
                    datagram: ip_packet([10, 0, 0, 5], [10, 0, 0, 1]),
                },
            )
            .await;

        let sent = fixture.hub.sent_by(UserId(1));
        assert!(
            !sent.iter().any(|(_, bytes, _)| matches!(
                VpnMessage::decode(bytes),
                Ok(VpnMessage::ForcedRelease { .. })
            )),
            "no forced release may be sent back to the offending sender"
        );
        // Reverse map unchanged: the established owner keeps the address.
        assert_eq!(
            fixture.bridge.heartbeat.find_node_by_ip(Ipv4Addr::new(10, 0, 0, 5)),
            Some(id(0x80))
        );
    }

    #[tokio::test]
    async fn test_packet_conflict_reported_by_third_party() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        // Established owner with high priority.
        add_peer_route(&fixture, 2, id(0x80), Ipv4Addr::new(10, 0, 0, 5));
        // The low-priority claimant and the relaying peer are distinct.
        fixture.hub.endpoint(UserId(3), "offender");
        fixture.hub.endpoint(UserId(4), "relayer");
        fixture
            .bridge
            .heartbeat
            .register_node(id(0x10), UserId(3), Ipv4Addr::new(10, 0, 0, 6), "offender");
        fixture.hub.clear_sent(UserId(1));

        // A relayed packet stamped with the claimant's id arrives from a
        // different peer: the claimant gets told to release.
        fixture
            .bridge
            .handle_message(
                UserId(4),
                VpnMessage::IpPacket {
                    sender: id(0x10),
                    source: Ipv4Addr::new(10, 0, 0, 5),
                    datagram: ip_packet([10, 0, 0, 5], [10, 0, 0, 1]),
                },
            )
            .await;

        let sent = fixture.hub.sent_by(UserId(1));
        let release = sent
            .iter()
            .find(|(to, _, _)| *to == UserId(3))
            .expect("forced release sent to the offending claimant");
        match VpnMessage::decode(&release.1).unwrap() {
            VpnMessage::ForcedRelease { ipv4, winner } => {
                assert_eq!(ipv4, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(winner, id(0x80));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Nothing goes back to the relaying peer.
        assert!(!sent.iter().any(|(to, bytes, _)| *to == UserId(4)
            && matches!(
                VpnMessage::decode(bytes),
                Ok(VpnMessage::ForcedRelease { .. })
            )));
        // Reverse map unchanged: the established owner keeps the address.
        assert_eq!(
            fixture.bridge.heartbeat.find_node_by_ip(Ipv4Addr::new(10, 0, 0, 5)),
            Some(id(0x80))
        );
    }

    #[tokio::test]
    async fn test_route_update_filtering() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        fixture.hub.endpoint(UserId(5), "p5");
        fixture.hub.endpoint(UserId(6), "p6");

        fixture.bridge.handle_message(
            UserId(5),
            VpnMessage::RouteUpdate {
                routes: vec![
                    // Entry for ourselves: ignored.
                    RoutePair {
                        user_id: UserId(1),
                        ipv4: Ipv4Addr::new(10, 0, 0, 77),
                    },
                    // Outside the subnet: ignored.
                    RoutePair {
                        user_id: UserId(5),
                        ipv4: Ipv4Addr::new(192, 168, 0, 5),
                    },
                    // Accepted.
                    RoutePair {
                        user_id: UserId(6),
                        ipv4: Ipv4Addr::new(10, 0, 0, 6),
                    },
                ],
            },
        )
        .await;

        let routes = fixture.bridge.routes();
        assert!(routes.iter().any(|r| r.ipv4 == Ipv4Addr::new(10, 0, 0, 6)));
        assert!(!routes.iter().any(|r| r.ipv4 == Ipv4Addr::new(10, 0, 0, 77)));
        assert!(!routes.iter().any(|r| r.ipv4 == Ipv4Addr::new(192, 168, 0, 5)));
        // Accepted addresses are marked used with the negotiator.
        assert!(fixture
            .bridge
            .negotiator
            .lock()
            .unwrap()
            .is_used(Ipv4Addr::new(10, 0, 0, 6)));
    }

    #[tokio::test]
    async fn test_peer_left_cleans_up() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        add_peer_route(&fixture, 2, id(0x22), Ipv4Addr::new(10, 0, 0, 2));

        fixture.bridge.on_peer_left(UserId(2));

        assert!(!fixture
            .bridge
            .routes()
            .iter()
            .any(|r| r.user_id == UserId(2)));
        assert!(!fixture
            .bridge
            .negotiator
            .lock()
            .unwrap()
            .is_used(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(
            fixture.bridge.heartbeat.find_node_by_ip(Ipv4Addr::new(10, 0, 0, 2)),
            None
        );
    }

    #[tokio::test]
    async fn test_self_leave_stops_bridge() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        add_peer_route(&fixture, 2, id(0x22), Ipv4Addr::new(10, 0, 0, 2));

        // The local user left the room: the bridge winds itself down.
        fixture.bridge.on_peer_left(UserId(1));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !fixture.tun.state().closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge never closed the TUN device");

        assert!(fixture.bridge.routes().is_empty());
        assert_eq!(fixture.bridge.local_ip(), None);
        assert_eq!(fixture.bridge.phase(), NegotiationPhase::Idle);
        assert!(!fixture.bridge.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_announce_learns_route_and_rebroadcasts() {
        let fixture = fixture().await;
        claim(&fixture, Ipv4Addr::new(10, 0, 0, 1));
        fixture.hub.endpoint(UserId(2), "peer");
        fixture.bridge.transport.add_peer(UserId(2));
        fixture.hub.clear_sent(UserId(1));

        fixture
            .bridge
            .handle_message(
                UserId(2),
                VpnMessage::AddressAnnounce {
                    ipv4: Ipv4Addr::new(10, 0, 0, 2),
                    node_id: id(0x22),
                },
            )
            .await;

        assert!(fixture.bridge.routes().iter().any(|r| r.ipv4 == Ipv4Addr::new(10, 0, 0, 2)));
        // New route triggers a route-update broadcast.
        let sent = fixture.hub.sent_by(UserId(1));
        assert!(sent.iter().any(|(_, bytes, _)| matches!(
            VpnMessage::decode(bytes),
            Ok(VpnMessage::RouteUpdate { .. })
        )));
    }
}
