//! Overlay node engine
//!
//! Wires the transport, the link supervisor and the mode-specific data
//! path together. In TCP mode a local listener feeds per-peer
//! multiplexers and discovery bridges; in TUN mode every message goes
//! through the TUN bridge. One poll task pumps the substrate with
//! adaptive pacing, one tick task drives session health.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanlink_net::substrate::{Substrate, SessionEvent};
use lanlink_net::tun::TunConfig;
use lanlink_net::{
    AdaptivePoll, LinkSupervisor, OverlayTransport, PeerListener, SupervisorEvent, TunDevice,
};
use lanlink_proto::{discovery, VpnMessage, VpnMessageType, UserId};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::bridge::TunBridge;
use crate::config::{OverlayConfig, OverlayMode};
use crate::discovery::DiscoveryBridge;
use crate::error::{CoreError, CoreResult};
use crate::mux::MuxEndpoint;

/// Supervisor tick period
const HEALTH_TICK: Duration = Duration::from_millis(100);

/// Max messages drained per poll round
const POLL_BATCH: usize = 64;

/// Events surfaced to the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerJoined(UserId),
    PeerLeft(UserId),
    /// The session is being re-established through the relay network
    RelayRetry(UserId),
    /// The session is gone for good; the boundary decides what to do
    /// (for a lobby, leave it)
    SessionFatal { peer: UserId, reason: String },
    /// A duplicate session to the peer was closed
    DuplicateClosed(UserId),
}

/// A running overlay node
pub struct OverlayNode {
    config: OverlayConfig,
    transport: Arc<OverlayTransport>,
    supervisor: Arc<LinkSupervisor>,

    bridge: Mutex<Option<Arc<TunBridge>>>,
    muxes: Mutex<HashMap<UserId, Arc<MuxEndpoint>>>,
    discoveries: Mutex<HashMap<UserId, Arc<DiscoveryBridge>>>,
    tunnel_peer: Mutex<Option<UserId>>,
    listener_port: Mutex<Option<u16>>,

    events: mpsc::UnboundedSender<NodeEvent>,
    supervisor_rx: Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,

    path_pref_applied: AtomicBool,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl OverlayNode {
    /// Build a node; the receiver carries boundary events
    pub fn new(
        substrate: Arc<dyn Substrate>,
        config: OverlayConfig,
    ) -> CoreResult<(Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>)> {
        config.validate()?;

        let transport = OverlayTransport::new(Arc::clone(&substrate));
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(LinkSupervisor::new(substrate, supervisor_tx));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let node = Arc::new(Self {
            config,
            transport,
            supervisor,
            bridge: Mutex::new(None),
            muxes: Mutex::new(HashMap::new()),
            discoveries: Mutex::new(HashMap::new()),
            tunnel_peer: Mutex::new(None),
            listener_port: Mutex::new(None),
            events: events_tx,
            supervisor_rx: Mutex::new(Some(supervisor_rx)),
            path_pref_applied: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        });
        Ok((node, events_rx))
    }

    /// The overlay transport (peer membership lives here)
    pub fn transport(&self) -> &Arc<OverlayTransport> {
        &self.transport
    }

    /// TUN bridge, when running in TUN mode
    pub fn bridge(&self) -> Option<Arc<TunBridge>> {
        self.bridge.lock().unwrap().clone()
    }

    /// Actual local listener port, when running in TCP mode
    pub fn listener_port(&self) -> Option<u16> {
        *self.listener_port.lock().unwrap()
    }

    /// Start the node in its configured mode
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyRunning);
        }
        info!(mode = ?self.config.mode, "starting overlay node");

        self.transport
            .attach_listener(Arc::new(NodeListener(Arc::clone(self))) as Arc<dyn PeerListener>);

        match self.config.mode {
            OverlayMode::Tun => {
                let tun = lanlink_net::create_tun(TunConfig {
                    name: self.config.tun_name.clone(),
                    mtu: self.config.mtu,
                })
                .await?;
                self.start_with_tun(Arc::from(tun)).await?;
            }
            OverlayMode::Tcp => {
                self.spawn_tcp_listener().await?;
            }
        }

        self.spawn_poll_task();
        self.spawn_health_task();
        Ok(())
    }

    /// Start TUN mode on an already-opened device
    ///
    /// Separated from [`start`] so tests and embedders can supply their
    /// own device.
    pub async fn start_with_tun(self: &Arc<Self>, tun: Arc<dyn TunDevice>) -> CoreResult<()> {
        let bridge = TunBridge::new(Arc::clone(&self.transport), &self.config);
        bridge.start(tun).await?;
        *self.bridge.lock().unwrap() = Some(bridge);

        if !self.running.swap(true, Ordering::SeqCst) {
            // Direct entry (tests): the poll and health tasks have not
            // been spawned by start().
            self.transport
                .attach_listener(Arc::new(NodeListener(Arc::clone(self))) as Arc<dyn PeerListener>);
            self.spawn_poll_task();
            self.spawn_health_task();
        }
        Ok(())
    }

    /// Stop the node and release every resource
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let bridge = self.bridge.lock().unwrap().take();
        if let Some(bridge) = bridge {
            bridge.stop().await;
        }
        for (_, mux) in self.muxes.lock().unwrap().drain() {
            mux.shutdown();
        }
        for (_, discovery) in self.discoveries.lock().unwrap().drain() {
            discovery.stop();
        }
        self.transport.detach_listener();
        self.transport.clear_peers();
        info!("overlay node stopped");
    }

    fn mux_for(&self, peer: UserId) -> Arc<MuxEndpoint> {
        let mut muxes = self.muxes.lock().unwrap();
        Arc::clone(muxes.entry(peer).or_insert_with(|| {
            MuxEndpoint::new(
                Arc::clone(self.transport.substrate()),
                peer,
                self.config.publish,
                self.config.local_port,
            )
        }))
    }

    async fn discovery_for(&self, peer: UserId) -> Option<Arc<DiscoveryBridge>> {
        {
            let discoveries = self.discoveries.lock().unwrap();
            if let Some(existing) = discoveries.get(&peer) {
                return Some(Arc::clone(existing));
            }
        }
        match DiscoveryBridge::new(
            Arc::clone(self.transport.substrate()),
            peer,
            self.config.publish,
        )
        .await
        {
            Ok(bridge) => {
                bridge.start();
                self.discoveries
                    .lock()
                    .unwrap()
                    .insert(peer, Arc::clone(&bridge));
                Some(bridge)
            }
            Err(e) => {
                // Port 4445 may already be claimed by another bridge or
                // application; discovery is best effort.
                debug!(target: "network", %peer, error = %e, "discovery bridge unavailable");
                None
            }
        }
    }

    async fn spawn_tcp_listener(self: &Arc<Self>) -> CoreResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.bind_port)).await?;
        let port = listener.local_addr()?.port();
        *self.listener_port.lock().unwrap() = Some(port);
        info!(target: "network", port, "TCP listener started");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let peer = *node.tunnel_peer.lock().unwrap();
                                match peer {
                                    Some(peer) => {
                                        let id = node.mux_for(peer).add_client(stream);
                                        debug!(target: "network", %addr, %id, "local client attached");
                                    }
                                    None => {
                                        debug!(target: "network", %addr, "no tunnel peer, dropping local client");
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(target: "network", error = %e, "accept failed");
                            }
                        }
                    }
                    _ = node.shutdown.notified() => break,
                }
            }
        });
        Ok(())
    }

    fn spawn_poll_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut poll = match self.config.mode {
            OverlayMode::Tun => AdaptivePoll::fine(),
            OverlayMode::Tcp => AdaptivePoll::coarse(),
        };

        tokio::spawn(async move {
            info!(target: "substrate", "message pump started");
            while node.running.load(Ordering::Relaxed) {
                let messages = node.transport.receive(POLL_BATCH);
                let count = messages.len();
                for message in messages {
                    node.dispatch(message.from, &message.payload).await;
                }
                poll.record(count);

                let delay = poll.delay();
                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = node.shutdown.notified() => break,
                    }
                }
            }
            info!(target: "substrate", "message pump stopped");
        });
    }

    async fn dispatch(&self, peer: UserId, payload: &[u8]) {
        match self.config.mode {
            OverlayMode::Tun => {
                // Session primers never reach the bridge.
                if VpnMessage::peek_type(payload) == Some(VpnMessageType::SessionHello as u8)
                    && payload.len() == lanlink_proto::vpn::VPN_HEADER_LEN
                {
                    return;
                }
                let message = match VpnMessage::decode(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(target: "network", %peer, error = %e, "undecodable overlay message");
                        return;
                    }
                };
                let bridge = self.bridge.lock().unwrap().clone();
                if let Some(bridge) = bridge {
                    bridge.handle_message(peer, message).await;
                }
            }
            OverlayMode::Tcp => {
                // Session primers are transport-internal in either mode.
                if payload.len() == lanlink_proto::vpn::VPN_HEADER_LEN
                    && VpnMessage::peek_type(payload) == Some(VpnMessageType::SessionHello as u8)
                {
                    return;
                }
                if discovery::is_discovery_frame(payload) {
                    if let Some(bridge) = self.discovery_for(peer).await {
                        bridge.handle_frame(payload).await;
                    }
                } else {
                    self.mux_for(peer).handle_frame(payload).await;
                }
            }
        }
    }

    fn spawn_health_task(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut supervisor_rx = self
            .supervisor_rx
            .lock()
            .unwrap()
            .take()
            .expect("health task started twice");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while node.running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Lifecycle events feed the duplicate/failure rules.
                        while let Some(event) = node.transport.substrate().next_event() {
                            node.on_session_event(&event);
                        }
                        node.supervisor.tick();
                        node.maybe_apply_path_preference();
                    }
                    event = supervisor_rx.recv() => {
                        let Some(event) = event else { break };
                        node.on_supervisor_event(event);
                    }
                    _ = node.shutdown.notified() => break,
                }
            }
        });
    }

    fn on_session_event(&self, event: &SessionEvent) {
        self.supervisor.handle_event(event);
    }

    fn on_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::RelayRetry { peer } => {
                info!(target: "substrate", %peer, "re-establishing session via relay");
                // Re-prime the session; the substrate applies the
                // relay-only tuning on the new attempt.
                self.transport.substrate().open_session(peer);
                let _ = self.events.send(NodeEvent::RelayRetry(peer));
            }
            SupervisorEvent::SessionFatal { peer, reason } => {
                let _ = self.events.send(NodeEvent::SessionFatal { peer, reason });
            }
            SupervisorEvent::DuplicateClosed { peer } => {
                let _ = self.events.send(NodeEvent::DuplicateClosed(peer));
            }
        }
    }

    /// Once a direct link is measurable, bias path selection
    fn maybe_apply_path_preference(&self) {
        if self.path_pref_applied.load(Ordering::Relaxed) {
            return;
        }
        let direct_ping = self
            .transport
            .peers()
            .iter()
            .filter_map(|p| self.transport.peer_status(*p))
            .filter(|s| s.ping_ms > 0)
            .map(|s| s.ping_ms)
            .min();
        if let Some(ping) = direct_ping {
            if !self.path_pref_applied.swap(true, Ordering::Relaxed) {
                self.supervisor.apply_path_preference(Some(ping));
            }
        }
    }

    fn on_peer_joined(&self, peer: UserId) {
        self.supervisor.track(peer);
        {
            let mut tunnel_peer = self.tunnel_peer.lock().unwrap();
            if tunnel_peer.is_none() {
                *tunnel_peer = Some(peer);
            }
        }
        if let Some(bridge) = self.bridge.lock().unwrap().clone() {
            bridge.on_peer_joined(peer);
        }
        let _ = self.events.send(NodeEvent::PeerJoined(peer));
    }

    fn on_peer_left(&self, peer: UserId) {
        self.supervisor.untrack(peer);
        {
            let mut tunnel_peer = self.tunnel_peer.lock().unwrap();
            if *tunnel_peer == Some(peer) {
                *tunnel_peer = self.transport.peers().into_iter().find(|p| *p != peer);
            }
        }
        if let Some(mux) = self.muxes.lock().unwrap().remove(&peer) {
            mux.shutdown();
        }
        if let Some(discovery) = self.discoveries.lock().unwrap().remove(&peer) {
            discovery.stop();
        }
        if let Some(bridge) = self.bridge.lock().unwrap().clone() {
            bridge.on_peer_left(peer);
        }
        let _ = self.events.send(NodeEvent::PeerLeft(peer));
    }

    /// Local virtual address, when TUN mode has settled
    pub fn local_virtual_ip(&self) -> Option<Ipv4Addr> {
        self.bridge.lock().unwrap().as_ref().and_then(|b| b.local_ip())
    }

    /// Boundary notification that a user left the room
    ///
    /// The room membership source calls this for every departure it
    /// observes. Remote users are dropped from the overlay; when the
    /// departing user is ourselves the data path winds down while the
    /// engine stays available for a later rejoin.
    pub fn notify_user_left(&self, user: UserId) {
        if user == self.transport.local_user() {
            info!(target: "network", "left the room, winding down data path");
            let bridge = self.bridge.lock().unwrap().clone();
            if let Some(bridge) = bridge {
                bridge.on_peer_left(user);
            }
        } else {
            self.transport.remove_peer(user);
        }
    }
}

/// Membership hook wiring the transport to the node
struct NodeListener(Arc<OverlayNode>);

impl PeerListener for NodeListener {
    fn peer_joined(&self, peer: UserId) {
        self.0.on_peer_joined(peer);
    }

    fn peer_left(&self, peer: UserId) {
        self.0.on_peer_left(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_net::MemoryHub;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn tcp_config(publish: bool, local_port: u16) -> OverlayConfig {
        OverlayConfig {
            mode: OverlayMode::Tcp,
            publish,
            local_port,
            bind_port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tcp_tunnel_end_to_end() {
        let hub = MemoryHub::new();
        let a_sub = hub.endpoint(UserId(1), "a");
        let b_sub = hub.endpoint(UserId(2), "b");
        hub.connect(UserId(1), UserId(2));

        // Host-side echo service.
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = service.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let (a, _a_events) = OverlayNode::new(a_sub, tcp_config(false, 0)).unwrap();
        let (b, _b_events) = OverlayNode::new(b_sub, tcp_config(true, service_port)).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.transport().add_peer(UserId(2));
        b.transport().add_peer(UserId(1));

        // Connect through A's listener and push bytes across the tunnel.
        let port = a.listener_port().unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping over the overlay").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf[..n], b"ping over the overlay");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_peer_events_surface() {
        let hub = MemoryHub::new();
        let a_sub = hub.endpoint(UserId(1), "a");
        hub.endpoint(UserId(2), "b");
        hub.connect(UserId(1), UserId(2));

        let (a, mut events) = OverlayNode::new(a_sub, tcp_config(false, 0)).unwrap();
        a.start().await.unwrap();

        a.transport().add_peer(UserId(2));
        assert_eq!(events.recv().await, Some(NodeEvent::PeerJoined(UserId(2))));
        a.transport().remove_peer(UserId(2));
        assert_eq!(events.recv().await, Some(NodeEvent::PeerLeft(UserId(2))));

        a.stop().await;
    }

    #[tokio::test]
    async fn test_room_leave_notifications() {
        let hub = MemoryHub::new();
        let a_sub = hub.endpoint(UserId(1), "a");
        hub.endpoint(UserId(2), "b");
        hub.connect(UserId(1), UserId(2));

        let config = OverlayConfig {
            mode: OverlayMode::Tun,
            ..Default::default()
        };
        let (a, mut events) = OverlayNode::new(a_sub, config).unwrap();
        let tun = Arc::new(lanlink_net::tun::memory::MemoryTun::new("t0", 1400));
        a.start_with_tun(tun.clone() as Arc<dyn TunDevice>)
            .await
            .unwrap();
        a.transport().add_peer(UserId(2));
        assert_eq!(events.recv().await, Some(NodeEvent::PeerJoined(UserId(2))));

        // A remote departure drops the peer from the overlay.
        a.notify_user_left(UserId(2));
        assert_eq!(events.recv().await, Some(NodeEvent::PeerLeft(UserId(2))));
        assert_eq!(a.transport().peer_count(), 0);

        // Our own departure winds the data path down.
        a.notify_user_left(UserId(1));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !tun.state().closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge never closed the TUN device");
        assert_eq!(a.local_virtual_ip(), None);

        a.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let hub = MemoryHub::new();
        let a_sub = hub.endpoint(UserId(1), "a");
        let (a, _events) = OverlayNode::new(a_sub, tcp_config(false, 0)).unwrap();
        a.start().await.unwrap();
        assert!(matches!(a.start().await, Err(CoreError::AlreadyRunning)));
        a.stop().await;
    }
}
