//! LAN discovery bridge
//!
//! Carries LAN service-discovery UDP broadcasts over the tunnel. The
//! client side captures local broadcasts to the discovery port, tags
//! them with a request id and ships them to the host; the host
//! re-broadcasts them on its own LAN and returns any response under the
//! most recent request id. Correlation is best effort: unknown ids are
//! dropped.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lanlink_net::substrate::{Delivery, Substrate};
use lanlink_proto::discovery::{DiscoveryFrame, DiscoveryKind, DISCOVERY_PORT};
use lanlink_proto::UserId;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::CoreResult;

/// Receive buffer for LAN datagrams
const RECV_BUFFER: usize = 2048;

struct DiscoveryShared {
    substrate: Arc<dyn Substrate>,
    peer: UserId,
    is_host: bool,
    socket: UdpSocket,
    port: u16,

    next_request_id: Mutex<u16>,
    pending_origins: Mutex<HashMap<u16, SocketAddr>>,
    active_request: Mutex<Option<u16>>,
    running: AtomicBool,
}

/// Bridges the local discovery port over the tunnel to one peer
pub struct DiscoveryBridge {
    shared: Arc<DiscoveryShared>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryBridge {
    /// Bind the well-known discovery port
    pub async fn new(substrate: Arc<dyn Substrate>, peer: UserId, is_host: bool) -> CoreResult<Arc<Self>> {
        Self::bind_on(substrate, peer, is_host, DISCOVERY_PORT).await
    }

    /// Bind a specific port (0 lets the OS pick)
    pub async fn bind_on(
        substrate: Arc<dyn Substrate>,
        peer: UserId,
        is_host: bool,
        port: u16,
    ) -> CoreResult<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();

        Ok(Arc::new(Self {
            shared: Arc::new(DiscoveryShared {
                substrate,
                peer,
                is_host,
                socket,
                port,
                next_request_id: Mutex::new(1),
                pending_origins: Mutex::new(HashMap::new()),
                active_request: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            recv_task: Mutex::new(None),
        }))
    }

    /// The bound discovery port
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Start listening for LAN datagrams
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            target: "network",
            port = self.shared.port,
            role = if self.shared.is_host { "host" } else { "client" },
            "discovery bridge listening"
        );

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            while shared.running.load(Ordering::SeqCst) {
                let (len, origin) = match shared.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        if shared.running.load(Ordering::SeqCst) {
                            warn!(target: "network", error = %e, "discovery receive failed");
                        }
                        break;
                    }
                };
                if len == 0 {
                    continue;
                }
                shared.on_local_datagram(&buf[..len], origin);
            }
        });
        *self.recv_task.lock().unwrap() = Some(task);
    }

    /// Stop listening
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Dispatch a discovery frame received from the tunnel
    pub async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match DiscoveryFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "network", error = %e, "bad discovery frame");
                return;
            }
        };

        match frame.kind {
            DiscoveryKind::Request if self.shared.is_host => {
                self.forward_to_broadcast(frame.request_id, &frame.payload)
                    .await;
            }
            DiscoveryKind::Response if !self.shared.is_host => {
                self.forward_response_to_origin(frame.request_id, &frame.payload)
                    .await;
            }
            _ => {} // role mismatch, drop
        }
    }

    /// Re-broadcast a tunnelled request on the local LAN
    async fn forward_to_broadcast(&self, request_id: u16, payload: &[u8]) {
        *self.shared.active_request.lock().unwrap() = Some(request_id);
        if let Err(e) = self
            .shared
            .socket
            .send_to(payload, (Ipv4Addr::BROADCAST, self.shared.port))
            .await
        {
            warn!(target: "network", error = %e, "failed to broadcast LAN request");
        }
    }

    /// Return a tunnelled response to whoever asked originally
    async fn forward_response_to_origin(&self, request_id: u16, payload: &[u8]) {
        let origin = self
            .shared
            .pending_origins
            .lock()
            .unwrap()
            .get(&request_id)
            .copied();
        let Some(origin) = origin else {
            debug!(target: "network", request_id, "response for unknown request");
            return;
        };
        if let Err(e) = self.shared.socket.send_to(payload, origin).await {
            warn!(target: "network", error = %e, %origin, "failed to return LAN response");
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_local_datagram(&self, payload: &[u8], origin: SocketAddr) {
        self.shared.on_local_datagram(payload, origin);
    }

    #[cfg(test)]
    pub(crate) fn active_request(&self) -> Option<u16> {
        *self.shared.active_request.lock().unwrap()
    }
}

impl DiscoveryShared {
    /// A datagram arrived on the local discovery port
    fn on_local_datagram(&self, payload: &[u8], origin: SocketAddr) {
        if !self.is_host {
            // Client: remember who asked, ship the request to the host.
            let request_id = {
                let mut next = self.next_request_id.lock().unwrap();
                let id = *next;
                *next = next.wrapping_add(1);
                id
            };
            self.pending_origins
                .lock()
                .unwrap()
                .insert(request_id, origin);
            let frame = DiscoveryFrame {
                kind: DiscoveryKind::Request,
                request_id,
                payload: Bytes::copy_from_slice(payload),
            };
            if let Err(e) = self
                .substrate
                .send(self.peer, &frame.encode(), Delivery::Reliable)
            {
                debug!(target: "substrate", error = %e, "failed to tunnel discovery request");
            }
        } else {
            // Host: a LAN service answered our re-broadcast.
            let active = *self.active_request.lock().unwrap();
            if let Some(request_id) = active {
                let frame = DiscoveryFrame {
                    kind: DiscoveryKind::Response,
                    request_id,
                    payload: Bytes::copy_from_slice(payload),
                };
                if let Err(e) = self
                    .substrate
                    .send(self.peer, &frame.encode(), Delivery::Reliable)
                {
                    debug!(target: "substrate", error = %e, "failed to tunnel discovery response");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_net::MemoryHub;

    const LOCAL: UserId = UserId(1);
    const REMOTE: UserId = UserId(2);

    async fn bridge(hub: &MemoryHub, is_host: bool) -> Arc<DiscoveryBridge> {
        let endpoint = hub.endpoint(LOCAL, "local");
        hub.endpoint(REMOTE, "remote");
        hub.connect(LOCAL, REMOTE);
        DiscoveryBridge::bind_on(endpoint, REMOTE, is_host, 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_tags_and_tunnels_requests() {
        let hub = MemoryHub::new();
        let bridge = bridge(&hub, false).await;
        let origin: SocketAddr = "192.168.1.50:33333".parse().unwrap();

        bridge.inject_local_datagram(b"anyone there?", origin);
        bridge.inject_local_datagram(b"still there?", origin);

        let sent = hub.sent_by(LOCAL);
        assert_eq!(sent.len(), 2);
        let first = DiscoveryFrame::decode(&sent[0].1).unwrap();
        let second = DiscoveryFrame::decode(&sent[1].1).unwrap();
        assert_eq!(first.kind, DiscoveryKind::Request);
        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);
        assert_eq!(&first.payload[..], b"anyone there?");
        assert_eq!(sent[0].2, Delivery::Reliable);
    }

    #[tokio::test]
    async fn test_client_returns_response_to_origin() {
        let hub = MemoryHub::new();
        let bridge = bridge(&hub, false).await;

        // The origin is a real local socket so we can observe delivery.
        let origin_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin = origin_socket.local_addr().unwrap();
        bridge.inject_local_datagram(b"query", origin);

        let response = DiscoveryFrame {
            kind: DiscoveryKind::Response,
            request_id: 1,
            payload: Bytes::from_static(b"server here"),
        };
        bridge.handle_frame(&response.encode()).await;

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            origin_socket.recv_from(&mut buf),
        )
        .await
        .expect("no response delivered")
        .unwrap();
        assert_eq!(&buf[..n], b"server here");
    }

    #[tokio::test]
    async fn test_unknown_response_id_dropped() {
        let hub = MemoryHub::new();
        let bridge = bridge(&hub, false).await;

        let response = DiscoveryFrame {
            kind: DiscoveryKind::Response,
            request_id: 77,
            payload: Bytes::from_static(b"orphan"),
        };
        // Must not panic or send anything.
        bridge.handle_frame(&response.encode()).await;
        assert!(hub.sent_by(LOCAL).is_empty());
    }

    #[tokio::test]
    async fn test_host_tracks_active_request_and_answers() {
        let hub = MemoryHub::new();
        let bridge = bridge(&hub, true).await;

        let request = DiscoveryFrame {
            kind: DiscoveryKind::Request,
            request_id: 9,
            payload: Bytes::from_static(b"who hosts?"),
        };
        bridge.handle_frame(&request.encode()).await;
        assert_eq!(bridge.active_request(), Some(9));

        // A LAN service answers on the local socket.
        let origin: SocketAddr = "192.168.1.77:5555".parse().unwrap();
        bridge.inject_local_datagram(b"me!", origin);

        let sent = hub.sent_by(LOCAL);
        assert_eq!(sent.len(), 1);
        let frame = DiscoveryFrame::decode(&sent[0].1).unwrap();
        assert_eq!(frame.kind, DiscoveryKind::Response);
        assert_eq!(frame.request_id, 9);
        assert_eq!(&frame.payload[..], b"me!");
    }

    #[tokio::test]
    async fn test_host_without_active_request_stays_silent() {
        let hub = MemoryHub::new();
        let bridge = bridge(&hub, true).await;
        bridge.inject_local_datagram(b"noise", "192.168.1.2:4000".parse().unwrap());
        assert!(hub.sent_by(LOCAL).is_empty());
    }

    #[tokio::test]
    async fn test_role_mismatch_dropped() {
        let hub = MemoryHub::new();
        let client = bridge(&hub, false).await;

        // A request frame arriving at a client side is ignored.
        let request = DiscoveryFrame {
            kind: DiscoveryKind::Request,
            request_id: 1,
            payload: Bytes::from_static(b"misrouted"),
        };
        client.handle_frame(&request.encode()).await;
        assert!(hub.sent_by(LOCAL).is_empty());
    }
}
