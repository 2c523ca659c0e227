//! In-memory TUN device
//!
//! Simulates a Layer-3 interface for tests: packets "from the OS" are
//! injected through a channel, packets written by the overlay are
//! captured for inspection. Configuration calls are recorded so start-up
//! sequences can be asserted.

use std::net::Ipv4Addr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::TunDevice;
use crate::error::{NetError, NetResult};

/// Recorded interface state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTunState {
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub routes: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub up: bool,
    pub closed: bool,
}

/// Test double for a TUN device
pub struct MemoryTun {
    name: String,
    mtu: u16,
    inject_tx: mpsc::UnboundedSender<Bytes>,
    inject_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    written: StdMutex<Vec<Bytes>>,
    state: StdMutex<MemoryTunState>,
}

impl MemoryTun {
    pub fn new(name: &str, mtu: u16) -> Self {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            mtu,
            inject_tx,
            inject_rx: Mutex::new(inject_rx),
            written: StdMutex::new(Vec::new()),
            state: StdMutex::new(MemoryTunState::default()),
        }
    }

    /// Feed a packet as if the OS had routed it into the interface
    pub fn inject(&self, packet: impl Into<Bytes>) {
        let _ = self.inject_tx.send(packet.into());
    }

    /// Packets the overlay wrote to the interface so far
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().unwrap().clone()
    }

    /// Drain captured packets
    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.written.lock().unwrap())
    }

    /// Recorded configuration
    pub fn state(&self) -> MemoryTunState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn read(&self) -> NetResult<Bytes> {
        let mut rx = self.inject_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NetError::Tun("device closed".into()))
    }

    async fn write(&self, packet: &[u8]) -> NetResult<usize> {
        if self.state.lock().unwrap().closed {
            return Err(NetError::Tun("device closed".into()));
        }
        self.written
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(packet));
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        let mut state = self.state.lock().unwrap();
        state.address = Some(address);
        state.netmask = Some(netmask);
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        self.state.lock().unwrap().routes.push((network, netmask));
        Ok(())
    }

    async fn set_enabled(&self, up: bool) -> NetResult<()> {
        self.state.lock().unwrap().up = up;
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
