//! Windows TUN device implementation using WinTun
//!
//! Requires Administrator privileges and wintun.dll next to the
//! executable. Packet reception runs on a blocking thread feeding a
//! channel, since the WinTun ring has no async interface. Address,
//! route and a firewall allow-rule are applied with netsh; the firewall
//! rule is best effort and only logged on failure.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{TunConfig, TunDevice};
use crate::error::{NetError, NetResult};

/// Ring buffer size for WinTun (must be a power of two)
const RING_CAPACITY: u32 = 0x40_0000;

/// Name of the best-effort firewall allow-rule
const FIREWALL_RULE: &str = "Lanlink Overlay";

/// Windows TUN device using WinTun
pub struct WindowsTun {
    session: Arc<wintun::Session>,
    name: String,
    mtu: u16,
    running: Arc<AtomicBool>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl WindowsTun {
    /// Load WinTun, create the adapter and start the receive pump
    pub async fn create(config: TunConfig) -> NetResult<Self> {
        let wintun = unsafe { wintun::load() }.map_err(|e| {
            NetError::Tun(format!(
                "failed to load wintun.dll: {}. Place it next to the executable.",
                e
            ))
        })?;

        let name = if config.name.is_empty() {
            "lanlink0".to_string()
        } else {
            config.name.clone()
        };

        let adapter = match wintun::Adapter::open(&wintun, &name) {
            Ok(adapter) => adapter,
            Err(_) => wintun::Adapter::create(&wintun, &name, "Lanlink", None)
                .map_err(|e| NetError::Tun(format!("failed to create adapter: {}", e)))?,
        };

        let session = Arc::new(
            adapter
                .start_session(RING_CAPACITY)
                .map_err(|e| NetError::Tun(format!("failed to start session: {}", e)))?,
        );

        info!(target: "network", name = %name, mtu = config.mtu, "created WinTun adapter");

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(1024);
        let pump_session = Arc::clone(&session);
        let pump_running = Arc::clone(&running);
        std::thread::spawn(move || {
            while pump_running.load(Ordering::Relaxed) {
                match pump_session.receive_blocking() {
                    Ok(packet) => {
                        let bytes = Bytes::copy_from_slice(packet.bytes());
                        if tx.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(_) => break, // session shut down
                }
            }
        });

        install_firewall_rule(&name).await;

        Ok(Self {
            session,
            name,
            mtu: config.mtu,
            running,
            rx: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl TunDevice for WindowsTun {
    async fn read(&self) -> NetResult<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NetError::Tun("TUN receive pump stopped".into()))
    }

    async fn write(&self, packet: &[u8]) -> NetResult<usize> {
        let mut send = self
            .session
            .allocate_send_packet(packet.len() as u16)
            .map_err(|e| NetError::Tun(format!("TUN write failed: {}", e)))?;
        send.bytes_mut().copy_from_slice(packet);
        self.session.send_packet(send);
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        use tokio::process::Command;

        let output = Command::new("netsh")
            .args([
                "interface",
                "ip",
                "set",
                "address",
                &format!("name={}", self.name),
                "static",
                &address.to_string(),
                &netmask.to_string(),
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tun(format!(
                "netsh set address failed: {}",
                stderr.trim()
            )));
        }

        let output = Command::new("netsh")
            .args([
                "interface",
                "ipv4",
                "set",
                "subinterface",
                &self.name,
                &format!("mtu={}", self.mtu),
                "store=persistent",
            ])
            .output()
            .await?;
        if !output.status.success() {
            warn!(target: "network", name = %self.name, "failed to set MTU via netsh");
        }

        info!(target: "network", name = %self.name, %address, %netmask, "configured TUN address");
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        use tokio::process::Command;

        let output = Command::new("route")
            .args([
                "add",
                &network.to_string(),
                "mask",
                &netmask.to_string(),
                "0.0.0.0",
                "if",
                &self.name,
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tun(format!(
                "failed to add route {}: {}",
                network,
                stderr.trim()
            )));
        }
        debug!(target: "network", %network, dev = %self.name, "installed connected route");
        Ok(())
    }

    async fn set_enabled(&self, _up: bool) -> NetResult<()> {
        // WinTun adapters are up for the lifetime of the session.
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.session.shutdown();
        debug!(target: "network", name = %self.name, "closed WinTun session");
        Ok(())
    }
}

/// Allow inbound traffic on the virtual adapter; failure is a warning
async fn install_firewall_rule(interface: &str) {
    use tokio::process::Command;

    let result = Command::new("netsh")
        .args([
            "advfirewall",
            "firewall",
            "add",
            "rule",
            &format!("name={}", FIREWALL_RULE),
            "dir=in",
            "action=allow",
            "localip=any",
            "enable=yes",
        ])
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            debug!(target: "network", interface, "firewall allow-rule installed");
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(target: "network", interface, error = %stderr.trim(), "failed to install firewall rule");
        }
        Err(e) => {
            warn!(target: "network", interface, error = %e, "failed to run netsh for firewall rule");
        }
    }
}
