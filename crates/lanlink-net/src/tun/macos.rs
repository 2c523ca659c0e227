//! macOS TUN device implementation
//!
//! Rides the utun control socket through the tun crate. Address and
//! netmask are applied with ifconfig, routes with route(8); utun
//! interfaces are point-to-point so the connected route must be
//! installed explicitly.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use tun::Device;

use super::{TunConfig, TunDevice};
use crate::error::{NetError, NetResult};

/// macOS TUN device
pub struct MacOsTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl MacOsTun {
    /// Open a utun device
    pub async fn create(config: TunConfig) -> NetResult<Self> {
        let mut tun_config = tun::Configuration::default();
        // macOS requires utunN names; let the kernel allocate unless the
        // caller asked for a specific slot.
        if config.name.starts_with("utun") {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32);

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetError::Tun(format!("failed to create utun device: {}", e)))?;
        let name = device
            .get_ref()
            .name()
            .map_err(|e| NetError::Tun(format!("failed to read device name: {}", e)))?;

        info!(target: "network", name = %name, mtu = config.mtu, "created TUN device");

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name,
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl TunDevice for MacOsTun {
    async fn read(&self) -> NetResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let mut device = self.device.lock().await;
        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetError::Tun(format!("TUN read failed: {}", e)))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> NetResult<usize> {
        let mut device = self.device.lock().await;
        device
            .write_all(packet)
            .await
            .map_err(|e| NetError::Tun(format!("TUN write failed: {}", e)))?;
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

        // Point-to-point: peer address is our own.
        let output = Command::new("ifconfig")
            .args([
                &self.name,
                &address.to_string(),
                &address.to_string(),
                "netmask",
                &netmask.to_string(),
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tun(format!(
                "ifconfig failed for {}: {}",
                self.name,
                stderr.trim()
            )));
        }
        info!(target: "network", name = %self.name, %address, %netmask, "configured TUN address");
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        use tokio::process::Command;

        let output = Command::new("route")
            .args([
                "-n",
                "add",
                "-net",
                &network.to_string(),
                "-netmask",
                &netmask.to_string(),
                "-interface",
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

    async fn set_enabled(&self, up: bool) -> NetResult<()> {
        use tokio::process::Command;

        let output = Command::new("ifconfig")
            .args([&self.name, if up { "up" } else { "down" }])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tun(format!(
                "ifconfig {} failed: {}",
                if up { "up" } else { "down" },
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> NetResult<()> {
        debug!(target: "network", name = %self.name, "closing TUN device");
        Ok(())
    }
}
