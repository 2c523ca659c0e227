//! Linux TUN device implementation

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use tun::Device;

use super::{TunConfig, TunDevice};
use crate::error::{NetError, NetResult};

/// Linux TUN device
pub struct LinuxTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Open the kernel tun device
    ///
    /// The interface starts without an address and down; the overlay
    /// assigns both once negotiation settles.
    pub async fn create(config: TunConfig) -> NetResult<Self> {
        let mut tun_config = tun::Configuration::default();
        if !config.name.is_empty() {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32);
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetError::Tun(format!("failed to create TUN device: {}", e)))?;
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
impl TunDevice for LinuxTun {
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
        let mut device = self.device.lock().await;
        let raw = device.get_mut();
        raw.set_address(address)
            .map_err(|e| NetError::Tun(format!("failed to set address: {}", e)))?;
        raw.set_netmask(netmask)
            .map_err(|e| NetError::Tun(format!("failed to set netmask: {}", e)))?;
        info!(target: "network", name = %self.name, %address, %netmask, "configured TUN address");
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Addr, netmask: Ipv4Addr) -> NetResult<()> {
        use tokio::process::Command;

        let prefix = u32::from(netmask).count_ones();
        let cidr = format!("{}/{}", network, prefix);
        let output = Command::new("ip")
            .args(["route", "replace", &cidr, "dev", &self.name, "proto", "static"])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tun(format!(
                "failed to add route {}: {}",
                cidr,
                stderr.trim()
            )));
        }
        debug!(target: "network", route = %cidr, dev = %self.name, "installed connected route");
        Ok(())
    }

    async fn set_enabled(&self, up: bool) -> NetResult<()> {
        let mut device = self.device.lock().await;
        device
            .get_mut()
            .enabled(up)
            .map_err(|e| NetError::Tun(format!("failed to set interface state: {}", e)))
    }

    async fn close(&self) -> NetResult<()> {
        debug!(target: "network", name = %self.name, "closing TUN device");
        Ok(())
    }
}
