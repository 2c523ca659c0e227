//! Overlay configuration

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Operating mode of the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    /// Local TCP listener multiplexed over a reliable tunnel
    Tcp,

    /// Virtual Layer-3 interface with negotiated addresses
    Tun,
}

/// Overlay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Operating mode
    pub mode: OverlayMode,

    /// TCP mode: port the host side connects to for inbound sessions
    pub local_port: u16,

    /// TCP mode: port the local listener binds
    pub bind_port: u16,

    /// Whether this node hosts the shared service
    pub publish: bool,

    /// Room name announced to peers
    pub room: String,

    /// Base network of the virtual subnet
    pub subnet: Ipv4Addr,

    /// Subnet mask of the virtual subnet
    pub subnet_mask: Ipv4Addr,

    /// MTU for the TUN device
    pub mtu: u16,

    /// TUN device name; empty lets the OS pick
    pub tun_name: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: OverlayMode::Tcp,
            local_port: 25565,
            bind_port: 25565,
            publish: false,
            room: String::new(),
            subnet: Ipv4Addr::new(10, 0, 0, 0),
            subnet_mask: Ipv4Addr::new(255, 0, 0, 0),
            mtu: 1400,
            tun_name: String::new(),
        }
    }
}

impl OverlayConfig {
    /// Validate the configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.mtu < 576 {
            return Err(CoreError::Config(format!(
                "MTU {} below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        let mask = u32::from(self.subnet_mask);
        // A valid mask is a contiguous run of ones.
        if mask != 0 && (!mask).wrapping_add(1) & !mask != 0 {
            return Err(CoreError::Config(format!(
                "subnet mask {} is not contiguous",
                self.subnet_mask
            )));
        }
        if mask == u32::MAX {
            return Err(CoreError::Config(
                "subnet mask leaves no host addresses".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(OverlayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        let config = OverlayConfig {
            mtu: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_noncontiguous_mask_rejected() {
        let config = OverlayConfig {
            subnet_mask: Ipv4Addr::new(255, 0, 255, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_full_mask_rejected() {
        let config = OverlayConfig {
            subnet_mask: Ipv4Addr::new(255, 255, 255, 255),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
