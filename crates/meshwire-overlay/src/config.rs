//! Overlay interface configuration

use crate::error::{OverlayError, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default WireGuard interface name
pub const DEFAULT_INTERFACE_NAME: &str = "wgoverlay";

/// Default WireGuard listen port, shared by every node in the cluster
pub const DEFAULT_WG_PORT: u16 = 51820;

/// Default interface MTU (leaves room for WireGuard encapsulation over 1500)
pub const DEFAULT_MTU: u32 = 1420;

/// Default overlay network CIDR
pub const DEFAULT_OVERLAY_NET: &str = "10.0.0.0/8";

/// Kernel limit on interface name length (IFNAMSIZ minus the NUL byte)
const MAX_INTERFACE_NAME_LEN: usize = 15;

const MIN_MTU_V4: u32 = 576;
const MIN_MTU_V6: u32 = 1280;
const MAX_MTU: u32 = 65535;

/// Overlay interface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    /// WireGuard interface name
    #[serde(default = "OverlayConfig::default_interface")]
    pub interface: String,

    /// UDP listen port
    #[serde(default = "OverlayConfig::default_port")]
    pub listen_port: u16,

    /// Interface MTU
    #[serde(default = "OverlayConfig::default_mtu")]
    pub mtu: u32,

    /// Overlay network governing every node's overlay address
    #[serde(default = "OverlayConfig::default_overlay_net")]
    pub overlay_net: IpNet,

    /// Explicit overlay address; derived from the node name when unset
    #[serde(default)]
    pub overlay_address: Option<String>,
}

impl OverlayConfig {
    fn default_interface() -> String {
        DEFAULT_INTERFACE_NAME.to_string()
    }

    fn default_port() -> u16 {
        DEFAULT_WG_PORT
    }

    fn default_mtu() -> u32 {
        DEFAULT_MTU
    }

    fn default_overlay_net() -> IpNet {
        IpNet::V4(ipnet::Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 8).unwrap_or_default())
    }

    /// Parse an overlay network CIDR string
    pub fn parse_overlay_net(cidr: &str) -> Result<IpNet> {
        cidr.parse()
            .map_err(|e| OverlayError::InvalidCidr(format!("{}: {}", cidr, e)))
    }

    /// Set the overlay network from CIDR notation
    pub fn with_overlay_net(mut self, cidr: &str) -> Result<Self> {
        self.overlay_net = Self::parse_overlay_net(cidr)?;
        Ok(self)
    }

    /// Set an explicit overlay address
    pub fn with_overlay_address(mut self, addr: impl Into<String>) -> Self {
        self.overlay_address = Some(addr.into());
        self
    }

    /// Load configuration from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the kernel would reject
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(OverlayError::Config(
                "interface name must not be empty".to_string(),
            ));
        }
        if self.interface.len() > MAX_INTERFACE_NAME_LEN {
            return Err(OverlayError::Config(format!(
                "interface name '{}' exceeds {} character limit",
                self.interface, MAX_INTERFACE_NAME_LEN
            )));
        }
        if self
            .interface
            .chars()
            .any(|c| c.is_whitespace() || c == '/')
        {
            return Err(OverlayError::Config(format!(
                "interface name '{}' contains whitespace or '/'",
                self.interface
            )));
        }

        if self.listen_port == 0 {
            return Err(OverlayError::Config(
                "listen port must be non-zero".to_string(),
            ));
        }

        let min_mtu = match self.overlay_net {
            IpNet::V4(_) => MIN_MTU_V4,
            IpNet::V6(_) => MIN_MTU_V6,
        };
        if !(min_mtu..=MAX_MTU).contains(&self.mtu) {
            return Err(OverlayError::Config(format!(
                "MTU {} out of range {}..={}",
                self.mtu, min_mtu, MAX_MTU
            )));
        }

        Ok(())
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interface: Self::default_interface(),
            listen_port: DEFAULT_WG_PORT,
            mtu: DEFAULT_MTU,
            overlay_net: Self::default_overlay_net(),
            overlay_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_config_default() {
        let config = OverlayConfig::default();
        assert_eq!(config.interface, "wgoverlay");
        assert_eq!(config.listen_port, 51820);
        assert_eq!(config.mtu, 1420);
        assert_eq!(config.overlay_net.to_string(), DEFAULT_OVERLAY_NET);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: OverlayConfig =
            serde_json::from_str(r#"{"overlay_net": "10.42.0.0/16"}"#).unwrap();
        assert_eq!(config.interface, DEFAULT_INTERFACE_NAME);
        assert_eq!(config.overlay_net.to_string(), "10.42.0.0/16");
        assert_eq!(config.overlay_address, None);
    }

    #[test]
    fn test_invalid_cidr() {
        let result = OverlayConfig::default().with_overlay_net("not-a-cidr");
        assert!(matches!(result, Err(OverlayError::InvalidCidr(_))));
    }

    #[test]
    fn test_validate_interface_name() {
        let mut config = OverlayConfig::default();
        config.interface = "this-name-is-far-too-long".to_string();
        assert!(matches!(config.validate(), Err(OverlayError::Config(_))));

        config.interface = String::new();
        assert!(config.validate().is_err());

        config.interface = "wg 0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_mtu() {
        let mut config = OverlayConfig::default();
        config.mtu = 100;
        assert!(config.validate().is_err());

        // 1000 is fine for IPv4 but below the IPv6 minimum
        config.mtu = 1000;
        assert!(config.validate().is_ok());
        let config = config.with_overlay_net("fd00:1::/64").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_port() {
        let mut config = OverlayConfig::default();
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        tokio::fs::write(
            &path,
            r#"{
                "interface": "wg-test0",
                "mtu": 1380,
                "overlay_net": "10.9.0.0/16",
                "overlay_address": "10.9.0.7"
            }"#,
        )
        .await
        .unwrap();

        let config = OverlayConfig::load(&path).await.unwrap();
        assert_eq!(config.interface, "wg-test0");
        assert_eq!(config.mtu, 1380);
        assert_eq!(config.listen_port, DEFAULT_WG_PORT);
        assert_eq!(config.overlay_address.as_deref(), Some("10.9.0.7"));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.json");
        tokio::fs::write(&path, r#"{"listen_port": 0}"#).await.unwrap();

        assert!(OverlayConfig::load(&path).await.is_err());
        let err = OverlayConfig::load(&dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::Io(_)));
        // A missing file needs an operator fix, not a retry
        assert!(!err.is_retryable());
    }
}
