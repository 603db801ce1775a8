//! Peer descriptors and their translation into WireGuard peer configuration

use crate::error::Result;
use crate::keys::{PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Private address ranges every peer may route, so any node can act as a
/// gateway into its LAN without per-peer route negotiation
pub const PRIVATE_NAMESPACE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// A remote node as delivered by the membership layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Base64-encoded WireGuard public key
    pub public_key: String,

    /// Peer's overlay address
    pub overlay_addr: IpAddr,

    /// Peer's routable endpoint address
    pub real_addr: IpAddr,
}

impl PeerDescriptor {
    /// Create a new peer descriptor
    pub fn new(public_key: impl Into<String>, overlay_addr: IpAddr, real_addr: IpAddr) -> Self {
        Self {
            public_key: public_key.into(),
            overlay_addr,
            real_addr,
        }
    }
}

/// What the local node advertises to the rest of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalNode {
    /// Local overlay address
    pub overlay_addr: IpAddr,

    /// Base64-encoded local public key
    pub public_key: String,
}

/// WireGuard configuration for a single peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPeerConfig {
    pub public_key: PublicKey,
    pub endpoint: SocketAddr,
    /// Replace, rather than extend, the peer's existing allowed IPs
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl TunnelPeerConfig {
    /// Render as a `[Peer]` section of a `wg setconf` file
    pub fn to_wg_config(&self) -> String {
        let allowed = self
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "[Peer]\n\
             PublicKey = {}\n\
             Endpoint = {}\n\
             AllowedIPs = {}\n",
            self.public_key, self.endpoint, allowed
        )
    }
}

/// Full device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub private_key: PrivateKey,
    pub listen_port: u16,
    /// Drop every peer not listed in `peers`
    pub replace_peers: bool,
    pub peers: Vec<TunnelPeerConfig>,
}

impl DeviceConfig {
    /// Render as a `wg setconf` / `wg addconf` file
    pub fn to_wg_config(&self) -> String {
        let mut config = format!(
            "[Interface]\nPrivateKey = {}\nListenPort = {}\n",
            self.private_key.to_base64(),
            self.listen_port,
        );
        for peer in &self.peers {
            let _ = write!(config, "\n{}", peer.to_wg_config());
        }
        config
    }
}

/// Single-address network for `addr` (`/32` or `/128`)
pub fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// The peer's own host route followed by the private namespace ranges
pub fn private_namespace_routes(overlay_addr: IpAddr) -> Vec<IpNet> {
    let mut routes = Vec::with_capacity(PRIVATE_NAMESPACE_RANGES.len() + 1);
    routes.push(host_net(overlay_addr));
    for range in PRIVATE_NAMESPACE_RANGES {
        match range.parse::<IpNet>() {
            Ok(net) => routes.push(net),
            Err(e) => warn!(range, error = %e, "skipping unparseable private range"),
        }
    }
    routes
}

/// Translate peers into WireGuard peer configs, one per peer, in input order.
///
/// Every endpoint uses `listen_port`: the port is shared cluster-wide. Fails
/// on the first unparseable key without returning any partial output.
pub fn build_peer_configs(
    peers: &[PeerDescriptor],
    listen_port: u16,
) -> Result<Vec<TunnelPeerConfig>> {
    peers
        .iter()
        .map(|peer| -> Result<TunnelPeerConfig> {
            Ok(TunnelPeerConfig {
                public_key: peer.public_key.parse()?,
                endpoint: SocketAddr::new(peer.real_addr, listen_port),
                replace_allowed_ips: true,
                allowed_ips: private_namespace_routes(peer.overlay_addr),
            })
        })
        .collect()
}
