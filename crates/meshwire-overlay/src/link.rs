//! Kernel-facing link operations
//!
//! The reconciler only talks to the kernel through [`LinkManager`], so the
//! reconciliation algorithm runs unchanged against the real kernel
//! ([`crate::kernel::KernelLinkManager`]) or an in-memory table
//! ([`crate::memory::MemoryLinkManager`]).

use crate::keys::PublicKey;
use crate::peer::DeviceConfig;
use ipnet::IpNet;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors reported by a [`LinkManager`] backend
#[derive(Debug, Error)]
pub enum LinkError {
    /// The object being created already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object being looked up does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An external command exited unsuccessfully
    #[error("`{program} {args}` failed: {stderr}")]
    Command {
        program: String,
        args: String,
        stderr: String,
    },

    /// A required tool is not installed
    #[error("required tool not available: {0}")]
    ToolMissing(String),

    /// Output from the kernel could not be understood
    #[error("unexpected output: {0}")]
    Parse(String),

    /// Failure injected by the in-memory backend
    #[error("injected failure: {0}")]
    Injected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether this is an "already exists" condition
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether this is a "not found" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for link operations
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Handle to a live kernel link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
}

/// A peer as currently configured on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub public_key: PublicKey,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
}

/// WireGuard device state read back from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub public_key: Option<PublicKey>,
    pub listen_port: u16,
    pub peers: Vec<PeerStatus>,
}

/// Narrow capability over the kernel's link, address, route and WireGuard
/// device tables.
///
/// Implementations report "already exists" and "not found" conditions as
/// [`LinkError::AlreadyExists`] and [`LinkError::NotFound`]; deciding whether
/// those are errors is up to the caller.
#[async_trait::async_trait]
pub trait LinkManager: Send + Sync {
    /// Create a WireGuard link named `name`
    async fn create_wireguard(&self, name: &str) -> LinkResult<()>;

    /// Read back the WireGuard device named `name`
    async fn device(&self, name: &str) -> LinkResult<DeviceInfo>;

    /// Apply a full device configuration
    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> LinkResult<()>;

    /// Look up a live link by name
    async fn link_by_name(&self, name: &str) -> LinkResult<Link>;

    /// Replace the link's address with `addr`
    async fn replace_address(&self, link: &Link, addr: IpNet) -> LinkResult<()>;

    /// Set the link MTU
    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkResult<()>;

    /// Bring the link administratively up
    async fn set_up(&self, link: &Link) -> LinkResult<()>;

    /// Add a link-scoped route to `dst` through the link
    async fn add_route(&self, link: &Link, dst: IpNet) -> LinkResult<()>;

    /// Delete the link along with everything the kernel attached to it
    async fn delete_link(&self, link: &Link) -> LinkResult<()>;
}

#[async_trait::async_trait]
impl<T: LinkManager + ?Sized> LinkManager for std::sync::Arc<T> {
    async fn create_wireguard(&self, name: &str) -> LinkResult<()> {
        (**self).create_wireguard(name).await
    }

    async fn device(&self, name: &str) -> LinkResult<DeviceInfo> {
        (**self).device(name).await
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> LinkResult<()> {
        (**self).configure_device(name, config).await
    }

    async fn link_by_name(&self, name: &str) -> LinkResult<Link> {
        (**self).link_by_name(name).await
    }

    async fn replace_address(&self, link: &Link, addr: IpNet) -> LinkResult<()> {
        (**self).replace_address(link, addr).await
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkResult<()> {
        (**self).set_mtu(link, mtu).await
    }

    async fn set_up(&self, link: &Link) -> LinkResult<()> {
        (**self).set_up(link).await
    }

    async fn add_route(&self, link: &Link, dst: IpNet) -> LinkResult<()> {
        (**self).add_route(link, dst).await
    }

    async fn delete_link(&self, link: &Link) -> LinkResult<()> {
        (**self).delete_link(link).await
    }
}
