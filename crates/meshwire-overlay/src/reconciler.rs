//! Overlay interface reconciliation
//!
//! [`InterfaceReconciler`] owns one WireGuard interface and drives it towards
//! the state implied by the current peer list. Every call re-asserts the full
//! desired state: the peer set is replaced wholesale, the address is replaced
//! rather than added, and "already exists" conditions are absorbed. A call
//! that fails part way leaves the interface partially converged; the next
//! call finishes the job.
//!
//! Callers must serialize `set_up` and `tear_down` for a given interface.

use crate::address::assign_overlay_addr;
use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::keys::{PrivateKey, PublicKey};
use crate::link::{DeviceInfo, LinkError, LinkManager};
use crate::peer::{build_peer_configs, host_net, DeviceConfig, LocalNode, PeerDescriptor};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info, instrument};

/// Lifecycle of the overlay interface.
///
/// Host routes attach to an up link only, so they are installed after
/// [`Up`](Self::Up) and do not form a stage of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceStage {
    Absent,
    Created,
    Configured,
    Addressed,
    Up,
}

/// Individual kernel operations performed while reconciling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileStep {
    CreateLink,
    BuildPeers,
    ConfigureDevice,
    LookupLink,
    ReplaceAddress,
    SetMtu,
    SetUp,
    AddRoute(IpNet),
    LookupDevice,
    DeleteLink,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateLink => f.write_str("creating link"),
            Self::BuildPeers => f.write_str("converting peer configuration"),
            Self::ConfigureDevice => f.write_str("setting wireguard configuration"),
            Self::LookupLink => f.write_str("getting link information"),
            Self::ReplaceAddress => f.write_str("setting address"),
            Self::SetMtu => f.write_str("setting MTU"),
            Self::SetUp => f.write_str("enabling interface"),
            Self::AddRoute(dst) => write!(f, "adding route {}", dst),
            Self::LookupDevice => f.write_str("getting device"),
            Self::DeleteLink => f.write_str("deleting link"),
        }
    }
}

/// The local node's identity on the overlay
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub name: String,
    pub overlay_addr: IpAddr,
    pub public_key: PublicKey,
    private_key: PrivateKey,
}

impl NodeIdentity {
    /// The local private key
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// What this node advertises to its peers
    pub fn local_node(&self) -> LocalNode {
        LocalNode {
            overlay_addr: self.overlay_addr,
            public_key: self.public_key.to_string(),
        }
    }
}

/// Reconciler for a single overlay interface
pub struct InterfaceReconciler<L> {
    interface: String,
    listen_port: u16,
    mtu: u32,
    overlay_net: IpNet,
    identity: NodeIdentity,
    links: L,
}

impl<L: LinkManager> InterfaceReconciler<L> {
    /// Create the reconciler with a freshly generated keypair.
    ///
    /// The overlay address is assigned here, once; the interface itself is
    /// untouched until [`set_up`](Self::set_up). Returns the descriptor to
    /// advertise through the membership layer.
    pub fn new(config: &OverlayConfig, name: &str, links: L) -> Result<(Self, LocalNode)> {
        Self::with_identity(config, name, PrivateKey::generate(), links)
    }

    /// Like [`new`](Self::new), with a caller-supplied private key
    pub fn with_identity(
        config: &OverlayConfig,
        name: &str,
        private_key: PrivateKey,
        links: L,
    ) -> Result<(Self, LocalNode)> {
        config.validate()?;

        let overlay_addr =
            assign_overlay_addr(&config.overlay_net, name, config.overlay_address.as_deref())?;
        let identity = NodeIdentity {
            name: name.to_string(),
            overlay_addr,
            public_key: private_key.public_key(),
            private_key,
        };
        let local = identity.local_node();

        info!(
            interface = %config.interface,
            overlay_addr = %overlay_addr,
            public_key = %identity.public_key,
            "initialized overlay identity"
        );

        Ok((
            Self {
                interface: config.interface.clone(),
                listen_port: config.listen_port,
                mtu: config.mtu,
                overlay_net: config.overlay_net,
                identity,
                links,
            },
            local,
        ))
    }

    /// Interface name
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Local node identity
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Local overlay address
    pub fn overlay_addr(&self) -> IpAddr {
        self.identity.overlay_addr
    }

    /// Overlay network
    pub fn overlay_net(&self) -> IpNet {
        self.overlay_net
    }

    /// Underlying link manager
    pub fn links(&self) -> &L {
        &self.links
    }

    fn fail(&self, step: ReconcileStep) -> impl FnOnce(LinkError) -> OverlayError + '_ {
        move |source| OverlayError::link(step, &self.interface, source)
    }

    /// Converge the interface onto `peers`.
    ///
    /// Creates the link if needed, applies the full device configuration
    /// (replacing every peer), replaces the address, sets the MTU, brings
    /// the link up and adds a host route per peer. Stops at the first
    /// failure.
    #[instrument(skip(self, peers), fields(interface = %self.interface, peers = peers.len()))]
    pub async fn set_up(&self, peers: &[PeerDescriptor]) -> Result<()> {
        match self.links.create_wireguard(&self.interface).await {
            Ok(()) => debug!("created link"),
            Err(e) if e.is_already_exists() => debug!("link already exists"),
            Err(e) => return Err(self.fail(ReconcileStep::CreateLink)(e)),
        }

        let peer_configs = build_peer_configs(peers, self.listen_port)
            .map_err(|e| OverlayError::peers(&self.interface, e))?;
        let device = DeviceConfig {
            private_key: self.identity.private_key.clone(),
            listen_port: self.listen_port,
            replace_peers: true,
            peers: peer_configs,
        };
        self.links
            .configure_device(&self.interface, &device)
            .await
            .map_err(self.fail(ReconcileStep::ConfigureDevice))?;
        debug!("applied device configuration");

        let link = self
            .links
            .link_by_name(&self.interface)
            .await
            .map_err(self.fail(ReconcileStep::LookupLink))?;

        self.links
            .replace_address(&link, host_net(self.identity.overlay_addr))
            .await
            .map_err(self.fail(ReconcileStep::ReplaceAddress))?;
        self.links
            .set_mtu(&link, self.mtu)
            .await
            .map_err(self.fail(ReconcileStep::SetMtu))?;
        self.links
            .set_up(&link)
            .await
            .map_err(self.fail(ReconcileStep::SetUp))?;

        for peer in peers {
            let dst = host_net(peer.overlay_addr);
            match self.links.add_route(&link, dst).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => debug!(route = %dst, "route already exists"),
                Err(e) => return Err(self.fail(ReconcileStep::AddRoute(dst))(e)),
            }
        }

        info!(
            overlay_addr = %self.identity.overlay_addr,
            index = link.index,
            "overlay interface up"
        );
        Ok(())
    }

    /// Remove the interface. Succeeds if it is already gone.
    ///
    /// Deleting the link drops its addresses, routes and peers with it.
    #[instrument(skip(self), fields(interface = %self.interface))]
    pub async fn tear_down(&self) -> Result<()> {
        if self.status().await?.is_none() {
            debug!("device already gone");
            return Ok(());
        }

        let link = self
            .links
            .link_by_name(&self.interface)
            .await
            .map_err(self.fail(ReconcileStep::LookupLink))?;
        self.links
            .delete_link(&link)
            .await
            .map_err(self.fail(ReconcileStep::DeleteLink))?;

        info!("overlay interface removed");
        Ok(())
    }

    /// Read back the live device, `None` if the interface does not exist
    pub async fn status(&self) -> Result<Option<DeviceInfo>> {
        match self.links.device(&self.interface).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(self.fail(ReconcileStep::LookupDevice)(e)),
        }
    }
}
