//! Meshwire Overlay - WireGuard overlay interface reconciliation
//!
//! Derives a node's overlay address deterministically from its name and
//! drives a WireGuard interface (keys, address, MTU, routes, peers) into the
//! state implied by the cluster's current peer list. Reconciliation is
//! idempotent: the full desired state is re-asserted on every call, so a
//! failed call is repaired by the next one.
//!
//! Cluster membership, the tunnel cryptography and process wiring live
//! elsewhere; this crate only consumes a peer list and configures the link.
//!
//! # Modules
//!
//! - [`address`] - Deterministic overlay address assignment
//! - [`config`] - Configuration for the overlay interface
//! - [`error`] - Error types for overlay operations
//! - [`kernel`] - Kernel backend (iproute2 + wireguard-tools)
//! - [`keys`] - WireGuard key material
//! - [`link`] - The kernel capability the reconciler is written against
//! - [`memory`] - In-memory link table for tests and dry runs
//! - [`peer`] - Peer descriptors and WireGuard peer configuration
//! - [`reconciler`] - Interface lifecycle and reconciliation
//!
//! # Example
//!
//! ```ignore
//! use meshwire_overlay::{InterfaceReconciler, KernelLinkManager, OverlayConfig};
//!
//! let config = OverlayConfig::default().with_overlay_net("10.42.0.0/16")?;
//! let (overlay, local) = InterfaceReconciler::new(&config, "node-a", KernelLinkManager::new())?;
//!
//! // Advertise `local` through the membership layer, then on every
//! // membership change:
//! overlay.set_up(&peers).await?;
//!
//! // On shutdown:
//! overlay.tear_down().await?;
//! ```

pub mod address;
pub mod config;
pub mod error;
pub mod kernel;
pub mod keys;
pub mod link;
pub mod memory;
pub mod peer;
pub mod reconciler;

// Re-export commonly used types
pub use address::{assign_overlay_addr, derive_overlay_addr};
pub use config::{
    OverlayConfig, DEFAULT_INTERFACE_NAME, DEFAULT_MTU, DEFAULT_OVERLAY_NET, DEFAULT_WG_PORT,
};
pub use error::{ErrorKind, OverlayError, Result};
pub use kernel::KernelLinkManager;
pub use keys::{generate_keypair, PrivateKey, PublicKey};
pub use link::{DeviceInfo, Link, LinkError, LinkManager, PeerStatus};
pub use memory::{LinkOp, MemoryLinkManager};
pub use peer::{
    build_peer_configs, private_namespace_routes, DeviceConfig, LocalNode, PeerDescriptor,
    TunnelPeerConfig,
};
pub use reconciler::{InterfaceReconciler, InterfaceStage, NodeIdentity, ReconcileStep};
