//! Error types for overlay interface operations

use crate::link::LinkError;
use crate::reconciler::ReconcileStep;
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur while assigning addresses or reconciling the
/// overlay interface
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Explicit overlay address could not be parsed
    #[error("Invalid overlay address: {0}")]
    InvalidAddress(String),

    /// Explicit overlay address is not part of the overlay network
    #[error("Overlay address {addr} is not part of the overlay network {prefix}")]
    AddressOutsidePrefix { addr: IpAddr, prefix: IpNet },

    /// Derived address bytes did not form a valid address
    #[error("Could not derive overlay address: {0}")]
    AddressDerivationFailed(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Invalid CIDR notation
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A kernel link, address, route or device operation failed
    #[error("{step} for interface '{interface}': {source}")]
    Link {
        step: ReconcileStep,
        interface: String,
        #[source]
        source: LinkError,
    },

    /// Peer list could not be translated into device configuration
    #[error("converting peer configuration for interface '{interface}': {source}")]
    Peers {
        interface: String,
        #[source]
        source: Box<OverlayError>,
    },

    /// IO error while reading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`OverlayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad operator input or peer data; retrying without a fix won't help
    Configuration,
    /// Kernel resource operation failed; retrying the whole `set_up` is safe
    Resource,
}

impl OverlayError {
    pub(crate) fn link(step: ReconcileStep, interface: &str, source: LinkError) -> Self {
        Self::Link {
            step,
            interface: interface.to_string(),
            source,
        }
    }

    pub(crate) fn peers(interface: &str, source: OverlayError) -> Self {
        Self::Peers {
            interface: interface.to_string(),
            source: Box::new(source),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Link { .. } => ErrorKind::Resource,
            Self::InvalidAddress(_)
            | Self::AddressOutsidePrefix { .. }
            | Self::AddressDerivationFailed(_)
            | Self::InvalidKey(_)
            | Self::InvalidCidr(_)
            | Self::Config(_)
            | Self::Peers { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the caller can expect a plain retry to eventually succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }

    /// The reconciliation step that failed
    pub fn step(&self) -> Option<&ReconcileStep> {
        match self {
            Self::Link { step, .. } => Some(step),
            Self::Peers { .. } => Some(&ReconcileStep::BuildPeers),
            _ => None,
        }
    }

    /// The interface a reconciliation failure concerns
    pub fn interface(&self) -> Option<&str> {
        match self {
            Self::Link { interface, .. } | Self::Peers { interface, .. } => {
                Some(interface.as_str())
            }
            _ => None,
        }
    }
}

/// Result type alias for overlay operations
pub type Result<T> = std::result::Result<T, OverlayError>;
