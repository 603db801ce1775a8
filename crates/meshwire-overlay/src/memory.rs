//! In-memory link table
//!
//! [`MemoryLinkManager`] simulates the kernel's link, address, route and
//! WireGuard device tables so the reconciler can be exercised without
//! privileges. Failures can be injected per operation.

use crate::link::{DeviceInfo, Link, LinkError, LinkManager, LinkResult, PeerStatus};
use crate::peer::DeviceConfig;
use crate::reconciler::InterfaceStage;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Operations of [`LinkManager`], for failure injection and call tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    CreateWireguard,
    Device,
    ConfigureDevice,
    LinkByName,
    ReplaceAddress,
    SetMtu,
    SetUp,
    AddRoute,
    DeleteLink,
}

/// Simulated state of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLink {
    pub index: u32,
    pub device: Option<DeviceInfo>,
    pub addresses: Vec<IpNet>,
    pub mtu: u32,
    pub up: bool,
    pub routes: Vec<IpNet>,
}

impl MemoryLink {
    fn new(index: u32) -> Self {
        Self {
            index,
            device: None,
            addresses: Vec::new(),
            mtu: 1420,
            up: false,
            routes: Vec::new(),
        }
    }

    /// Lifecycle stage this link has reached
    pub fn stage(&self) -> InterfaceStage {
        if self.device.is_none() {
            InterfaceStage::Created
        } else if self.addresses.is_empty() {
            InterfaceStage::Configured
        } else if self.up {
            InterfaceStage::Up
        } else {
            InterfaceStage::Addressed
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    links: HashMap<String, MemoryLink>,
    next_index: u32,
    pending_failures: HashSet<LinkOp>,
    calls: Vec<LinkOp>,
}

impl Inner {
    /// Record a call and consume an injected failure for it, if any
    fn enter(&mut self, op: LinkOp) -> LinkResult<()> {
        self.calls.push(op);
        if self.pending_failures.remove(&op) {
            return Err(LinkError::Injected(format!("{:?}", op)));
        }
        Ok(())
    }

    fn link_mut(&mut self, name: &str) -> LinkResult<&mut MemoryLink> {
        self.links
            .get_mut(name)
            .ok_or_else(|| LinkError::NotFound(format!("Cannot find device \"{}\"", name)))
    }

    /// Resolve a handle, rejecting handles to a link that has since been
    /// deleted and recreated
    fn handle_mut(&mut self, link: &Link) -> LinkResult<&mut MemoryLink> {
        let state = self.link_mut(&link.name)?;
        if state.index != link.index {
            return Err(LinkError::NotFound(format!(
                "link index {} for {} is gone",
                link.index, link.name
            )));
        }
        Ok(state)
    }
}

/// [`LinkManager`] over an in-memory link table
#[derive(Debug, Default)]
pub struct MemoryLinkManager {
    inner: Mutex<Inner>,
}

impl MemoryLinkManager {
    /// Create an empty link table
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: LinkOp) {
        self.inner.lock().pending_failures.insert(op);
    }

    /// Snapshot of a link, if it exists
    pub fn link(&self, name: &str) -> Option<MemoryLink> {
        self.inner.lock().links.get(name).cloned()
    }

    /// Lifecycle stage of the named interface
    pub fn stage(&self, name: &str) -> InterfaceStage {
        self.link(name)
            .map_or(InterfaceStage::Absent, |link| link.stage())
    }

    /// Every operation invoked so far, in order
    pub fn calls(&self) -> Vec<LinkOp> {
        self.inner.lock().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }
}

#[async_trait::async_trait]
impl LinkManager for MemoryLinkManager {
    async fn create_wireguard(&self, name: &str) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::CreateWireguard)?;

        if inner.links.contains_key(name) {
            return Err(LinkError::AlreadyExists(format!("link {}", name)));
        }
        inner.next_index += 1;
        let index = inner.next_index;
        inner.links.insert(name.to_string(), MemoryLink::new(index));
        Ok(())
    }

    async fn device(&self, name: &str) -> LinkResult<DeviceInfo> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::Device)?;

        let link = inner.link_mut(name)?;
        Ok(link.device.clone().unwrap_or_else(|| DeviceInfo {
            name: name.to_string(),
            public_key: None,
            listen_port: 0,
            peers: Vec::new(),
        }))
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::ConfigureDevice)?;

        let link = inner.link_mut(name)?;
        let mut peers = match (&link.device, config.replace_peers) {
            (Some(device), false) => device.peers.clone(),
            _ => Vec::new(),
        };

        for peer in &config.peers {
            match peers.iter_mut().find(|p| p.public_key == peer.public_key) {
                Some(existing) => {
                    existing.endpoint = Some(peer.endpoint);
                    if peer.replace_allowed_ips {
                        existing.allowed_ips.clear();
                    }
                    for net in &peer.allowed_ips {
                        if !existing.allowed_ips.contains(net) {
                            existing.allowed_ips.push(*net);
                        }
                    }
                }
                None => peers.push(PeerStatus {
                    public_key: peer.public_key,
                    endpoint: Some(peer.endpoint),
                    allowed_ips: peer.allowed_ips.clone(),
                }),
            }
        }

        link.device = Some(DeviceInfo {
            name: name.to_string(),
            public_key: Some(config.private_key.public_key()),
            listen_port: config.listen_port,
            peers,
        });
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> LinkResult<Link> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::LinkByName)?;

        let index = inner.link_mut(name)?.index;
        Ok(Link {
            name: name.to_string(),
            index,
        })
    }

    async fn replace_address(&self, link: &Link, addr: IpNet) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::ReplaceAddress)?;

        let state = inner.handle_mut(link)?;
        state.addresses.retain(|existing| *existing != addr);
        state.addresses.push(addr);
        Ok(())
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::SetMtu)?;

        inner.handle_mut(link)?.mtu = mtu;
        Ok(())
    }

    async fn set_up(&self, link: &Link) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::SetUp)?;

        inner.handle_mut(link)?.up = true;
        Ok(())
    }

    async fn add_route(&self, link: &Link, dst: IpNet) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::AddRoute)?;

        let state = inner.handle_mut(link)?;
        if !state.up {
            return Err(LinkError::Command {
                program: "route".to_string(),
                args: format!("add {} dev {}", dst, link.name),
                stderr: "Network is down".to_string(),
            });
        }
        if state.routes.contains(&dst) {
            return Err(LinkError::AlreadyExists(format!("route {}", dst)));
        }
        state.routes.push(dst);
        Ok(())
    }

    async fn delete_link(&self, link: &Link) -> LinkResult<()> {
        let mut inner = self.inner.lock();
        inner.enter(LinkOp::DeleteLink)?;

        inner.handle_mut(link)?;
        inner.links.remove(&link.name);
        Ok(())
    }
}
