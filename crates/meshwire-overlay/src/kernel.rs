//! Real kernel backend
//!
//! Drives the kernel through iproute2 (`ip`) and wireguard-tools (`wg`).
//! Requires CAP_NET_ADMIN and the WireGuard kernel module.

use crate::keys::PublicKey;
use crate::link::{DeviceInfo, Link, LinkError, LinkManager, LinkResult, PeerStatus};
use crate::peer::DeviceConfig;
use ipnet::IpNet;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

/// Whether `wg` has been found on this host. Checked once per process.
static WG_TOOLS_CHECKED: OnceLock<bool> = OnceLock::new();

/// Ensure the `wg` binary is available.
async fn ensure_wireguard_tools() -> LinkResult<()> {
    let available = match WG_TOOLS_CHECKED.get() {
        Some(&available) => available,
        None => {
            let available = Command::new("which")
                .arg("wg")
                .output()
                .await
                .map(|output| output.status.success())
                .unwrap_or(false);
            *WG_TOOLS_CHECKED.get_or_init(|| available)
        }
    };

    if available {
        Ok(())
    } else {
        Err(LinkError::ToolMissing(
            "wg (install wireguard-tools)".to_string(),
        ))
    }
}

/// Map a failed command's stderr onto the idempotency-relevant conditions
fn classify_failure(program: &str, args: &[&str], stderr: &str) -> LinkError {
    let stderr = stderr.trim();
    if stderr.contains("File exists") {
        LinkError::AlreadyExists(stderr.to_string())
    } else if stderr.contains("Cannot find device")
        || stderr.contains("does not exist")
        || stderr.contains("No such device")
    {
        LinkError::NotFound(stderr.to_string())
    } else {
        LinkError::Command {
            program: program.to_string(),
            args: args.join(" "),
            stderr: stderr.to_string(),
        }
    }
}

/// Run a command, returning stdout on success
async fn run(program: &str, args: &[&str]) -> LinkResult<String> {
    debug!(program, args = %args.join(" "), "running");
    let output = Command::new(program).args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_failure(program, args, &stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse the index out of `ip -o link show` output (`7: wg0: <...> ...`)
fn parse_link_index(name: &str, output: &str) -> LinkResult<Link> {
    let index = output
        .lines()
        .next()
        .and_then(|line| line.split(':').next())
        .and_then(|idx| idx.trim().parse::<u32>().ok())
        .ok_or_else(|| LinkError::Parse(format!("no link index in {:?}", output.trim())))?;

    Ok(Link {
        name: name.to_string(),
        index,
    })
}

fn none_or<T>(field: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    if field == "(none)" || field.is_empty() {
        None
    } else {
        parse(field)
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface (private key, public key, listen
/// port, fwmark), every further line one peer (public key, preshared key,
/// endpoint, allowed ips, latest handshake, rx, tx, keepalive).
fn parse_wg_dump(name: &str, dump: &str) -> LinkResult<DeviceInfo> {
    let mut lines = dump.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| LinkError::Parse("empty wg dump".to_string()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(LinkError::Parse(format!("bad interface line {:?}", header)));
    }
    let public_key = none_or(fields[1], |f| f.parse::<PublicKey>().ok());
    let listen_port = fields[2]
        .parse::<u16>()
        .map_err(|e| LinkError::Parse(format!("listen port {:?}: {}", fields[2], e)))?;

    let mut peers = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            return Err(LinkError::Parse(format!("bad peer line {:?}", line)));
        }
        let public_key = fields[0]
            .parse::<PublicKey>()
            .map_err(|e| LinkError::Parse(e.to_string()))?;
        let endpoint = none_or(fields[2], |f| f.parse::<SocketAddr>().ok());
        let allowed_ips = none_or(fields[3], |f| {
            Some(
                f.split(',')
                    .filter_map(|net| net.trim().parse::<IpNet>().ok())
                    .collect::<Vec<_>>(),
            )
        })
        .unwrap_or_default();

        peers.push(PeerStatus {
            public_key,
            endpoint,
            allowed_ips,
        });
    }

    Ok(DeviceInfo {
        name: name.to_string(),
        public_key,
        listen_port,
        peers,
    })
}

/// `wg` subcommand applying a config file: `setconf` replaces the whole
/// device, `addconf` merges peers into it
fn apply_subcommand(config: &DeviceConfig) -> &'static str {
    if config.replace_peers {
        "setconf"
    } else {
        "addconf"
    }
}

/// `wg set` argument lists that reset the allowed IPs of merged peers.
///
/// `addconf` appends allowed IPs; `setconf` already replaces them.
fn allowed_ips_resets(name: &str, config: &DeviceConfig) -> Vec<Vec<String>> {
    if config.replace_peers {
        return Vec::new();
    }
    config
        .peers
        .iter()
        .filter(|peer| peer.replace_allowed_ips)
        .map(|peer| {
            let allowed = peer
                .allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            vec![
                "set".to_string(),
                name.to_string(),
                "peer".to_string(),
                peer.public_key.to_string(),
                "allowed-ips".to_string(),
                allowed,
            ]
        })
        .collect()
}

/// [`LinkManager`] backed by the host kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelLinkManager;

impl KernelLinkManager {
    /// Create a new kernel link manager
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl LinkManager for KernelLinkManager {
    async fn create_wireguard(&self, name: &str) -> LinkResult<()> {
        run("ip", &["link", "add", "dev", name, "type", "wireguard"]).await?;
        Ok(())
    }

    async fn device(&self, name: &str) -> LinkResult<DeviceInfo> {
        // An absent link is reported without requiring wireguard-tools
        self.link_by_name(name).await?;
        ensure_wireguard_tools().await?;
        let dump = run("wg", &["show", name, "dump"]).await?;
        parse_wg_dump(name, &dump)
    }

    async fn configure_device(&self, name: &str, config: &DeviceConfig) -> LinkResult<()> {
        ensure_wireguard_tools().await?;

        // Holds the private key; created 0600 and removed on drop
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .suffix(".conf")
            .tempfile()?;
        file.write_all(config.to_wg_config().as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        run("wg", &[apply_subcommand(config), name, &path]).await?;

        for args in allowed_ips_resets(name, config) {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run("wg", &args).await?;
        }
        Ok(())
    }

    async fn link_by_name(&self, name: &str) -> LinkResult<Link> {
        let output = run("ip", &["-o", "link", "show", "dev", name]).await?;
        parse_link_index(name, &output)
    }

    async fn replace_address(&self, link: &Link, addr: IpNet) -> LinkResult<()> {
        let addr = addr.to_string();
        run("ip", &["addr", "replace", &addr, "dev", &link.name]).await?;
        Ok(())
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkResult<()> {
        let mtu = mtu.to_string();
        run("ip", &["link", "set", "dev", &link.name, "mtu", &mtu]).await?;
        Ok(())
    }

    async fn set_up(&self, link: &Link) -> LinkResult<()> {
        run("ip", &["link", "set", "dev", &link.name, "up"]).await?;
        Ok(())
    }

    async fn add_route(&self, link: &Link, dst: IpNet) -> LinkResult<()> {
        let dst = dst.to_string();
        run(
            "ip",
            &["route", "add", &dst, "dev", &link.name, "scope", "link"],
        )
        .await?;
        Ok(())
    }

    async fn delete_link(&self, link: &Link) -> LinkResult<()> {
        run("ip", &["link", "delete", "dev", &link.name]).await?;
        Ok(())
    }
}
