//! End-to-end tests against the host kernel.
//!
//! Tests marked with `#[ignore]` require root or CAP_NET_ADMIN capability
//! plus the WireGuard kernel module and wireguard-tools. Run them with:
//!
//! ```sh
//! cargo test -p meshwire-overlay --test kernel_e2e -- --ignored
//! ```

use meshwire_overlay::{
    generate_keypair, InterfaceReconciler, KernelLinkManager, OverlayConfig, PeerDescriptor,
    PrivateKey, PublicKey,
};
use std::collections::HashSet;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// 1. Key compatibility test (optional: requires `wg` binary)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_native_keys_compatible_with_wg_tool() {
    let wg_available = Command::new("which")
        .arg("wg")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);

    if !wg_available {
        eprintln!("SKIP: `wg` binary not found; skipping key compatibility test");
        return;
    }

    let wg_genkey_output = Command::new("wg")
        .arg("genkey")
        .output()
        .await
        .expect("wg genkey should execute");
    assert!(
        wg_genkey_output.status.success(),
        "wg genkey failed: {}",
        String::from_utf8_lossy(&wg_genkey_output.stderr)
    );
    let wg_priv = String::from_utf8(wg_genkey_output.stdout)
        .expect("wg genkey output should be valid UTF-8")
        .trim()
        .to_string();

    // Use a standard (sync) Command for piped stdin to keep it simple
    let wg_pubkey_output = {
        let mut child = std::process::Command::new("wg")
            .arg("pubkey")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("wg pubkey should spawn");
        {
            use std::io::Write;
            let stdin = child.stdin.as_mut().expect("stdin should be available");
            stdin
                .write_all(wg_priv.as_bytes())
                .expect("writing to stdin should succeed");
        }
        child.wait_with_output().expect("wg pubkey should complete")
    };
    assert!(wg_pubkey_output.status.success());
    let wg_pub: PublicKey = String::from_utf8(wg_pubkey_output.stdout)
        .expect("wg pubkey output should be valid UTF-8")
        .trim()
        .parse()
        .expect("wg public key must parse");

    // Our derivation of the wg-generated private key must match `wg pubkey`
    let private_key = PrivateKey::from_base64(&wg_priv).expect("wg private key must parse");
    assert_eq!(private_key.public_key(), wg_pub);

    let (native_priv, native_pub) = generate_keypair();
    assert_eq!(native_priv.to_base64().len(), wg_priv.len());
    assert_eq!(native_pub.to_string().len(), wg_pub.to_string().len());
}

// ---------------------------------------------------------------------------
// 2. Interface lifecycle test (requires root or CAP_NET_ADMIN)
// ---------------------------------------------------------------------------

async fn ip_output(args: &[&str]) -> (bool, String) {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .expect("ip should execute");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

fn peer(overlay: &str, real: &str) -> PeerDescriptor {
    PeerDescriptor::new(
        generate_keypair().1.to_string(),
        overlay.parse().unwrap(),
        real.parse().unwrap(),
    )
}

#[tokio::test]
#[ignore = "requires root or CAP_NET_ADMIN"]
async fn test_overlay_interface_lifecycle() {
    let iface = "wg-mw-life";

    // Cleanup any leftover interface from a previous failed run
    let _ = ip_output(&["link", "del", "dev", iface]).await;

    let mut config = OverlayConfig::default()
        .with_overlay_net("10.250.0.0/24")
        .expect("valid CIDR");
    config.interface = iface.to_string();
    config.listen_port = 51830;
    config.mtu = 1380;

    let (overlay, local) =
        InterfaceReconciler::new(&config, "node-a", KernelLinkManager::new()).unwrap();
    assert_eq!(local.overlay_addr.to_string(), "10.250.0.195");

    let a = vec![peer("10.250.0.5", "192.0.2.5"), peer("10.250.0.6", "192.0.2.6")];
    overlay.set_up(&a).await.expect("first set_up should succeed");
    overlay.set_up(&a).await.expect("repeated set_up should succeed");

    let (exists, link) = ip_output(&["link", "show", "dev", iface]).await;
    assert!(exists, "interface {} should exist", iface);
    assert!(link.contains("UP"), "interface should be UP, got: {}", link);
    assert!(link.contains("mtu 1380"), "MTU should be set, got: {}", link);

    let (_, addrs) = ip_output(&["addr", "show", "dev", iface]).await;
    assert_eq!(
        addrs.matches("inet ").count(),
        1,
        "exactly one address expected, got: {}",
        addrs
    );
    assert!(addrs.contains("10.250.0.195/32"));

    let (_, routes) = ip_output(&["route", "show", "dev", iface]).await;
    assert!(routes.contains("10.250.0.5"));
    assert!(routes.contains("10.250.0.6"));

    // Replace the peer set
    let b = vec![peer("10.250.0.7", "192.0.2.7")];
    overlay.set_up(&b).await.expect("set_up with new peers should succeed");

    let status = overlay.status().await.unwrap().expect("device should exist");
    let live: HashSet<String> = status
        .peers
        .iter()
        .map(|p| p.public_key.to_string())
        .collect();
    let expected: HashSet<String> = b.iter().map(|p| p.public_key.clone()).collect();
    assert_eq!(live, expected);
    assert_eq!(status.listen_port, 51830);
    assert_eq!(status.public_key, Some(overlay.identity().public_key));

    overlay.tear_down().await.expect("tear_down should succeed");
    let (exists, _) = ip_output(&["link", "show", "dev", iface]).await;
    assert!(!exists, "interface {} should be gone", iface);

    overlay
        .tear_down()
        .await
        .expect("second tear_down should be a no-op");
}

#[tokio::test]
async fn test_tear_down_absent_interface() {
    // Needs only iproute2: the link lookup fails before anything is modified
    let ip_available = Command::new("ip")
        .arg("-V")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !ip_available {
        eprintln!("SKIP: `ip` binary not found");
        return;
    }

    let mut config = OverlayConfig::default();
    config.interface = "wg-mw-absent".to_string();

    let (overlay, _) =
        InterfaceReconciler::new(&config, "node-a", KernelLinkManager::new()).unwrap();
    overlay.tear_down().await.expect("tear_down of absent interface");
    assert!(overlay.status().await.unwrap().is_none());
}
