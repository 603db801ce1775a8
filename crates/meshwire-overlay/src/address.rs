//! Overlay address assignment
//!
//! A node's overlay address is either supplied by the operator or derived
//! from its name: the host part of the overlay network is overwritten with
//! the tail of a 128-bit FNV-1a digest of the name. Every node computes the
//! same address for the same name without any coordination.
//!
//! Collisions are possible (birthday bound over the host space) and are not
//! detected here.

use crate::error::{OverlayError, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

const FNV128_OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
const FNV128_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// 128-bit FNV-1a digest, big-endian
pub fn fnv1a_128(data: &[u8]) -> [u8; 16] {
    data.iter()
        .fold(FNV128_OFFSET_BASIS, |hash, &byte| {
            (hash ^ u128::from(byte)).wrapping_mul(FNV128_PRIME)
        })
        .to_be_bytes()
}

/// Assign the local overlay address.
///
/// An explicit address wins when it is present and not the unspecified
/// address; it must parse and lie inside `prefix`. Otherwise the address is
/// derived from `name`.
pub fn assign_overlay_addr(prefix: &IpNet, name: &str, explicit: Option<&str>) -> Result<IpAddr> {
    debug!(explicit = ?explicit, "assigning overlay address");

    let explicit = explicit.map(str::trim).filter(|s| !s.is_empty());
    let addr = match explicit {
        Some(raw) => {
            let addr: IpAddr = raw
                .parse()
                .map_err(|_| OverlayError::InvalidAddress(raw.to_string()))?;
            if addr.is_unspecified() {
                derive_overlay_addr(prefix, name)?
            } else if prefix.contains(&addr) {
                addr
            } else {
                return Err(OverlayError::AddressOutsidePrefix {
                    addr,
                    prefix: *prefix,
                });
            }
        }
        None => derive_overlay_addr(prefix, name)?,
    };

    debug!(overlay_addr = %addr, "assigned overlay address");
    Ok(addr)
}

/// Derive an address in `prefix` from `name`.
///
/// Exactly `(address bits - prefix bits) / 8` low-order bytes of the network
/// address are replaced by the matching low-order digest bytes; host bits
/// outside whole bytes keep the network address's value (zero).
pub fn derive_overlay_addr(prefix: &IpNet, name: &str) -> Result<IpAddr> {
    let network = prefix.network();
    let mut ip = match network {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };

    let digest = fnv1a_128(name.as_bytes());
    let host_bytes = usize::from(prefix.max_prefix_len() - prefix.prefix_len()) / 8;
    let (ip_len, digest_len) = (ip.len(), digest.len());
    for i in 1..=host_bytes {
        ip[ip_len - i] = digest[digest_len - i];
    }

    addr_from_slice(&ip)
}

fn addr_from_slice(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(v6)));
    }
    Err(OverlayError::AddressDerivationFailed(format!(
        "{} bytes do not form an address",
        bytes.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_fnv1a_128_known_values() {
        // Empty input hashes to the offset basis
        assert_eq!(fnv1a_128(b""), FNV128_OFFSET_BASIS.to_be_bytes());
        assert_eq!(
            fnv1a_128(b"node-a"),
            0xa791_ac72_dd3c_64bf_6ef0_e977_a2e0_7cc3u128.to_be_bytes()
        );
    }

    #[test]
    fn test_derive_golden_v4() {
        let addr = assign_overlay_addr(&net("10.0.0.0/24"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.195");

        let addr = assign_overlay_addr(&net("10.0.0.0/16"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "10.0.124.195");
    }

    #[test]
    fn test_derive_golden_v6() {
        let addr = assign_overlay_addr(&net("fd00:1::/64"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "fd00:1::6ef0:e977:a2e0:7cc3");
    }

    #[test]
    fn test_derive_is_deterministic_and_contained() {
        let prefixes = [
            "10.0.0.0/8",
            "10.0.0.0/24",
            "172.20.0.0/20",
            "192.168.4.0/30",
            "fd00::/48",
            "fd00:1::/64",
        ];
        let names = ["node-a", "node-b", "", "a-very-long-hostname.example.internal"];
        for p in prefixes {
            let prefix = net(p);
            for name in names {
                let first = assign_overlay_addr(&prefix, name, None).unwrap();
                let second = assign_overlay_addr(&prefix, name, None).unwrap();
                assert_eq!(first, second, "{name} in {p}");
                assert!(prefix.contains(&first), "{first} not in {p}");
            }
        }
    }

    #[test]
    fn test_different_names_differ() {
        let prefix = net("10.0.0.0/16");
        let a = assign_overlay_addr(&prefix, "node-a", None).unwrap();
        let b = assign_overlay_addr(&prefix, "node-b", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_partial_byte_prefix_keeps_network_bits() {
        // /20 leaves 12 host bits; only the last whole byte is overwritten
        let addr = assign_overlay_addr(&net("172.20.0.0/20"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "172.20.0.195");
    }

    #[test]
    fn test_host_bits_in_prefix_are_masked() {
        let addr = assign_overlay_addr(&net("10.1.2.3/16"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "10.1.124.195");
    }

    #[test]
    fn test_full_length_prefix_is_the_address() {
        let addr = assign_overlay_addr(&net("10.0.0.9/32"), "node-a", None).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.9");
    }

    #[test]
    fn test_explicit_inside_prefix() {
        let prefix = net("10.0.0.0/24");
        let addr = assign_overlay_addr(&prefix, "node-a", Some("10.0.0.42")).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.42");
    }

    #[test]
    fn test_explicit_outside_prefix_fails() {
        let prefix = net("10.0.0.0/24");
        let err = assign_overlay_addr(&prefix, "node-a", Some("192.168.1.1")).unwrap_err();
        assert!(matches!(err, OverlayError::AddressOutsidePrefix { .. }));

        let err = assign_overlay_addr(&prefix, "node-a", Some("fd00::1")).unwrap_err();
        assert!(matches!(err, OverlayError::AddressOutsidePrefix { .. }));
    }

    #[test]
    fn test_explicit_unparseable_fails() {
        let err =
            assign_overlay_addr(&net("10.0.0.0/24"), "node-a", Some("10.0.0.300")).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidAddress(_)));
    }

    #[test]
    fn test_empty_or_unspecified_explicit_derives() {
        let prefix = net("10.0.0.0/24");
        let derived = assign_overlay_addr(&prefix, "node-a", None).unwrap();
        for explicit in ["", "0.0.0.0", "::", "  "] {
            assert_eq!(
                assign_overlay_addr(&prefix, "node-a", Some(explicit)).unwrap(),
                derived,
                "explicit {explicit:?}"
            );
        }
    }
}
