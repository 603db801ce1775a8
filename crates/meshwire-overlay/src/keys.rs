//! WireGuard key material
//!
//! Keys are x25519 keys, exchanged between nodes as standard base64 strings
//! (44 characters for 32 bytes), the same encoding `wg genkey` produces.

use crate::error::{OverlayError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::StaticSecret;

/// Length of a raw WireGuard key in bytes
pub const KEY_LEN: usize = 32;

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| OverlayError::InvalidKey(format!("{:?}: {}", encoded, e)))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        OverlayError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    })
}

/// A peer's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Build a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Standard base64 encoding
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl FromStr for PublicKey {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// The local node's private key. Never leaves the process except in the
/// device configuration handed to the kernel.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a fresh key from the OS random source
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Build a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Parse a base64-encoded private key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        decode_key(encoded).map(Self::from_bytes)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Standard base64 encoding, for device configuration only
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Generate a WireGuard keypair using native Rust crypto (x25519-dalek).
///
/// No external `wg` binary is required for key generation.
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let private_key = PrivateKey::generate();
    let public_key = private_key.public_key();
    (private_key, public_key)
}
