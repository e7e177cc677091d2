//! X25519 keypair handling for WgMesh
//!
//! WireGuard identifies every node by a Curve25519 keypair; keys travel as
//! base64 on the wire and in config files. The private key never leaves the
//! process that generated it.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// X25519 keypair for a mesh node
#[derive(Clone)]
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from a base64-encoded private key
    pub fn from_private_base64(b64: &str) -> Result<Self> {
        let secret = parse_private_key(b64)?;
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Get the public key as a base64 string
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Get the private key as a base64 string (config-file serialization only)
    pub fn private_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_base64())
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.secret.to_bytes() == other.secret.to_bytes() && self.public == other.public
    }
}

fn decode_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::Validation(format!("invalid base64 key: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::Validation(format!("invalid key length: {} (expected 32)", bytes.len()))
    })
}

/// Parse a base64-encoded public key
pub fn parse_public_key(b64: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_key(b64)?))
}

/// Parse a base64-encoded private key
pub fn parse_private_key(b64: &str) -> Result<StaticSecret> {
    Ok(StaticSecret::from(decode_key(b64)?))
}

/// Encode a public key as base64
pub fn public_key_base64(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Encode a private key as base64 (for handing to the device layer or the
/// config file, never for logging)
pub fn private_key_base64(secret: &StaticSecret) -> String {
    BASE64.encode(secret.to_bytes())
}

/// Short public-key prefix for log lines (never log the full key material
/// of anything secret; a prefix is enough to correlate requests)
pub fn key_prefix(key: &PublicKey) -> String {
    public_key_base64(key)[..8].to_string()
}
