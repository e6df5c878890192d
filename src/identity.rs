//! # Router Identity
//!
//! A router's identity is its Ed25519 public key. The keypair signs the
//! self-signed X.509 certificate presented during the TLS handshake, so
//! possession of the private key proves the identity; no CA is involved.
//!
//! The onion layer uses a separate X25519 keypair (see [`crate::circuit`]);
//! this module only covers the transport identity.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// 32-byte Ed25519 public key identifying a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True iff the bytes decode to a valid Ed25519 point.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}..)", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 signing keypair backing the router's TLS certificate.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity(self.signing.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Raw secret key bytes, used once to build the certificate's PKCS#8
    /// blob. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip() {
        let bytes = [7u8; 32];
        assert_eq!(*Identity::from_bytes(bytes).as_bytes(), bytes);
    }

    #[test]
    fn generated_identity_is_valid_point() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            assert!(keypair.identity().is_valid());
        }
    }

    #[test]
    fn distinct_keypairs_distinct_identities() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.identity(), b.identity());
    }
}
