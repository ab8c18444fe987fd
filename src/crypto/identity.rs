// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 key pairs and signatures.
//!
//! The same key type serves two roles in the protocol: the long-term identity key pair which
//! lives for the process lifetime, and the per-session ephemeral key pair which signs protocol
//! messages and feeds the triple Diffie-Hellman exchange.
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};

use ed25519_dalek::{Signer, Verifier};
use thiserror::Error;

use crate::crypto::{Rng, RngError};

/// The length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// The length of an Ed25519 private key seed in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// The length of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 private signing key.
#[derive(Clone)]
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generates a fresh key pair from the given random number generator.
    pub fn from_rng(rng: &Rng) -> Result<Self, RngError> {
        let seed: [u8; PRIVATE_KEY_SIZE] = rng.random_array()?;
        Ok(Self(ed25519_dalek::SigningKey::from_bytes(&seed)))
    }

    /// Reconstructs a private key from its 32-byte seed.
    pub fn from_bytes(bytes: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    pub(crate) fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Returns the public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Signs the given bytes.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }

    /// Returns the clamped X25519 scalar corresponding to this Ed25519 key, for Diffie-Hellman.
    pub(crate) fn to_x25519(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.0.to_scalar_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not reveal the seed when printing debug info.
        f.debug_struct("PrivateKey").field("value", &"***").finish()
    }
}

/// Ed25519 public verifying key.
///
/// Doubles as the identity fingerprint of a room member. Keys are ordered by their byte
/// representation; the protocol relies on this ordering to agree on the term order inside the
/// triple Diffie-Hellman exchange.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Parses a public key from its compressed 32-byte representation.
    ///
    /// Fails when the bytes do not decompress to a point on the curve.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(key))
    }

    /// Bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }

    /// Convert the public key to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Verifies a signature over the given bytes.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, &signature.0).is_ok()
    }

    /// Returns the X25519 (Montgomery form) counterpart of this key, for Diffie-Hellman.
    pub(crate) fn to_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0.to_montgomery().to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl StdHash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

/// Ed25519 signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0.to_bytes()
    }
}

/// Long-term Ed25519 identity of the local user.
///
/// Owned by the user state for the whole process lifetime; the private half never leaves this
/// container.
#[derive(Debug)]
pub struct LongTermIdentity {
    private_key: PrivateKey,
}

impl LongTermIdentity {
    /// Generates a fresh long-term identity.
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self {
            private_key: PrivateKey::from_rng(rng)?,
        })
    }

    /// Restores an identity from a 32-byte private key seed provided by the host.
    pub fn from_seed(seed: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self {
            private_key: PrivateKey::from_bytes(seed),
        }
    }

    /// The identity fingerprint.
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("bytes do not form a valid ed25519 public key")]
    InvalidPublicKey,

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{PrivateKey, PublicKey};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);

        let private_key = PrivateKey::from_rng(&rng).unwrap();
        let public_key = private_key.public_key();

        let signature = private_key.sign(b"Hello, Chorus!");
        assert!(public_key.verify(b"Hello, Chorus!", &signature));
        assert!(!public_key.verify(b"Hello, Mallory!", &signature));

        let other_key = PrivateKey::from_rng(&rng).unwrap().public_key();
        assert!(!other_key.verify(b"Hello, Chorus!", &signature));
    }

    #[test]
    fn public_key_encoding() {
        let rng = Rng::from_seed([2; 32]);

        let public_key = PrivateKey::from_rng(&rng).unwrap().public_key();
        let decoded = PublicKey::from_bytes(public_key.as_bytes()).unwrap();
        assert_eq!(public_key, decoded);
        assert_eq!(public_key.to_hex(), decoded.to_hex());
    }
}
