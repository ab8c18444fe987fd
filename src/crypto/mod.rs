// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core cryptographic algorithms and random number generator.
//!
//! Algorithms:
//! - Ed25519 (SHA512) DSA for long-term identities and per-session ephemeral keys
//! - Triple Diffie-Hellman over X25519 (derived from the Ed25519 keys)
//! - SHA256 hashing
//! - XChaCha20Poly1305 AEAD (large IVs)
//!
//! Random Number Generator:
//! - ChaCha20 stream cipher, seeded via `getrandom`
pub mod aead;
pub mod identity;
mod rng;
mod secret;
pub mod sha2;
pub mod triple_dh;

pub use rng::{Rng, RngError};
pub use secret::Secret;
