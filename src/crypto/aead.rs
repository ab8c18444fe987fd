// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated encryption with associated data (AEAD) using XChaCha20-Poly1305.
//!
//! The extended 24-byte nonce is safe to generate randomly per message.
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::crypto::Secret;

/// 256-bit AEAD key.
pub const AEAD_KEY_SIZE: usize = 32;

/// 192-bit extended nonce.
pub const AEAD_NONCE_SIZE: usize = 24;

pub type AeadKey = Secret<AEAD_KEY_SIZE>;

pub type AeadNonce = [u8; AEAD_NONCE_SIZE];

/// Encrypts plaintext, appending a 16-byte authentication tag.
pub fn aead_encrypt(
    key: &AeadKey,
    nonce: AeadNonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| AeadError::EncryptionFailed)?;
    Ok(ciphertext)
}

/// Decrypts and authenticates a ciphertext produced by [`aead_encrypt`].
pub fn aead_decrypt(
    key: &AeadKey,
    nonce: AeadNonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext)
        .map_err(|_| AeadError::DecryptionFailed)?;
    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("aead encryption failed")]
    EncryptionFailed,

    #[error("aead decryption failed, ciphertext does not authenticate under this key and nonce")]
    DecryptionFailed,
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Rng, Secret};

    use super::{aead_decrypt, aead_encrypt};

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);

        let key = Secret::from_bytes(rng.random_array().unwrap());
        let nonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, nonce, b"Hello, Chorus!").unwrap();
        assert_eq!(
            aead_decrypt(&key, nonce, &ciphertext).unwrap(),
            b"Hello, Chorus!"
        );
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let rng = Rng::from_seed([2; 32]);

        let key = Secret::from_bytes(rng.random_array().unwrap());
        let nonce = rng.random_array().unwrap();

        let mut ciphertext = aead_encrypt(&key, nonce, b"Hello, Chorus!").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(aead_decrypt(&key, nonce, &ciphertext).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let rng = Rng::from_seed([3; 32]);

        let key = Secret::from_bytes(rng.random_array().unwrap());
        let other_key = Secret::from_bytes(rng.random_array().unwrap());
        let nonce = rng.random_array().unwrap();

        let ciphertext = aead_encrypt(&key, nonce, b"Hello, Chorus!").unwrap();
        assert!(aead_decrypt(&other_key, nonce, &ciphertext).is_err());
    }
}
