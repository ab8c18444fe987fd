// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic session identifiers.
use std::fmt;

use thiserror::Error;

use crate::crypto::identity::PublicKey;
use crate::crypto::sha2::{sha2_256, SHA256_DIGEST_SIZE};

/// The length of a session id in bytes.
pub const SESSION_ID_SIZE: usize = SHA256_DIGEST_SIZE;

/// Identifier of one group-key epoch.
///
/// The id is the SHA256 digest over `nickname || ephemeral_public_key` of every member, taken in
/// sorted nickname order so that all honest members derive the same value independent of the
/// order in which they learned about each other. A mismatch between two members' ids signals a
/// diverging view of the room.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Derives the session id from the full set of members.
    ///
    /// Fails on an empty member set; a session without participants cannot exist.
    pub fn compute<'a, I>(members: I) -> Result<Self, SessionIdError>
    where
        I: IntoIterator<Item = (&'a str, &'a PublicKey)>,
    {
        let mut members: Vec<(&str, &PublicKey)> = members.into_iter().collect();
        if members.is_empty() {
            return Err(SessionIdError::NoParticipants);
        }
        members.sort_by(|(left, _), (right, _)| left.cmp(right));

        let mut concatenated = Vec::new();
        for (nickname, ephemeral_key) in members {
            concatenated.extend_from_slice(nickname.as_bytes());
            concatenated.extend_from_slice(ephemeral_key.as_bytes());
        }

        Ok(Self(sha2_256(&[&concatenated])))
    }

    pub const fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.to_hex())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum SessionIdError {
    #[error("can not derive a session id for an empty participant set")]
    NoParticipants,
}

#[cfg(test)]
mod tests {
    use crate::crypto::identity::{PrivateKey, PublicKey};
    use crate::crypto::Rng;

    use super::SessionId;

    #[test]
    fn insertion_order_independence() {
        let rng = Rng::from_seed([1; 32]);

        let alice_key = PrivateKey::from_rng(&rng).unwrap().public_key();
        let bob_key = PrivateKey::from_rng(&rng).unwrap().public_key();
        let carol_key = PrivateKey::from_rng(&rng).unwrap().public_key();

        let id_1 = SessionId::compute([
            ("alice", &alice_key),
            ("bob", &bob_key),
            ("carol", &carol_key),
        ])
        .unwrap();
        let id_2 = SessionId::compute([
            ("carol", &carol_key),
            ("alice", &alice_key),
            ("bob", &bob_key),
        ])
        .unwrap();

        assert_eq!(id_1, id_2);
    }

    #[test]
    fn membership_changes_the_id() {
        let rng = Rng::from_seed([2; 32]);

        let alice_key = PrivateKey::from_rng(&rng).unwrap().public_key();
        let bob_key = PrivateKey::from_rng(&rng).unwrap().public_key();

        let pair = SessionId::compute([("alice", &alice_key), ("bob", &bob_key)]).unwrap();
        let solo = SessionId::compute([("alice", &alice_key)]).unwrap();
        assert_ne!(pair, solo);

        // A fresh ephemeral key also yields a fresh session.
        let rotated = PrivateKey::from_rng(&rng).unwrap().public_key();
        let next = SessionId::compute([("alice", &alice_key), ("bob", &rotated)]).unwrap();
        assert_ne!(pair, next);
    }

    #[test]
    fn empty_set_is_rejected() {
        let nobody: Vec<(&str, &PublicKey)> = Vec::new();
        assert!(SessionId::compute(nobody).is_err());
    }
}
