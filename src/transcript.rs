// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transcript hash chain binding message order into every subsequent message.
use std::collections::BTreeMap;

use crate::crypto::sha2::{sha2_256, SHA256_DIGEST_SIZE};
use crate::session_id::SessionId;

/// Domain separator between a chain link and the plaintext it absorbs.
const CHAIN_SEPARATOR: &[u8] = b":O3";

/// The length of a transcript chain hash in bytes.
pub const TRANSCRIPT_HASH_SIZE: usize = SHA256_DIGEST_SIZE;

pub type TranscriptHash = [u8; TRANSCRIPT_HASH_SIZE];

/// Hash chain over all plaintexts delivered within one session.
///
/// The chain starts at the session id and absorbs every delivered message:
/// `H_i = SHA256(H_{i-1} || ":O3" || plaintext_i)`. Senders embed their latest link into each
/// outgoing message; receivers refuse delivery when the embedded link does not match their own,
/// which turns any disagreement about message order into a detectable inconsistency.
#[derive(Clone, Debug)]
pub struct TranscriptChain {
    chain: BTreeMap<u32, TranscriptHash>,
    last: TranscriptHash,
}

impl TranscriptChain {
    /// Starts a chain for the given session; the session id is link zero.
    pub fn new(session_id: &SessionId) -> Self {
        Self {
            chain: BTreeMap::new(),
            last: *session_id.as_bytes(),
        }
    }

    /// The most recent link of the chain.
    pub fn last_hash(&self) -> &TranscriptHash {
        &self.last
    }

    /// Whether the given hash matches the current head of the chain.
    pub fn matches(&self, hash: &TranscriptHash) -> bool {
        &self.last == hash
    }

    /// Absorbs a delivered plaintext and returns the new link.
    pub fn extend(&mut self, message_id: u32, plaintext: &str) -> TranscriptHash {
        let next = sha2_256(&[&self.last, CHAIN_SEPARATOR, plaintext.as_bytes()]);
        self.chain.insert(message_id, next);
        self.last = next;
        next
    }

    /// Looks up the link recorded for a delivered message.
    pub fn get(&self, message_id: u32) -> Option<&TranscriptHash> {
        self.chain.get(&message_id)
    }

    /// Number of delivered messages absorbed into the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::session_id::SessionId;

    use super::TranscriptChain;

    #[test]
    fn chain_is_reproducible() {
        let session_id = SessionId::from_bytes([7; 32]);

        let mut chain = TranscriptChain::new(&session_id);
        assert!(chain.matches(session_id.as_bytes()));

        chain.extend(1, "hello");
        chain.extend(2, "world");

        let mut replay = TranscriptChain::new(&session_id);
        replay.extend(1, "hello");
        replay.extend(2, "world");

        assert_eq!(chain.last_hash(), replay.last_hash());
        assert_eq!(chain.get(1), replay.get(1));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn order_matters() {
        let session_id = SessionId::from_bytes([7; 32]);

        let mut forward = TranscriptChain::new(&session_id);
        forward.extend(1, "hello");
        forward.extend(2, "world");

        let mut reversed = TranscriptChain::new(&session_id);
        reversed.extend(1, "world");
        reversed.extend(2, "hello");

        assert_ne!(forward.last_hash(), reversed.last_hash());
    }

    #[test]
    fn stale_head_is_detected() {
        let session_id = SessionId::from_bytes([7; 32]);

        let mut chain = TranscriptChain::new(&session_id);
        let first = chain.extend(1, "hello");
        chain.extend(2, "world");

        assert!(!chain.matches(session_id.as_bytes()));
        assert!(!chain.matches(&first));
        assert!(chain.matches(&chain.last_hash().to_owned()));
    }
}
