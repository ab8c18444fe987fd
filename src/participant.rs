// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-peer records inside a session.
//!
//! A [`Participant`] tracks everything a session knows about one room member: their identity,
//! their ephemeral key for this session, the pairwise triple Diffie-Hellman secret once computed,
//! their key-agreement contribution and the mutual authentication flags.
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::identity::{IdentityError, LongTermIdentity, PrivateKey, PublicKey};
use crate::crypto::sha2::{sha2_256, SHA256_DIGEST_SIZE};
use crate::crypto::triple_dh::{triple_dh, P2P_KEY_SIZE};
use crate::crypto::Secret;

/// The length of a key-agreement share in bytes.
pub const KEY_SHARE_SIZE: usize = SHA256_DIGEST_SIZE;

/// The length of an authentication token in bytes.
pub const AUTH_TOKEN_SIZE: usize = SHA256_DIGEST_SIZE;

/// Identity of a room member: a nickname unique within the room paired with the long-term public
/// key acting as fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantId {
    pub nickname: String,
    pub long_term_key: PublicKey,
}

impl ParticipantId {
    pub fn new(nickname: &str, long_term_key: PublicKey) -> Self {
        Self {
            nickname: nickname.to_owned(),
            long_term_key,
        }
    }

    /// Canonical byte form `nickname || long_term_key`, bound into authentication tokens and
    /// session confirmations.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.nickname.len() + 32);
        bytes.extend_from_slice(self.nickname.as_bytes());
        bytes.extend_from_slice(self.long_term_key.as_bytes());
        bytes
    }
}

/// Roster entry the host hands over when joining a room: a member identity together with the
/// ephemeral key they use in the currently active session.
#[derive(Clone, Debug)]
pub struct UnauthenticatedParticipant {
    pub id: ParticipantId,
    pub ephemeral_key: PublicKey,
}

/// State of one room member within a single session.
#[derive(Clone, Debug)]
pub struct Participant {
    id: ParticipantId,
    ephemeral_key: Option<PublicKey>,
    p2p_key: Option<Secret<P2P_KEY_SIZE>>,
    cur_keyshare: Option<[u8; KEY_SHARE_SIZE]>,
    authenticated: bool,
    authed_to: bool,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            ephemeral_key: None,
            p2p_key: None,
            cur_keyshare: None,
            authenticated: false,
            authed_to: false,
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn nickname(&self) -> &str {
        &self.id.nickname
    }

    pub fn ephemeral_key(&self) -> Option<&PublicKey> {
        self.ephemeral_key.as_ref()
    }

    pub fn cur_keyshare(&self) -> Option<&[u8; KEY_SHARE_SIZE]> {
        self.cur_keyshare.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn has_authed_to(&self) -> bool {
        self.authed_to
    }

    /// Assigns the ephemeral key this member uses for the session.
    ///
    /// Idempotent; fails when the bytes do not parse as a curve point.
    pub fn set_ephemeral(&mut self, bytes: &[u8; 32]) -> Result<(), ParticipantError> {
        let key = PublicKey::from_bytes(bytes).map_err(|_| ParticipantError::InvalidEphemeralKey)?;
        self.ephemeral_key = Some(key);
        Ok(())
    }

    pub(crate) fn set_ephemeral_key(&mut self, key: PublicKey) {
        self.ephemeral_key = Some(key);
    }

    pub(crate) fn set_keyshare(&mut self, share: [u8; KEY_SHARE_SIZE]) {
        self.cur_keyshare = Some(share);
    }

    pub(crate) fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Forgets the key-agreement contribution, used when a successor session inherits this record
    /// for a new epoch.
    pub(crate) fn reset_keyshare(&mut self) {
        self.cur_keyshare = None;
    }

    /// Computes and stores the pairwise triple Diffie-Hellman secret with this member.
    ///
    /// No-op when the secret was already derived; the pairwise secret only depends on the two
    /// key pairs, not on the session.
    pub fn compute_p2p(
        &mut self,
        identity: &LongTermIdentity,
        session_ephemeral: &PrivateKey,
    ) -> Result<(), ParticipantError> {
        if self.p2p_key.is_some() {
            return Ok(());
        }
        let ephemeral_key = self
            .ephemeral_key
            .as_ref()
            .ok_or(ParticipantError::MissingEphemeralKey)?;

        let peer_is_first = self.id.long_term_key < identity.public_key();
        self.p2p_key = Some(triple_dh(
            ephemeral_key,
            &self.id.long_term_key,
            identity.private_key(),
            session_ephemeral,
            peer_is_first,
        ));
        Ok(())
    }

    pub(crate) fn p2p_key(&self) -> Option<&Secret<P2P_KEY_SIZE>> {
        self.p2p_key.as_ref()
    }

    /// Emits the token which proves to this member that we hold the pairwise secret:
    /// `SHA256(p2p_key || my_id)`.
    pub fn authenticate_to(
        &mut self,
        my_id: &ParticipantId,
    ) -> Result<[u8; AUTH_TOKEN_SIZE], ParticipantError> {
        let p2p_key = self
            .p2p_key
            .as_ref()
            .ok_or(ParticipantError::MissingPairwiseSecret)?;
        let token = sha2_256(&[p2p_key.as_bytes(), &my_id.to_bytes()]);
        self.authed_to = true;
        Ok(token)
    }

    /// Verifies an authentication token received from this member.
    ///
    /// Recomputes `SHA256(p2p_key || authenticator_id)` and compares in constant time. A mismatch
    /// is fatal to the session containing this record.
    pub fn be_authenticated(
        &mut self,
        authenticator_id: &ParticipantId,
        token: &[u8; AUTH_TOKEN_SIZE],
    ) -> Result<(), ParticipantError> {
        let p2p_key = self
            .p2p_key
            .as_ref()
            .ok_or(ParticipantError::MissingPairwiseSecret)?;
        let expected = sha2_256(&[p2p_key.as_bytes(), &authenticator_id.to_bytes()]);

        if bool::from(expected.ct_eq(token)) {
            self.authenticated = true;
            Ok(())
        } else {
            Err(ParticipantError::AuthenticationFailed(
                self.id.nickname.clone(),
            ))
        }
    }
}

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("bytes do not form a valid ephemeral curve point")]
    InvalidEphemeralKey,

    #[error("participant has no ephemeral key for this session")]
    MissingEphemeralKey,

    #[error("pairwise secret has not been computed yet")]
    MissingPairwiseSecret,

    #[error("participant \"{0}\" failed triple-dh authentication")]
    AuthenticationFailed(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::identity::{LongTermIdentity, PrivateKey};
    use crate::crypto::Rng;

    use super::{Participant, ParticipantId};

    struct Member {
        identity: LongTermIdentity,
        ephemeral: PrivateKey,
    }

    impl Member {
        fn new(rng: &Rng) -> Self {
            Self {
                identity: LongTermIdentity::generate(rng).unwrap(),
                ephemeral: PrivateKey::from_rng(rng).unwrap(),
            }
        }

        fn id(&self, nickname: &str) -> ParticipantId {
            ParticipantId::new(nickname, self.identity.public_key())
        }

        /// Our record of another member.
        fn record_of(&self, nickname: &str, other: &Member) -> Participant {
            let mut participant = Participant::new(other.id(nickname));
            participant.set_ephemeral_key(other.ephemeral.public_key());
            participant
                .compute_p2p(&self.identity, &self.ephemeral)
                .unwrap();
            participant
        }
    }

    #[test]
    fn mutual_authentication() {
        let rng = Rng::from_seed([1; 32]);

        let alice = Member::new(&rng);
        let bob = Member::new(&rng);

        let mut alices_bob = alice.record_of("bob", &bob);
        let mut bobs_alice = bob.record_of("alice", &alice);

        // Alice proves herself to Bob.
        let token = alices_bob.authenticate_to(&alice.id("alice")).unwrap();
        assert!(alices_bob.has_authed_to());

        assert!(bobs_alice.be_authenticated(&alice.id("alice"), &token).is_ok());
        assert!(bobs_alice.is_authenticated());
    }

    #[test]
    fn forged_token_is_rejected() {
        let rng = Rng::from_seed([2; 32]);

        let alice = Member::new(&rng);
        let bob = Member::new(&rng);
        let eve = Member::new(&rng);

        let mut bobs_eve = bob.record_of("eve", &eve);

        // Eve does not know the pairwise secret between herself and Bob when she pretends to be
        // someone else entirely.
        let mut eves_view_of_alice = eve.record_of("alice", &alice);
        let forged = eves_view_of_alice.authenticate_to(&eve.id("eve")).unwrap();

        assert!(bobs_eve.be_authenticated(&eve.id("eve"), &forged).is_err());
        assert!(!bobs_eve.is_authenticated());
    }

    #[test]
    fn token_binds_the_authenticator_id() {
        let rng = Rng::from_seed([3; 32]);

        let alice = Member::new(&rng);
        let bob = Member::new(&rng);

        let mut alices_bob = alice.record_of("bob", &bob);
        let mut bobs_alice = bob.record_of("alice", &alice);

        let token = alices_bob.authenticate_to(&alice.id("alice")).unwrap();

        // The same token under a different claimed identity must fail.
        let impostor = ParticipantId::new("mallory", alice.identity.public_key());
        assert!(bobs_alice.be_authenticated(&impostor, &token).is_err());
    }
}
