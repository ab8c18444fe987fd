// SPDX-License-Identifier: MIT OR Apache-2.0

//! State machine for one group-key epoch.
//!
//! A session is created for a fixed set of members and never changes membership: any join or
//! leave constructs a successor session which runs its own key agreement and replaces this one on
//! confirmation. Within its lifetime a session drives mutual authentication, the key-share
//! exchange, transcript-checked message delivery and the liveness timers.
//!
//! ## Key agreement
//!
//! Members are arranged in a cycle by participant index. Every adjacent pair shares a pairwise
//! triple Diffie-Hellman secret, hashed together with the session id into a link key:
//! `link_i = SHA256(p2p(i, i+1 mod n) || session_id)`. The share member `i` publishes is
//! `z_i = link_(i-1) XOR link_i`. Once all shares are present each member unwinds the cycle from
//! the two links it owns, checks that the recovered cycle closes, and derives
//! `group_key = SHA256(session_id || link_0 || .. || link_(n-1))`.
//!
//! Published shares reveal nothing on their own: recovering any link requires one of the pairwise
//! secrets, and those never leave the members holding them. The links depend on ephemeral key
//! material which is destroyed with the session, so recording the transcript and later obtaining
//! every long-term key does not recover the group key.
use std::collections::{BTreeMap, HashMap};

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::aead::{aead_decrypt, aead_encrypt, AeadError, AeadNonce};
use crate::crypto::identity::{IdentityError, LongTermIdentity, PrivateKey, PublicKey};
use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError, Secret};
use crate::message::{self, Body, MessageError, MessageType, ParsedMessage, RosterEntry};
use crate::ops::{AppOps, RoomAction, TimerEvent, TimerHandle, TimerKind};
use crate::participant::{
    Participant, ParticipantError, ParticipantId, UnauthenticatedParticipant, AUTH_TOKEN_SIZE,
    KEY_SHARE_SIZE,
};
use crate::session_id::{SessionId, SessionIdError};
use crate::transcript::{TranscriptChain, TranscriptHash};

const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
const ACK_AWAIT_INTERVAL_MS: u64 = 10_000;
const ACK_SEND_INTERVAL_MS: u64 = 5_000;

/// Plaintext carried by a graceful exit.
const FAREWELL_PLAINTEXT: &str = "farewell";

/// Everything a session needs from its owning user state while processing an event.
pub(crate) struct SessionContext<'a, O: AppOps> {
    pub identity: &'a LongTermIdentity,
    pub ops: &'a mut O,
    pub rng: &'a Rng,
}

/// Lifecycle of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Joiner: waiting for the incumbents' session views.
    JoinRequested,

    /// Incumbent: answered a join request, waiting for the joiner to authenticate.
    RepliedToNewJoin,

    /// Incumbent: published a fresh share after a leave, waiting for the other shares.
    ReShared,

    /// All shares present, group key derived, confirmation broadcast.
    GroupKeyGenerated,

    /// Every member confirmed the key; the session carries user messages.
    InSession,

    /// The local user asked to leave and said farewell.
    LeaveRequested,

    /// Another member left; this session only exists until its successor takes over.
    Farewelled,

    /// Terminal and absorbing. Messages addressed to a dead session are discarded.
    Dead,
}

/// Instruction for the session tree after an event was processed.
#[derive(Debug)]
pub(crate) enum SessionVerdict {
    /// Nothing structural happened.
    Stay,

    /// The session reached [`SessionState::InSession`] and should become the active session.
    Promote,

    /// A joiner observed a different room view; a sibling joiner session should be spawned with
    /// this roster and this session discarded.
    RespawnJoiner(Vec<UnauthenticatedParticipant>),

    /// A member left; an incumbent-on-leave successor should be constructed.
    ShrinkOnLeave(String),

    /// A fatal failure; the session must be killed.
    Die,
}

/// Result of feeding one event into a session.
#[derive(Debug)]
pub(crate) struct SessionOutput {
    pub action: RoomAction,
    pub verdict: SessionVerdict,
}

impl SessionOutput {
    fn stay() -> Self {
        Self {
            action: RoomAction::None,
            verdict: SessionVerdict::Stay,
        }
    }

    fn stay_with(action: RoomAction) -> Self {
        Self {
            action,
            verdict: SessionVerdict::Stay,
        }
    }

    fn die(action: RoomAction) -> Self {
        Self {
            action,
            verdict: SessionVerdict::Die,
        }
    }
}

/// One group-key epoch within a room.
pub struct Session {
    room: String,
    my_id: ParticipantId,
    participants: BTreeMap<String, Participant>,
    /// Nicknames in sorted order; the position is the stable in-session index.
    peers: Vec<String>,
    session_id: SessionId,
    ephemeral: PrivateKey,
    confirmed: Vec<bool>,
    /// Confirmations which arrived before we derived the key ourselves.
    pending_confirmations: HashMap<String, [u8; 32]>,
    group_key: Option<Secret<32>>,
    transcript: TranscriptChain,
    state: SessionState,
    joiner_auth_sent: bool,
    farewell_sent: bool,
    heartbeat_timer: Option<TimerHandle>,
    ack_await_timers: HashMap<String, TimerHandle>,
    ack_send_timer: Option<TimerHandle>,
}

/// Hashes a pairwise secret into the link key between two adjacent members of the cycle.
pub(crate) fn link_key(p2p: &Secret<32>, session_id: &SessionId) -> [u8; KEY_SHARE_SIZE] {
    sha2_256(&[p2p.as_bytes(), session_id.as_bytes()])
}

/// Combines the two links a member sits between into its published share.
pub(crate) fn xor_keys(a: &[u8; KEY_SHARE_SIZE], b: &[u8; KEY_SHARE_SIZE]) -> [u8; KEY_SHARE_SIZE] {
    let mut out = [0u8; KEY_SHARE_SIZE];
    for (index, byte) in out.iter_mut().enumerate() {
        *byte = a[index] ^ b[index];
    }
    out
}

impl Session {
    /// Shared tail of all constructors: index assignment, session id and transcript seed.
    fn from_parts(
        room: String,
        my_id: ParticipantId,
        ephemeral: PrivateKey,
        participants: BTreeMap<String, Participant>,
        state: SessionState,
    ) -> Result<Self, SessionError> {
        let mut members = Vec::with_capacity(participants.len());
        for participant in participants.values() {
            let ephemeral_key = participant.ephemeral_key().ok_or_else(|| {
                SessionError::MissingEphemeralKey(participant.nickname().to_owned())
            })?;
            members.push((participant.nickname(), ephemeral_key));
        }
        let session_id = SessionId::compute(members)?;

        let peers: Vec<String> = participants.keys().cloned().collect();
        let confirmed = vec![false; peers.len()];
        let transcript = TranscriptChain::new(&session_id);

        Ok(Self {
            room,
            my_id,
            participants,
            peers,
            session_id,
            ephemeral,
            confirmed,
            pending_confirmations: HashMap::new(),
            group_key: None,
            transcript,
            state,
            joiner_auth_sent: false,
            farewell_sent: false,
            heartbeat_timer: None,
            ack_await_timers: HashMap::new(),
            ack_send_timer: None,
        })
    }

    /// Builds a session for a local user entering a room.
    ///
    /// Generates a fresh ephemeral key pair and broadcasts a JOIN_REQUEST. When the roster names
    /// nobody but the local user the session bootstraps itself: it derives its key on the spot
    /// and is ready to be activated.
    pub(crate) fn joiner<O: AppOps>(
        room: &str,
        my_id: ParticipantId,
        roster: &[UnauthenticatedParticipant],
        ctx: &mut SessionContext<O>,
    ) -> Result<Self, SessionError> {
        let ephemeral = PrivateKey::from_rng(ctx.rng)?;

        let mut participants = BTreeMap::new();
        for entry in roster {
            if entry.id.nickname == my_id.nickname {
                continue;
            }
            let mut participant = Participant::new(entry.id.clone());
            participant.set_ephemeral_key(entry.ephemeral_key);
            participants.insert(entry.id.nickname.clone(), participant);
        }

        let mut myself = Participant::new(my_id.clone());
        myself.set_ephemeral_key(ephemeral.public_key());
        myself.mark_authenticated();
        participants.insert(my_id.nickname.clone(), myself);

        let mut session = Self::from_parts(
            room.to_owned(),
            my_id,
            ephemeral,
            participants,
            SessionState::JoinRequested,
        )?;

        if session.peers.len() == 1 {
            session.group_enc(ctx.identity)?;
            session.derive_group_key()?;
            session.confirmed = vec![true];
            session.state = SessionState::InSession;
            debug!(room, session_id = %session.session_id, "bootstrapped solo session");
            return Ok(session);
        }

        let body = Body::JoinRequest {
            joiner: RosterEntry::new(&session.my_id, &session.ephemeral.public_key()),
        };
        session.broadcast(&body, ctx)?;
        debug!(room, session_id = %session.session_id, "requested to join");
        Ok(session)
    }

    /// Builds a sibling joiner from the room view observed in an incumbent's PARTICIPANT_INFO.
    ///
    /// The dying sibling's ephemeral key is reused: the observed session id was derived over it,
    /// and the incumbents already replied to the original JOIN_REQUEST.
    pub(crate) fn joiner_from_view(
        room: &str,
        my_id: ParticipantId,
        roster: &[UnauthenticatedParticipant],
        ephemeral: PrivateKey,
    ) -> Result<Self, SessionError> {
        let mut participants = BTreeMap::new();
        for entry in roster {
            if entry.id.nickname == my_id.nickname {
                continue;
            }
            let mut participant = Participant::new(entry.id.clone());
            participant.set_ephemeral_key(entry.ephemeral_key);
            participants.insert(entry.id.nickname.clone(), participant);
        }

        let mut myself = Participant::new(my_id.clone());
        myself.set_ephemeral_key(ephemeral.public_key());
        myself.mark_authenticated();
        participants.insert(my_id.nickname.clone(), myself);

        let session = Self::from_parts(
            room.to_owned(),
            my_id,
            ephemeral,
            participants,
            SessionState::JoinRequested,
        )?;
        debug!(room, session_id = %session.session_id, "respawned joiner with observed view");
        Ok(session)
    }

    /// Builds the successor session an incumbent constructs when a JOIN_REQUEST arrives.
    ///
    /// Inherits the parent's participant map. Incumbent ephemerals are unchanged, so their
    /// pairwise secrets and authentication carry over; only the key shares are reset for the new
    /// epoch. Replies with PARTICIPANT_INFO carrying the session view, an authentication token
    /// for the joiner and the local share.
    pub(crate) fn incumbent_on_join<O: AppOps>(
        parent: &Session,
        joiner: &RosterEntry,
        ctx: &mut SessionContext<O>,
    ) -> Result<Self, SessionError> {
        let joiner = joiner.to_unauthenticated()?;
        if parent.participants.contains_key(&joiner.id.nickname) {
            return Err(SessionError::DuplicateNickname(joiner.id.nickname));
        }

        let mut participants = parent.participants.clone();
        for participant in participants.values_mut() {
            participant.reset_keyshare();
        }
        let joiner_nickname = joiner.id.nickname.clone();
        let mut record = Participant::new(joiner.id);
        record.set_ephemeral_key(joiner.ephemeral_key);
        participants.insert(joiner_nickname.clone(), record);

        let mut session = Self::from_parts(
            parent.room.clone(),
            parent.my_id.clone(),
            parent.ephemeral.clone(),
            participants,
            SessionState::RepliedToNewJoin,
        )?;

        session.group_enc(ctx.identity)?;

        let my_id = session.my_id.clone();
        let token = session
            .participants
            .get_mut(&joiner_nickname)
            .expect("joiner was inserted above")
            .authenticate_to(&my_id)?;
        let body = Body::ParticipantInfo {
            roster: session.roster(),
            joiner_auth: token,
            key_share: session.my_keyshare()?,
        };
        session.broadcast(&body, ctx)?;
        debug!(
            room = %session.room,
            session_id = %session.session_id,
            joiner = %joiner_nickname,
            "replied to join request"
        );
        Ok(session)
    }

    /// Builds the successor session an incumbent constructs when a member leaves.
    ///
    /// Drops the leaver, recomputes the id and publishes a fresh share. When the leaver was the
    /// only other member the survivor bootstraps a solo session instead.
    pub(crate) fn incumbent_on_leave<O: AppOps>(
        parent: &Session,
        leaver: &str,
        ctx: &mut SessionContext<O>,
    ) -> Result<Self, SessionError> {
        let mut participants = parent.participants.clone();
        participants
            .remove(leaver)
            .ok_or_else(|| SessionError::UnknownPeer(leaver.to_owned()))?;
        for participant in participants.values_mut() {
            participant.reset_keyshare();
        }

        let mut session = Self::from_parts(
            parent.room.clone(),
            parent.my_id.clone(),
            parent.ephemeral.clone(),
            participants,
            SessionState::ReShared,
        )?;

        session.group_enc(ctx.identity)?;

        if session.peers.len() == 1 {
            session.derive_group_key()?;
            session.confirmed = vec![true];
            session.state = SessionState::InSession;
            debug!(room = %session.room, session_id = %session.session_id, "shrunk to solo session");
            return Ok(session);
        }

        let body = Body::ReShare {
            key_share: session.my_keyshare()?,
        };
        session.broadcast(&body, ctx)?;
        debug!(
            room = %session.room,
            session_id = %session.session_id,
            leaver,
            "published fresh share after leave"
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Nicknames of all members in index order.
    pub fn members(&self) -> &[String] {
        &self.peers
    }

    pub fn contains(&self, nickname: &str) -> bool {
        self.participants.contains_key(nickname)
    }

    /// The members of this session in host-facing form, suitable as the roster a prospective
    /// joiner needs to derive the same session id as the incumbents.
    pub fn unauthenticated_roster(&self) -> Vec<UnauthenticatedParticipant> {
        self.participants
            .values()
            .map(|participant| UnauthenticatedParticipant {
                id: participant.id().clone(),
                ephemeral_key: *participant
                    .ephemeral_key()
                    .expect("all ephemeral keys were checked at construction"),
            })
            .collect()
    }

    pub(crate) fn clone_ephemeral(&self) -> PrivateKey {
        self.ephemeral.clone()
    }

    /// Session id a join of `joiner` onto `parent` would produce, used to deduplicate replies.
    pub(crate) fn child_id_on_join(
        parent: &Session,
        joiner: &UnauthenticatedParticipant,
    ) -> Result<SessionId, SessionError> {
        let mut members: Vec<(&str, &PublicKey)> = parent
            .participants
            .values()
            .map(|participant| {
                (
                    participant.nickname(),
                    participant
                        .ephemeral_key()
                        .expect("all ephemeral keys were checked at construction"),
                )
            })
            .collect();
        members.push((&joiner.id.nickname, &joiner.ephemeral_key));
        Ok(SessionId::compute(members)?)
    }

    /// Session id the departure of `leaver` from `parent` would produce.
    pub(crate) fn child_id_on_leave(
        parent: &Session,
        leaver: &str,
    ) -> Result<SessionId, SessionError> {
        let members = parent
            .participants
            .values()
            .filter(|participant| participant.nickname() != leaver)
            .map(|participant| {
                (
                    participant.nickname(),
                    participant
                        .ephemeral_key()
                        .expect("all ephemeral keys were checked at construction"),
                )
            });
        Ok(SessionId::compute(members)?)
    }

    fn index_of(&self, nickname: &str) -> Option<usize> {
        self.peers.iter().position(|peer| peer == nickname)
    }

    fn my_index(&self) -> usize {
        self.index_of(&self.my_id.nickname)
            .expect("local user is always a participant")
    }

    fn roster(&self) -> Vec<RosterEntry> {
        self.participants
            .values()
            .map(|participant| {
                RosterEntry::new(
                    participant.id(),
                    participant
                        .ephemeral_key()
                        .expect("all ephemeral keys were checked at construction"),
                )
            })
            .collect()
    }

    fn my_keyshare(&self) -> Result<[u8; KEY_SHARE_SIZE], SessionError> {
        self.participants
            .get(&self.my_id.nickname)
            .and_then(|participant| participant.cur_keyshare().copied())
            .ok_or(SessionError::MissingKeyShare)
    }

    fn broadcast<O: AppOps>(
        &self,
        body: &Body,
        ctx: &mut SessionContext<O>,
    ) -> Result<(), SessionError> {
        let session_id = match body {
            Body::JoinRequest { .. } => None,
            _ => Some(&self.session_id),
        };
        let payload = message::encode(session_id, &self.my_id.nickname, body, &self.ephemeral)?;
        ctx.ops.send_bare(&self.room, &self.my_id.nickname, &payload);
        Ok(())
    }

    /// Computes the local key share for this epoch.
    ///
    /// Derives the pairwise secrets with every peer on the way, since the cycle links and the
    /// authentication tokens both need them.
    fn group_enc(&mut self, identity: &LongTermIdentity) -> Result<(), SessionError> {
        let n = self.peers.len();
        let me = self.my_index();

        if n == 1 {
            // Alone in the room. Binding the share to the ephemeral seed keeps the derived key
            // non-public even though there is nobody to agree with.
            let share = sha2_256(&[&self.ephemeral.to_bytes(), self.session_id.as_bytes()]);
            self.set_my_keyshare(share);
            return Ok(());
        }

        for nickname in self.peers.clone() {
            if nickname == self.my_id.nickname {
                continue;
            }
            self.participants
                .get_mut(&nickname)
                .expect("peers mirrors the participant map")
                .compute_p2p(identity, &self.ephemeral)?;
        }

        let left_link = self.link_with(self.peers[(me + n - 1) % n].clone())?;
        let right_link = self.link_with(self.peers[(me + 1) % n].clone())?;
        let share = xor_keys(&left_link, &right_link);
        self.set_my_keyshare(share);
        Ok(())
    }

    fn link_with(&self, nickname: String) -> Result<[u8; KEY_SHARE_SIZE], SessionError> {
        let p2p = self
            .participants
            .get(&nickname)
            .and_then(|participant| participant.p2p_key())
            .ok_or(SessionError::MissingPairwiseSecret)?;
        Ok(link_key(p2p, &self.session_id))
    }

    fn set_my_keyshare(&mut self, share: [u8; KEY_SHARE_SIZE]) {
        self.participants
            .get_mut(&self.my_id.nickname)
            .expect("local user is always a participant")
            .set_keyshare(share);
    }

    fn everybody_authenticated_and_contributed(&self) -> bool {
        self.participants
            .values()
            .all(|participant| participant.is_authenticated() && participant.cur_keyshare().is_some())
    }

    fn everybody_confirmed(&self) -> bool {
        self.confirmed.iter().all(|confirmed| *confirmed)
    }

    /// Recovers every cycle link from the published shares and derives the group key.
    fn derive_group_key(&mut self) -> Result<(), SessionError> {
        let n = self.peers.len();
        let me = self.my_index();

        let key = if n == 1 {
            sha2_256(&[self.session_id.as_bytes(), &self.my_keyshare()?])
        } else {
            let mut links = vec![[0u8; KEY_SHARE_SIZE]; n];
            links[me] = self.link_with(self.peers[(me + 1) % n].clone())?;

            for step in 1..n {
                let index = (me + step) % n;
                let share = self
                    .participants
                    .get(&self.peers[index])
                    .and_then(|participant| participant.cur_keyshare())
                    .ok_or(SessionError::MissingKeyShare)?;
                links[index] = xor_keys(share, &links[(index + n - 1) % n]);
            }

            // The unwound cycle must close on the link we know first-hand.
            let left_index = (me + n - 1) % n;
            let expected = self.link_with(self.peers[left_index].clone())?;
            if !bool::from(links[left_index].ct_eq(&expected)) {
                return Err(SessionError::InconsistentKeyShares);
            }

            let mut parts: Vec<&[u8]> = Vec::with_capacity(n + 1);
            parts.push(self.session_id.as_bytes());
            for link in &links {
                parts.push(link);
            }
            sha2_256(&parts)
        };

        self.group_key = Some(Secret::from_bytes(key));
        Ok(())
    }

    fn confirmation_token(&self, id: &ParticipantId) -> Option<[u8; 32]> {
        self.group_key
            .as_ref()
            .map(|key| sha2_256(&[key.as_bytes(), &id.to_bytes()]))
    }

    /// Derives the key and broadcasts our confirmation once every member authenticated and
    /// contributed. Also settles confirmations which arrived early.
    fn try_complete_key_agreement<O: AppOps>(
        &mut self,
        ctx: &mut SessionContext<O>,
    ) -> Result<SessionVerdict, SessionError> {
        if self.group_key.is_some() || !self.everybody_authenticated_and_contributed() {
            return Ok(SessionVerdict::Stay);
        }

        self.derive_group_key()?;

        let confirmation = self
            .confirmation_token(&self.my_id)
            .expect("group key was derived above");
        self.broadcast(&Body::SessionConfirmation { confirmation }, ctx)?;
        self.state = SessionState::GroupKeyGenerated;
        debug!(room = %self.room, session_id = %self.session_id, "group key generated");

        let pending: Vec<(String, [u8; 32])> = self.pending_confirmations.drain().collect();
        for (nickname, token) in pending {
            if !self.settle_confirmation(&nickname, &token)? {
                return Err(SessionError::InvalidConfirmation(nickname));
            }
        }

        if self.everybody_confirmed() {
            self.state = SessionState::InSession;
            return Ok(SessionVerdict::Promote);
        }
        Ok(SessionVerdict::Stay)
    }

    /// Validates a confirmation against the derived key and marks the sender's bit.
    fn settle_confirmation(
        &mut self,
        sender: &str,
        token: &[u8; 32],
    ) -> Result<bool, SessionError> {
        let index = self
            .index_of(sender)
            .ok_or_else(|| SessionError::UnknownPeer(sender.to_owned()))?;
        let id = self.participants[sender].id().clone();
        let expected = self
            .confirmation_token(&id)
            .expect("only called once the group key exists");
        if !bool::from(expected.ct_eq(token)) {
            return Ok(false);
        }
        self.confirmed[index] = true;
        Ok(true)
    }

    /// Feeds one inbound protocol message into the state machine.
    pub(crate) fn receive<O: AppOps>(
        &mut self,
        msg: &ParsedMessage,
        message_id: u32,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if self.state == SessionState::Dead {
            trace!(session_id = %self.session_id, "discarding message for dead session");
            return SessionOutput::stay();
        }

        let Some(sender) = self.participants.get(&msg.sender) else {
            trace!(sender = %msg.sender, "discarding message from unknown sender");
            return SessionOutput::stay();
        };
        let Some(ephemeral_key) = sender.ephemeral_key() else {
            trace!(sender = %msg.sender, "discarding message, sender has no ephemeral key");
            return SessionOutput::stay();
        };
        if !msg.verify(ephemeral_key) {
            debug!(
                sender = %msg.sender,
                kind = %msg.message_type(),
                "discarding message with invalid signature"
            );
            return SessionOutput::stay();
        }

        let from_self = msg.sender == self.my_id.nickname;

        // A mismatched session id only means something to a joiner still waiting for the room
        // view; everything else addressed to another session is discarded.
        let id_matches = msg.session_id == Some(self.session_id);
        if !id_matches
            && !(self.state == SessionState::JoinRequested
                && msg.message_type() == MessageType::ParticipantInfo)
        {
            trace!(
                session_id = %self.session_id,
                kind = %msg.message_type(),
                "discarding message for another session"
            );
            return SessionOutput::stay();
        }

        // Any authentic sign of life from a peer settles our outstanding ack expectation.
        if !from_self {
            self.cancel_ack_await(&msg.sender, ctx);
        }

        match msg.body.clone() {
            Body::JoinRequest { .. } => SessionOutput::stay(),
            Body::ParticipantInfo {
                roster,
                joiner_auth,
                key_share,
            } => self.on_participant_info(
                &msg.sender,
                &roster,
                &joiner_auth,
                key_share,
                id_matches,
                from_self,
                ctx,
            ),
            Body::JoinerAuth {
                auth_tokens,
                key_share,
            } => self.on_joiner_auth(&msg.sender, &auth_tokens, key_share, from_self, ctx),
            Body::ReShare { key_share } => {
                self.on_re_share(&msg.sender, key_share, from_self, ctx)
            }
            Body::SessionConfirmation { confirmation } => {
                self.on_confirmation(&msg.sender, &confirmation)
            }
            Body::User {
                transcript_hash,
                nonce,
                ciphertext,
            } => self.on_user(
                &msg.sender,
                message_id,
                &transcript_hash,
                nonce,
                &ciphertext,
                from_self,
                ctx,
            ),
            Body::Farewell {
                transcript_hash, ..
            } => self.on_farewell(&msg.sender, &transcript_hash, from_self, ctx),
            Body::Heartbeat | Body::Ack => SessionOutput::stay(),
            Body::AckQuery => {
                if !from_self {
                    if let Err(err) = self.broadcast(&Body::Ack, ctx) {
                        warn!(%err, "failed to answer ack query");
                    }
                    self.cancel_ack_send(ctx);
                }
                SessionOutput::stay()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_participant_info<O: AppOps>(
        &mut self,
        sender: &str,
        roster: &[RosterEntry],
        joiner_auth: &[u8; AUTH_TOKEN_SIZE],
        key_share: [u8; KEY_SHARE_SIZE],
        id_matches: bool,
        from_self: bool,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if from_self {
            return SessionOutput::stay();
        }

        match self.state {
            SessionState::JoinRequested => {
                if !id_matches {
                    // Our expectation of the room was stale. Hand the observed view to a fresh
                    // sibling and let this session die.
                    let mut observed = Vec::with_capacity(roster.len());
                    for entry in roster {
                        match entry.to_unauthenticated() {
                            Ok(unauthenticated) => observed.push(unauthenticated),
                            Err(err) => {
                                debug!(%err, "discarding participant info with malformed roster");
                                return SessionOutput::stay();
                            }
                        }
                    }
                    debug!(
                        session_id = %self.session_id,
                        sender,
                        "session view mismatch, respawning joiner"
                    );
                    return SessionOutput {
                        action: RoomAction::None,
                        verdict: SessionVerdict::RespawnJoiner(observed),
                    };
                }

                // The incumbent authenticates to us with their token.
                let ephemeral = self.ephemeral.clone();
                let participant = self
                    .participants
                    .get_mut(sender)
                    .expect("sender presence was checked in receive");
                if let Err(err) = participant.compute_p2p(ctx.identity, &ephemeral) {
                    warn!(%err, sender, "failed to derive pairwise secret");
                    return SessionOutput::die(RoomAction::Display(format!(
                        "failed to establish a secure channel with {sender}"
                    )));
                }
                let sender_id = participant.id().clone();
                if participant.be_authenticated(&sender_id, joiner_auth).is_err() {
                    warn!(sender, "authentication failed, killing session");
                    return SessionOutput::die(RoomAction::Display(format!(
                        "{sender} failed authentication, their messages can not be trusted"
                    )));
                }
                participant.set_keyshare(key_share);

                if !self.joiner_auth_sent {
                    if let Err(err) = self.send_joiner_auth(ctx) {
                        warn!(%err, "failed to authenticate to the room");
                        return SessionOutput::die(RoomAction::Display(
                            "failed to authenticate to the room".to_owned(),
                        ));
                    }
                }

                self.complete_or_die(ctx)
            }
            SessionState::RepliedToNewJoin | SessionState::ReShared => {
                // A fellow incumbent's reply to the same join: their share for this epoch.
                let Some(participant) = self.participants.get_mut(sender) else {
                    return SessionOutput::stay();
                };
                if !participant.is_authenticated() {
                    trace!(sender, "ignoring share from unauthenticated participant");
                    return SessionOutput::stay();
                }
                participant.set_keyshare(key_share);
                self.complete_or_die(ctx)
            }
            _ => {
                trace!(state = ?self.state, "ignoring participant info in this state");
                SessionOutput::stay()
            }
        }
    }

    fn send_joiner_auth<O: AppOps>(
        &mut self,
        ctx: &mut SessionContext<O>,
    ) -> Result<(), SessionError> {
        self.group_enc(ctx.identity)?;

        let my_id = self.my_id.clone();
        let mut auth_tokens = BTreeMap::new();
        for (index, nickname) in self.peers.clone().into_iter().enumerate() {
            if nickname == my_id.nickname {
                continue;
            }
            let participant = self
                .participants
                .get_mut(&nickname)
                .expect("peers mirrors the participant map");
            let token = participant.authenticate_to(&my_id)?;
            auth_tokens.insert(index as u32, token);
        }

        let body = Body::JoinerAuth {
            auth_tokens,
            key_share: self.my_keyshare()?,
        };
        self.broadcast(&body, ctx)?;
        self.joiner_auth_sent = true;
        Ok(())
    }

    fn on_joiner_auth<O: AppOps>(
        &mut self,
        sender: &str,
        auth_tokens: &BTreeMap<u32, [u8; AUTH_TOKEN_SIZE]>,
        key_share: [u8; KEY_SHARE_SIZE],
        from_self: bool,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if from_self || self.state != SessionState::RepliedToNewJoin {
            trace!(state = ?self.state, "ignoring joiner auth in this state");
            return SessionOutput::stay();
        }

        let my_index = self.my_index() as u32;
        let ephemeral = self.ephemeral.clone();
        let Some(participant) = self.participants.get_mut(sender) else {
            return SessionOutput::stay();
        };

        if let Err(err) = participant.compute_p2p(ctx.identity, &ephemeral) {
            warn!(%err, sender, "failed to derive pairwise secret");
            return SessionOutput::die(RoomAction::Display(format!(
                "failed to establish a secure channel with {sender}"
            )));
        }

        let sender_id = participant.id().clone();
        let authenticated = match auth_tokens.get(&my_index) {
            Some(token) => participant.be_authenticated(&sender_id, token).is_ok(),
            None => false,
        };
        if !authenticated {
            warn!(sender, "joiner failed authentication, killing session");
            return SessionOutput::die(RoomAction::Display(format!(
                "{sender} failed authentication, their messages can not be trusted"
            )));
        }
        participant.set_keyshare(key_share);

        self.complete_or_die(ctx)
    }

    fn on_re_share<O: AppOps>(
        &mut self,
        sender: &str,
        key_share: [u8; KEY_SHARE_SIZE],
        from_self: bool,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if from_self || self.state != SessionState::ReShared {
            trace!(state = ?self.state, "ignoring re-share in this state");
            return SessionOutput::stay();
        }

        let Some(participant) = self.participants.get_mut(sender) else {
            return SessionOutput::stay();
        };
        if !participant.is_authenticated() {
            trace!(sender, "ignoring share from unauthenticated participant");
            return SessionOutput::stay();
        }
        participant.set_keyshare(key_share);

        self.complete_or_die(ctx)
    }

    fn complete_or_die<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) -> SessionOutput {
        match self.try_complete_key_agreement(ctx) {
            Ok(verdict) => SessionOutput {
                action: RoomAction::None,
                verdict,
            },
            Err(err) => {
                warn!(%err, session_id = %self.session_id, "key agreement failed");
                SessionOutput::die(RoomAction::Display(
                    "group key agreement failed, the session was abandoned".to_owned(),
                ))
            }
        }
    }

    fn on_confirmation(&mut self, sender: &str, token: &[u8; 32]) -> SessionOutput {
        if self.state == SessionState::InSession {
            // Late duplicate; the epoch is already established.
            return SessionOutput::stay();
        }

        if self.group_key.is_none() {
            // The peer derived the key before we did; settle once we catch up.
            self.pending_confirmations
                .insert(sender.to_owned(), *token);
            return SessionOutput::stay();
        }

        match self.settle_confirmation(sender, token) {
            Ok(true) => {
                if self.everybody_confirmed() {
                    self.state = SessionState::InSession;
                    debug!(room = %self.room, session_id = %self.session_id, "session confirmed");
                    return SessionOutput {
                        action: RoomAction::None,
                        verdict: SessionVerdict::Promote,
                    };
                }
                SessionOutput::stay()
            }
            Ok(false) => {
                warn!(sender, "invalid session confirmation, killing session");
                SessionOutput::die(RoomAction::Display(format!(
                    "{sender} confirmed a different group key, the session can not be trusted"
                )))
            }
            Err(_) => SessionOutput::stay(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_user<O: AppOps>(
        &mut self,
        sender: &str,
        message_id: u32,
        transcript_hash: &TranscriptHash,
        nonce: AeadNonce,
        ciphertext: &[u8],
        from_self: bool,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if !matches!(
            self.state,
            SessionState::InSession | SessionState::LeaveRequested | SessionState::Farewelled
        ) {
            trace!(state = ?self.state, "ignoring user message in this state");
            return SessionOutput::stay();
        }

        if !self.transcript.matches(transcript_hash) {
            warn!(
                sender,
                session_id = %self.session_id,
                "transcript inconsistency, refusing delivery"
            );
            return SessionOutput::stay_with(RoomAction::Display(format!(
                "transcript inconsistency detected on a message from {sender}"
            )));
        }

        let Some(group_key) = self.group_key.as_ref() else {
            return SessionOutput::stay();
        };
        let plaintext = match aead_decrypt(group_key, nonce, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(%err, sender, "failed to decrypt message under the group key");
                return SessionOutput::die(RoomAction::Display(format!(
                    "a message from {sender} could not be decrypted, the session was abandoned"
                )));
            }
        };
        let Ok(plaintext) = String::from_utf8(plaintext) else {
            debug!(sender, "discarding message with non-utf8 plaintext");
            return SessionOutput::stay();
        };

        self.transcript.extend(message_id, &plaintext);

        if from_self {
            return SessionOutput::stay();
        }

        ctx.ops.display_message(&self.room, &plaintext);
        self.arm_ack_send(ctx);
        SessionOutput::stay_with(RoomAction::Display(plaintext))
    }

    fn on_farewell<O: AppOps>(
        &mut self,
        sender: &str,
        transcript_hash: &TranscriptHash,
        from_self: bool,
        ctx: &mut SessionContext<O>,
    ) -> SessionOutput {
        if from_self {
            return SessionOutput::stay();
        }

        if !self.transcript.matches(transcript_hash) {
            warn!(sender, "farewell carries a diverging transcript head");
        }

        match self.state {
            SessionState::InSession => {
                // Answer with our own transcript head so the leaver can check consistency, then
                // let the tree build the shrunk successor.
                if let Err(err) = self.send_farewell(ctx) {
                    warn!(%err, "failed to send farewell");
                }
                self.state = SessionState::Farewelled;
                debug!(room = %self.room, session_id = %self.session_id, leaver = sender, "member left");
                SessionOutput {
                    action: RoomAction::None,
                    verdict: SessionVerdict::ShrinkOnLeave(sender.to_owned()),
                }
            }
            _ => SessionOutput::stay(),
        }
    }

    /// Encrypts and broadcasts a chat message on this session.
    pub(crate) fn send_user<O: AppOps>(
        &mut self,
        plaintext: &str,
        ctx: &mut SessionContext<O>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::InSession {
            return Err(SessionError::NotEstablished(self.state));
        }
        let group_key = self.group_key.as_ref().ok_or(SessionError::MissingGroupKey)?;

        let nonce: AeadNonce = ctx.rng.random_array()?;
        let ciphertext = aead_encrypt(group_key, nonce, plaintext.as_bytes())?;
        let body = Body::User {
            transcript_hash: *self.transcript.last_hash(),
            nonce,
            ciphertext,
        };
        self.broadcast(&body, ctx)?;

        // Broadcasting acknowledges everything we owed; now the peers owe us.
        self.cancel_ack_send(ctx);
        self.arm_ack_awaits(ctx);
        Ok(())
    }

    /// The local user leaves the room gracefully.
    pub(crate) fn leave<O: AppOps>(
        &mut self,
        ctx: &mut SessionContext<O>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::InSession {
            return Err(SessionError::NotEstablished(self.state));
        }
        self.send_farewell(ctx)?;
        self.state = SessionState::LeaveRequested;
        debug!(room = %self.room, session_id = %self.session_id, "leave requested");
        Ok(())
    }

    fn send_farewell<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) -> Result<(), SessionError> {
        if self.farewell_sent {
            return Ok(());
        }
        let body = Body::Farewell {
            transcript_hash: *self.transcript.last_hash(),
            farewell: FAREWELL_PLAINTEXT.to_owned(),
        };
        self.broadcast(&body, ctx)?;
        self.farewell_sent = true;
        Ok(())
    }

    /// Emits a still-pending farewell; called right before a replaced session is dropped.
    pub(crate) fn flush_farewell<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        if matches!(
            self.state,
            SessionState::LeaveRequested | SessionState::Farewelled
        ) && !self.farewell_sent
        {
            if let Err(err) = self.send_farewell(ctx) {
                warn!(%err, "failed to flush farewell");
            }
        }
    }

    /// A member notice from the transport told us `leaver` is gone without a farewell.
    ///
    /// Returns true when a shrunk successor session should be constructed.
    pub(crate) fn handle_peer_leave<O: AppOps>(
        &mut self,
        leaver: &str,
        ctx: &mut SessionContext<O>,
    ) -> bool {
        if self.state != SessionState::InSession
            || leaver == self.my_id.nickname
            || !self.participants.contains_key(leaver)
        {
            return false;
        }
        if let Err(err) = self.send_farewell(ctx) {
            warn!(%err, "failed to send farewell");
        }
        self.state = SessionState::Farewelled;
        debug!(room = %self.room, session_id = %self.session_id, leaver, "member left the transport");
        true
    }

    /// Handles an expired timer. Timer callbacks run under the same serialization discipline as
    /// inbound messages.
    pub(crate) fn timer_fired<O: AppOps>(
        &mut self,
        kind: TimerKind,
        peer: Option<&str>,
        ctx: &mut SessionContext<O>,
    ) -> RoomAction {
        if self.state == SessionState::Dead {
            return RoomAction::None;
        }

        match kind {
            TimerKind::Heartbeat => {
                self.heartbeat_timer = None;
                if self.state == SessionState::InSession {
                    if let Err(err) = self.broadcast(&Body::Heartbeat, ctx) {
                        warn!(%err, "failed to send heartbeat");
                    }
                    // A heartbeat is a broadcast like any other and settles what we owed.
                    self.cancel_ack_send(ctx);
                    self.arm_heartbeat(ctx);
                }
                RoomAction::None
            }
            TimerKind::AckAwait => {
                let Some(peer) = peer else {
                    return RoomAction::None;
                };
                self.ack_await_timers.remove(peer);
                if let Err(err) = self.broadcast(&Body::AckQuery, ctx) {
                    warn!(%err, "failed to send ack query");
                }
                warn!(room = %self.room, peer, "peer has not acknowledged, possible deadlock");
                RoomAction::Display(format!("{peer} is not responding"))
            }
            TimerKind::AckSend => {
                self.ack_send_timer = None;
                if let Err(err) = self.broadcast(&Body::Ack, ctx) {
                    warn!(%err, "failed to send ack");
                }
                RoomAction::None
            }
        }
    }

    /// Arms the periodic heartbeat; called when the session becomes active.
    pub(crate) fn arm_heartbeat<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        if self.heartbeat_timer.is_some() {
            return;
        }
        let event = TimerEvent {
            room: self.room.clone(),
            session_id: self.session_id,
            kind: TimerKind::Heartbeat,
            peer: None,
        };
        self.heartbeat_timer = Some(ctx.ops.set_timer(event, HEARTBEAT_INTERVAL_MS));
    }

    fn arm_ack_awaits<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        for nickname in self.peers.clone() {
            if nickname == self.my_id.nickname || self.ack_await_timers.contains_key(&nickname) {
                continue;
            }
            let event = TimerEvent {
                room: self.room.clone(),
                session_id: self.session_id,
                kind: TimerKind::AckAwait,
                peer: Some(nickname.clone()),
            };
            let handle = ctx.ops.set_timer(event, ACK_AWAIT_INTERVAL_MS);
            self.ack_await_timers.insert(nickname, handle);
        }
    }

    fn cancel_ack_await<O: AppOps>(&mut self, peer: &str, ctx: &mut SessionContext<O>) {
        if let Some(handle) = self.ack_await_timers.remove(peer) {
            ctx.ops.axe_timer(handle);
        }
    }

    fn arm_ack_send<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        if self.ack_send_timer.is_some() {
            return;
        }
        let event = TimerEvent {
            room: self.room.clone(),
            session_id: self.session_id,
            kind: TimerKind::AckSend,
            peer: None,
        };
        self.ack_send_timer = Some(ctx.ops.set_timer(event, ACK_SEND_INTERVAL_MS));
    }

    fn cancel_ack_send<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        if let Some(handle) = self.ack_send_timer.take() {
            ctx.ops.axe_timer(handle);
        }
    }

    /// Cancels every timer and releases the key material. Terminal.
    pub(crate) fn kill<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        if self.state == SessionState::Dead {
            return;
        }
        if let Some(handle) = self.heartbeat_timer.take() {
            ctx.ops.axe_timer(handle);
        }
        for (_, handle) in self.ack_await_timers.drain() {
            ctx.ops.axe_timer(handle);
        }
        if let Some(handle) = self.ack_send_timer.take() {
            ctx.ops.axe_timer(handle);
        }
        self.group_key = None;
        self.pending_confirmations.clear();
        self.state = SessionState::Dead;
        debug!(room = %self.room, session_id = %self.session_id, "session killed");
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("participant \"{0}\" has no ephemeral key, can not compute a session id")]
    MissingEphemeralKey(String),

    #[error("nickname \"{0}\" is already taken in this room")]
    DuplicateNickname(String),

    #[error("no participant \"{0}\" in this session")]
    UnknownPeer(String),

    #[error("session is not established, current state is {0:?}")]
    NotEstablished(SessionState),

    #[error("local key share has not been computed yet")]
    MissingKeyShare,

    #[error("pairwise secret has not been computed yet")]
    MissingPairwiseSecret,

    #[error("group key has not been derived yet")]
    MissingGroupKey,

    #[error("published key shares do not form a consistent cycle")]
    InconsistentKeyShares,

    #[error("confirmation from \"{0}\" does not match the derived group key")]
    InvalidConfirmation(String),

    #[error(transparent)]
    Participant(#[from] ParticipantError),

    #[error(transparent)]
    SessionId(#[from] SessionIdError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}
