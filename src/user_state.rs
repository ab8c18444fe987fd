// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-process engine state: the long-term identity, all rooms and the inbound message router.
use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::identity::{LongTermIdentity, PublicKey, PRIVATE_KEY_SIZE};
use crate::crypto::{Rng, RngError};
use crate::message::{self, Body, ParsedMessage};
use crate::ops::{AppOps, RoomAction, TimerEvent};
use crate::participant::{ParticipantId, UnauthenticatedParticipant};
use crate::room::SessionTree;
use crate::session::{Session, SessionContext, SessionError, SessionOutput, SessionState, SessionVerdict};
use crate::session_id::SessionId;

/// Chat-level notice that a user entered the room, emitted by the transport itself.
pub const ROOM_JOIN_PREFIX: &str = ":o?JOIN:o?";

/// Chat-level notice that a user left the room, emitted by the transport itself.
pub const ROOM_LEAVE_PREFIX: &str = ":o?LEAVE:o?";

/// The local user's view of every room they are in.
///
/// Owns the long-term key pair and routes every inbound room string to the session it belongs
/// to: exact session-id matches go straight to that session, join requests go to the active
/// session's successor constructor, and everything else is dropped. All processing is
/// synchronous and single-threaded; see [`AppOps`] for the serialization contract.
pub struct UserState<O: AppOps> {
    name: String,
    identity: LongTermIdentity,
    ops: O,
    rng: Rng,
    rooms: HashMap<String, SessionTree>,
}

impl<O: AppOps> UserState<O> {
    /// Creates the engine state for one user.
    ///
    /// Generates a fresh long-term key pair unless the host restores one from a 32-byte seed.
    pub fn new(
        name: &str,
        ops: O,
        key_seed: Option<[u8; PRIVATE_KEY_SIZE]>,
    ) -> Result<Self, UserStateError> {
        Self::with_rng(name, ops, key_seed, Rng::default())
    }

    pub(crate) fn with_rng(
        name: &str,
        ops: O,
        key_seed: Option<[u8; PRIVATE_KEY_SIZE]>,
        rng: Rng,
    ) -> Result<Self, UserStateError> {
        let identity = match key_seed {
            Some(seed) => LongTermIdentity::from_seed(seed),
            None => LongTermIdentity::generate(&rng)?,
        };
        Ok(Self {
            name: name.to_owned(),
            identity,
            ops,
            rng,
            rooms: HashMap::new(),
        })
    }

    /// Constructs a seeded engine state for deterministic tests.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn new_seeded(name: &str, ops: O, seed: [u8; 32]) -> Result<Self, UserStateError> {
        Self::with_rng(name, ops, None, Rng::from_seed(seed))
    }

    pub fn nickname(&self) -> &str {
        &self.name
    }

    /// The local identity fingerprint other members use to verify us.
    pub fn identity_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    /// Nicknames of the active session in a room, if one is established.
    pub fn room_members(&self, room: &str) -> Option<Vec<String>> {
        self.rooms
            .get(room)
            .and_then(|tree| tree.active())
            .map(|session| session.members().to_vec())
    }

    /// Id of the currently active session in a room.
    pub fn active_session_id(&self, room: &str) -> Option<SessionId> {
        self.rooms.get(room).and_then(|tree| tree.active_id())
    }

    /// Host-facing roster of the active session, the view a prospective joiner needs.
    pub fn room_roster(&self, room: &str) -> Option<Vec<UnauthenticatedParticipant>> {
        self.rooms
            .get(room)
            .and_then(|tree| tree.active())
            .map(|session| session.unauthenticated_roster())
    }

    /// Starts the protocol in a room.
    ///
    /// The host passes the roster it can observe at the chat level, including the local user.
    /// With peers present this broadcasts a JOIN_REQUEST and waits for their session views; alone
    /// in the room the session is established immediately.
    pub fn join_room(
        &mut self,
        room: &str,
        roster: &[UnauthenticatedParticipant],
    ) -> Result<(), UserStateError> {
        if self
            .rooms
            .get(room)
            .is_some_and(|tree| tree.active_id().is_some())
        {
            return Err(UserStateError::AlreadyJoined(room.to_owned()));
        }

        let session = {
            let Self {
                identity,
                ops,
                rng,
                name,
                ..
            } = self;
            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            let my_id = ParticipantId::new(name, identity.public_key());
            Session::joiner(room, my_id, roster, &mut ctx)?
        };
        let established = session.state() == SessionState::InSession;

        let tree = self.rooms.entry(room.to_owned()).or_insert_with(SessionTree::new);
        let session_id = tree.insert(session);
        if established {
            self.promote(room, session_id, RoomAction::None);
        }
        Ok(())
    }

    /// Leaves a room gracefully: says farewell on the active session.
    pub fn leave_room(&mut self, room: &str) -> Result<(), UserStateError> {
        let Self {
            identity,
            ops,
            rng,
            rooms,
            ..
        } = self;
        let tree = rooms
            .get_mut(room)
            .ok_or_else(|| UserStateError::UnknownRoom(room.to_owned()))?;
        let session = tree
            .active_mut()
            .ok_or_else(|| UserStateError::NoActiveSession(room.to_owned()))?;
        let mut ctx = SessionContext {
            identity,
            ops,
            rng,
        };
        session.leave(&mut ctx)?;
        Ok(())
    }

    /// Encrypts and broadcasts a chat message on the room's active session.
    pub fn send(&mut self, room: &str, plaintext: &str) -> Result<(), UserStateError> {
        let Self {
            identity,
            ops,
            rng,
            rooms,
            ..
        } = self;
        let tree = rooms
            .get_mut(room)
            .ok_or_else(|| UserStateError::UnknownRoom(room.to_owned()))?;
        let session = tree
            .active_mut()
            .ok_or_else(|| UserStateError::NoActiveSession(room.to_owned()))?;
        let mut ctx = SessionContext {
            identity,
            ops,
            rng,
        };
        session.send_user(plaintext, &mut ctx)?;
        Ok(())
    }

    /// The main inbound handler: routes one raw room string.
    ///
    /// `message_id` is the transport's sequence number for this broadcast; all honest members
    /// must observe the same numbering. Errors never propagate to the transport, they surface as
    /// [`RoomAction`] diagnostics or log lines.
    pub fn receive(&mut self, room: &str, raw: &str, message_id: u32) -> RoomAction {
        if let Some(nickname) = raw.strip_prefix(ROOM_JOIN_PREFIX) {
            if nickname == self.name {
                return RoomAction::None;
            }
            // Presence only; the cryptographic join starts with their JOIN_REQUEST.
            return RoomAction::Joined(nickname.to_owned());
        }

        if let Some(nickname) = raw.strip_prefix(ROOM_LEAVE_PREFIX) {
            let nickname = nickname.to_owned();
            if nickname == self.name {
                // The transport dropped us; all session state for the room is void.
                let Self {
                    identity,
                    ops,
                    rng,
                    rooms,
                    ..
                } = self;
                if let Some(mut tree) = rooms.remove(room) {
                    let mut ctx = SessionContext {
                        identity,
                        ops,
                        rng,
                    };
                    tree.kill_all(&mut ctx);
                }
                return RoomAction::Left(nickname);
            }
            return self.peer_left(room, &nickname);
        }

        let msg = match message::decode(raw) {
            Ok(msg) => msg,
            Err(err) => {
                trace!(%err, room, "ignoring room string that is not a protocol message");
                return RoomAction::None;
            }
        };

        match msg.session_id {
            Some(session_id) => self.dispatch(room, session_id, &msg, message_id),
            None => self.accept_join_request(room, &msg),
        }
    }

    /// Delivers a session-addressed message, falling back to a waiting joiner or the active
    /// session when the id is unknown to us.
    fn dispatch(
        &mut self,
        room: &str,
        session_id: SessionId,
        msg: &ParsedMessage,
        message_id: u32,
    ) -> RoomAction {
        let output = {
            let Self {
                identity,
                ops,
                rng,
                rooms,
                ..
            } = self;
            let Some(tree) = rooms.get_mut(room) else {
                trace!(room, "ignoring protocol message for an unknown room");
                return RoomAction::None;
            };

            let target = if tree.contains(&session_id) {
                Some(session_id)
            } else {
                // An id we never derived: either a stale view of ours (a waiting joiner wants to
                // hear about it) or noise for the active session to discard.
                tree.staging_joiner_id().or_else(|| tree.active_id())
            };
            let Some(target) = target else {
                trace!(room, session_id = %session_id, "no session to route message to");
                return RoomAction::None;
            };

            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            let session = tree
                .get_mut(&target)
                .expect("target id was taken from the tree");
            let output = session.receive(msg, message_id, &mut ctx);
            (target, output)
        };

        let (target, output) = output;
        self.apply_verdict(room, target, output, msg, message_id)
    }

    /// Handles a sessionless JOIN_REQUEST by constructing the active session's successor.
    fn accept_join_request(&mut self, room: &str, msg: &ParsedMessage) -> RoomAction {
        if msg.sender == self.name {
            return RoomAction::None;
        }
        let Body::JoinRequest { joiner } = &msg.body else {
            return RoomAction::None;
        };
        let Ok(unauthenticated) = joiner.to_unauthenticated() else {
            debug!(sender = %msg.sender, "discarding join request with malformed keys");
            return RoomAction::None;
        };
        if unauthenticated.id.nickname != msg.sender {
            debug!(sender = %msg.sender, "discarding join request with mismatched sender");
            return RoomAction::None;
        }
        // Join requests are self-signed by the joiner's fresh ephemeral key.
        if !msg.verify(&unauthenticated.ephemeral_key) {
            debug!(sender = %msg.sender, "discarding join request with invalid signature");
            return RoomAction::None;
        }

        let Self {
            identity,
            ops,
            rng,
            rooms,
            ..
        } = self;
        let Some(tree) = rooms.get_mut(room) else {
            trace!(room, "ignoring join request for an unknown room");
            return RoomAction::None;
        };

        let child = {
            let Some(parent) = tree.active() else {
                trace!(room, "ignoring join request without an active session");
                return RoomAction::None;
            };
            match Session::child_id_on_join(parent, &unauthenticated) {
                Ok(child_id) if tree.contains(&child_id) => {
                    trace!(session_id = %child_id, "join request already answered");
                    return RoomAction::None;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "discarding join request");
                    return RoomAction::None;
                }
            }

            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            match Session::incumbent_on_join(tree.active().expect("checked above"), joiner, &mut ctx)
            {
                Ok(child) => child,
                Err(err) => {
                    debug!(%err, sender = %msg.sender, "failed to construct session for joiner");
                    return RoomAction::None;
                }
            }
        };
        tree.insert(child);
        RoomAction::None
    }

    /// Acts on the structural outcome of a session event.
    fn apply_verdict(
        &mut self,
        room: &str,
        session_id: SessionId,
        output: SessionOutput,
        msg: &ParsedMessage,
        message_id: u32,
    ) -> RoomAction {
        match output.verdict {
            SessionVerdict::Stay => output.action,
            SessionVerdict::Promote => self.promote(room, session_id, output.action),
            SessionVerdict::Die => {
                let Self {
                    identity,
                    ops,
                    rng,
                    rooms,
                    ..
                } = self;
                if let Some(session) = rooms
                    .get_mut(room)
                    .and_then(|tree| tree.get_mut(&session_id))
                {
                    let mut ctx = SessionContext {
                        identity,
                        ops,
                        rng,
                    };
                    session.kill(&mut ctx);
                }
                output.action
            }
            SessionVerdict::RespawnJoiner(roster) => {
                let sibling_id = {
                    let Self {
                        identity,
                        ops,
                        rng,
                        rooms,
                        name,
                    } = self;
                    let Some(tree) = rooms.get_mut(room) else {
                        return output.action;
                    };
                    let mut ctx = SessionContext {
                        identity,
                        ops,
                        rng,
                    };
                    let Some(stale) = tree.get_mut(&session_id) else {
                        return output.action;
                    };
                    let ephemeral = stale.clone_ephemeral();
                    stale.kill(&mut ctx);

                    let my_id = ParticipantId::new(name, identity.public_key());
                    match Session::joiner_from_view(room, my_id, &roster, ephemeral) {
                        Ok(sibling) => tree.insert(sibling),
                        Err(err) => {
                            warn!(%err, room, "failed to respawn joiner for the observed view");
                            return output.action;
                        }
                    }
                };

                // The message that exposed the stale view belongs to the fresh sibling. A roster
                // that does not hash to the advertised id would respawn forever; drop it instead.
                if msg.session_id == Some(sibling_id) {
                    self.dispatch(room, sibling_id, msg, message_id)
                } else {
                    debug!(room, "observed roster does not produce the advertised session id");
                    output.action
                }
            }
            SessionVerdict::ShrinkOnLeave(leaver) => self.shrink(room, session_id, &leaver),
        }
    }

    /// Promotes a confirmed session and emits the membership notifications.
    fn promote(&mut self, room: &str, session_id: SessionId, action: RoomAction) -> RoomAction {
        let (joined, left) = {
            let Self {
                identity,
                ops,
                rng,
                rooms,
                ..
            } = self;
            let Some(tree) = rooms.get_mut(room) else {
                return action;
            };
            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            let (joined, left) = tree.activate(&session_id, &mut ctx);
            for nickname in &joined {
                ctx.ops.joined(room, nickname);
            }
            for nickname in &left {
                ctx.ops.left(room, nickname);
            }
            (joined, left)
        };

        if action != RoomAction::None {
            return action;
        }
        if joined.iter().any(|nickname| *nickname == self.name) {
            return RoomAction::Joined(self.name.clone());
        }
        if let Some(nickname) = joined.first() {
            return RoomAction::Joined(nickname.clone());
        }
        if let Some(nickname) = left.first() {
            return RoomAction::Left(nickname.clone());
        }
        action
    }

    /// A member is gone (farewell or transport notice): construct the shrunk successor.
    fn shrink(&mut self, room: &str, parent_id: SessionId, leaver: &str) -> RoomAction {
        let promoted = {
            let Self {
                identity,
                ops,
                rng,
                rooms,
                ..
            } = self;
            let Some(tree) = rooms.get_mut(room) else {
                return RoomAction::None;
            };

            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            let child = {
                let Some(parent) = tree.get(&parent_id) else {
                    return RoomAction::None;
                };
                match Session::child_id_on_leave(parent, leaver) {
                    Ok(child_id) if tree.contains(&child_id) => {
                        return RoomAction::Left(leaver.to_owned());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, room, leaver, "can not rekey after leave");
                        return RoomAction::Left(leaver.to_owned());
                    }
                }
                match Session::incumbent_on_leave(parent, leaver, &mut ctx) {
                    Ok(child) => child,
                    Err(err) => {
                        warn!(%err, room, leaver, "failed to construct session after leave");
                        return RoomAction::Left(leaver.to_owned());
                    }
                }
            };
            let established = child.state() == SessionState::InSession;
            let child_id = tree.insert(child);
            established.then_some(child_id)
        };

        // A survivor alone in the room established its successor on the spot.
        if let Some(child_id) = promoted {
            self.promote(room, child_id, RoomAction::Left(leaver.to_owned()))
        } else {
            RoomAction::Left(leaver.to_owned())
        }
    }

    /// Transport-level LEAVE notice for a peer: shrink even without their farewell.
    fn peer_left(&mut self, room: &str, leaver: &str) -> RoomAction {
        let shrink = {
            let Self {
                identity,
                ops,
                rng,
                rooms,
                ..
            } = self;
            let Some(tree) = rooms.get_mut(room) else {
                return RoomAction::Left(leaver.to_owned());
            };
            let Some(active_id) = tree.active_id() else {
                return RoomAction::Left(leaver.to_owned());
            };
            let mut ctx = SessionContext {
                identity,
                ops,
                rng,
            };
            let session = tree
                .get_mut(&active_id)
                .expect("active id was taken from the tree");
            session
                .handle_peer_leave(leaver, &mut ctx)
                .then_some(active_id)
        };

        match shrink {
            Some(active_id) => self.shrink(room, active_id, leaver),
            None => RoomAction::Left(leaver.to_owned()),
        }
    }

    /// Feeds an expired timer back into the session that armed it.
    ///
    /// Timer callbacks run under the same serialization discipline as inbound messages.
    pub fn timer_fired(&mut self, event: &TimerEvent) -> RoomAction {
        let Self {
            identity,
            ops,
            rng,
            rooms,
            ..
        } = self;
        let Some(session) = rooms
            .get_mut(&event.room)
            .and_then(|tree| tree.get_mut(&event.session_id))
        else {
            return RoomAction::None;
        };
        let mut ctx = SessionContext {
            identity,
            ops,
            rng,
        };
        session.timer_fired(event.kind, event.peer.as_deref(), &mut ctx)
    }
}

#[derive(Debug, Error)]
pub enum UserStateError {
    #[error("already joined room \"{0}\"")]
    AlreadyJoined(String),

    #[error("no state for room \"{0}\"")]
    UnknownRoom(String),

    #[error("no established session in room \"{0}\"")]
    NoActiveSession(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Rng(#[from] RngError),
}
