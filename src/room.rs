// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-room session tree: one active session plus staging successors.
//!
//! All sessions of a room are owned here, keyed by their session id. At most one session is
//! `active` and carries user messages; any number of staging children run pending key-agreement
//! rounds. Promotion is a single swap: the confirmed child replaces the active session and every
//! sibling still in staging is killed, since only one successor per epoch can win.
use std::collections::HashMap;

use tracing::debug;

use crate::ops::AppOps;
use crate::session::{Session, SessionContext, SessionState};
use crate::session_id::SessionId;

pub(crate) struct SessionTree {
    active: Option<SessionId>,
    sessions: HashMap<SessionId, Session>,
}

impl SessionTree {
    pub(crate) fn new() -> Self {
        Self {
            active: None,
            sessions: HashMap::new(),
        }
    }

    pub(crate) fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub(crate) fn active(&self) -> Option<&Session> {
        self.active.and_then(|id| self.sessions.get(&id))
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut Session> {
        match self.active {
            Some(id) => self.sessions.get_mut(&id),
            None => None,
        }
    }

    pub(crate) fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Inserts a session into staging and returns its id.
    pub(crate) fn insert(&mut self, session: Session) -> SessionId {
        let id = *session.session_id();
        self.sessions.insert(id, session);
        id
    }

    /// A joiner still waiting for the room view, if any.
    ///
    /// Messages carrying an unknown session id are offered to it so a stale view can be detected
    /// and replaced.
    pub(crate) fn staging_joiner_id(&self) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.state() == SessionState::JoinRequested)
            .map(|session| *session.session_id())
    }

    /// Promotes a confirmed session to active.
    ///
    /// Atomically replaces the active pointer, kills every staging sibling and drops the previous
    /// active session after flushing its pending farewell. Returns the membership diff against
    /// the previous active session for the host's join/leave notifications.
    pub(crate) fn activate<O: AppOps>(
        &mut self,
        id: &SessionId,
        ctx: &mut SessionContext<O>,
    ) -> (Vec<String>, Vec<String>) {
        let new_members: Vec<String> = match self.sessions.get(id) {
            Some(session) => session.members().to_vec(),
            None => return (Vec::new(), Vec::new()),
        };
        let old_members: Vec<String> = self
            .active
            .and_then(|active_id| self.sessions.get(&active_id))
            .map(|session| session.members().to_vec())
            .unwrap_or_default();

        let joined: Vec<String> = new_members
            .iter()
            .filter(|nickname| !old_members.contains(nickname))
            .cloned()
            .collect();
        let left: Vec<String> = old_members
            .iter()
            .filter(|nickname| !new_members.contains(nickname))
            .cloned()
            .collect();

        let other_ids: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|session_id| *session_id != id)
            .copied()
            .collect();
        for other_id in other_ids {
            let session = self
                .sessions
                .get_mut(&other_id)
                .expect("id was collected from the map");
            if Some(other_id) == self.active {
                session.flush_farewell(ctx);
            }
            session.kill(ctx);
        }
        self.sessions.retain(|session_id, _| session_id == id);

        self.active = Some(*id);
        let session = self
            .sessions
            .get_mut(id)
            .expect("the promoted session was retained");
        session.arm_heartbeat(ctx);
        debug!(room = session.room(), session_id = %id, "session activated");

        (joined, left)
    }

    /// Kills and drops every session, used when the local user is gone from the room.
    pub(crate) fn kill_all<O: AppOps>(&mut self, ctx: &mut SessionContext<O>) {
        for session in self.sessions.values_mut() {
            session.flush_farewell(ctx);
            session.kill(ctx);
        }
        self.sessions.clear();
        self.active = None;
    }
}
