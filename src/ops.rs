// SPDX-License-Identifier: MIT OR Apache-2.0

//! Calls from the engine to the hosting application.
use crate::session_id::SessionId;

/// Callbacks the host supplies when constructing a [`crate::UserState`].
///
/// The engine is single-threaded and cooperative: every callback is invoked synchronously while
/// an engine call is running, and the implementation must not re-enter the engine with an inbound
/// message for the same room before returning.
///
/// The engine assumes the underlying chat room broadcasts messages in a total order visible
/// identically to all honest members and that every broadcast is echoed back to its sender. When
/// the room violates this, transcript hashes diverge and delivery stops, which is the intended
/// failure mode.
pub trait AppOps {
    /// Transmits an opaque string to the room on behalf of the engine.
    fn send_bare(&mut self, room: &str, sender: &str, payload: &str);

    /// Informs the app that a member (including the local user) entered the conversation.
    fn joined(&mut self, room: &str, nickname: &str);

    /// Informs the app that a member (including the local user) left the conversation.
    fn left(&mut self, room: &str, nickname: &str);

    /// Asks the app to display a decrypted message or a diagnostic in the room.
    fn display_message(&mut self, room: &str, message: &str);

    /// Schedules `event` to be fed back through [`crate::UserState::timer_fired`] after
    /// `interval_ms` milliseconds. Returns a handle the engine may cancel.
    fn set_timer(&mut self, event: TimerEvent, interval_ms: u64) -> TimerHandle;

    /// Cancels a previously scheduled timer.
    fn axe_timer(&mut self, handle: TimerHandle);
}

/// Host-opaque timer identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// The three liveness timers a session arms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic while a session is active; keeps silent peers observable.
    Heartbeat,

    /// Armed per peer when we broadcast a user message; fires when the peer never acknowledged.
    AckAwait,

    /// Armed when we delivered a peer's message; fires when we owe them an acknowledgement.
    AckSend,
}

/// Description of a pending timer, handed back verbatim by the host when it expires.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerEvent {
    pub room: String,
    pub session_id: SessionId,
    pub kind: TimerKind,
    /// The peer this timer observes; only set for [`TimerKind::AckAwait`].
    pub peer: Option<String>,
}

/// What the host should do with an inbound room string after the engine processed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomAction {
    /// Nothing user-visible happened.
    None,

    /// A member joined the conversation.
    Joined(String),

    /// A member left the conversation.
    Left(String),

    /// A message or diagnostic should be shown to the user.
    Display(String),
}
