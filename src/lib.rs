// SPDX-License-Identifier: MIT OR Apache-2.0

//! `chorus` is the protocol core of a multiparty off-the-record (mpOTR) group chat: mutual
//! authentication of every room member, forward-secret group key agreement, authenticated and
//! confidential broadcast messages, transcript consistency across all honest members and dynamic
//! membership which rekeys the group on every join and leave.
//!
//! The engine sits between an untrusted multi-user chat room which broadcasts opaque strings and
//! the hosting application. It is transport-agnostic: the host relays room strings into
//! [`UserState::receive`], implements the [`AppOps`] callbacks for outbound strings, membership
//! notifications, message display and timers, and otherwise stays out of the way.
//!
//! ## Sessions
//!
//! All state lives in sessions, one per group-key epoch. A session is pinned to an exact member
//! set; any join or leave constructs a successor session which runs its own authentication and
//! key-share round and atomically replaces its parent once every member confirmed the new key.
//! Pairwise trust comes from a triple Diffie-Hellman between long-term and per-session ephemeral
//! keys; the group key is derived from a cycle of pairwise link keys so that published shares
//! reveal nothing to outsiders and the key dies with the ephemeral material (forward secrecy).
//!
//! ## Ordering assumption
//!
//! The protocol assumes the chat room delivers broadcasts to all honest members in the same total
//! order and echoes every broadcast back to its sender. Message order is bound into a transcript
//! hash chain carried inside every chat message; when the room violates the assumption the chains
//! diverge, delivery stops and the inconsistency is reported. No attempt is made to reconstruct
//! an order from vector clocks.
//!
//! ## Concurrency
//!
//! The engine is single-threaded and cooperative. Every call runs to completion, outbound
//! messages are handed to the host synchronously and timer callbacks re-enter through
//! [`UserState::timer_fired`] under the same serialization discipline. Hosts invoking the engine
//! from several threads must serialize those invocations themselves.
//!
//! ## Security
//!
//! Deniability is limited to what the primitives yield; no claim is made beyond that. Pairwise
//! two-party OTR, store-and-forward delivery and offline key lookup are out of scope.
pub mod cbor;
pub mod crypto;
pub mod message;
pub mod ops;
pub mod participant;
mod room;
pub mod session;
pub mod session_id;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;
pub mod transcript;
pub mod user_state;

pub use crypto::identity::{LongTermIdentity, PrivateKey, PublicKey, Signature};
pub use crypto::{Rng, RngError};
pub use ops::{AppOps, RoomAction, TimerEvent, TimerHandle, TimerKind};
pub use participant::{Participant, ParticipantId, UnauthenticatedParticipant};
pub use session::{Session, SessionError, SessionState};
pub use session_id::SessionId;
pub use transcript::TranscriptChain;
pub use user_state::{UserState, UserStateError, ROOM_JOIN_PREFIX, ROOM_LEAVE_PREFIX};
