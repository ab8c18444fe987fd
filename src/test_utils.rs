// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for writing tests against the engine.
use std::collections::HashMap;

use crate::ops::{AppOps, TimerEvent, TimerHandle, TimerKind};

/// [`AppOps`] implementation that records every callback for inspection.
///
/// Outbound strings pile up in `sent` until a test harness drains and delivers them; timers are
/// kept in a map and only "fire" when a test feeds their event back into the engine.
#[derive(Debug, Default)]
pub struct RecordingOps {
    /// Outbound broadcasts as `(room, sender, payload)`.
    pub sent: Vec<(String, String, String)>,
    /// Delivered plaintexts as `(room, message)`.
    pub displayed: Vec<(String, String)>,
    /// Join notifications as `(room, nickname)`.
    pub joined: Vec<(String, String)>,
    /// Leave notifications as `(room, nickname)`.
    pub left: Vec<(String, String)>,
    /// Armed timers which have not been cancelled.
    pub timers: HashMap<TimerHandle, (TimerEvent, u64)>,
    next_timer: u64,
}

impl RecordingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes all outbound broadcasts recorded so far.
    pub fn drain_sent(&mut self) -> Vec<(String, String, String)> {
        std::mem::take(&mut self.sent)
    }

    /// Finds an armed timer by kind and optional peer.
    pub fn timer(&self, kind: TimerKind, peer: Option<&str>) -> Option<TimerEvent> {
        self.timers
            .values()
            .find(|(event, _)| event.kind == kind && event.peer.as_deref() == peer)
            .map(|(event, _)| event.clone())
    }

    /// Number of armed timers of the given kind.
    pub fn timer_count(&self, kind: TimerKind) -> usize {
        self.timers
            .values()
            .filter(|(event, _)| event.kind == kind)
            .count()
    }
}

impl AppOps for RecordingOps {
    fn send_bare(&mut self, room: &str, sender: &str, payload: &str) {
        self.sent
            .push((room.to_owned(), sender.to_owned(), payload.to_owned()));
    }

    fn joined(&mut self, room: &str, nickname: &str) {
        self.joined.push((room.to_owned(), nickname.to_owned()));
    }

    fn left(&mut self, room: &str, nickname: &str) {
        self.left.push((room.to_owned(), nickname.to_owned()));
    }

    fn display_message(&mut self, room: &str, message: &str) {
        self.displayed.push((room.to_owned(), message.to_owned()));
    }

    fn set_timer(&mut self, event: TimerEvent, interval_ms: u64) -> TimerHandle {
        let handle = TimerHandle(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(handle, (event, interval_ms));
        handle
    }

    fn axe_timer(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle);
    }
}
