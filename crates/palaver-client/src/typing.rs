//! Typing-indicator state for one conversation view.
//!
//! [`TypingBroadcaster`] throttles the local user's outgoing signals and
//! owns the idle deadline that triggers the explicit stop broadcast.
//! [`TypingRoster`] holds the remote typists currently visible, each with an
//! expiry deadline refreshed by every active signal.

use tokio::time::Instant;

use palaver_shared::constants::{TYPING_BROADCAST_INTERVAL, TYPING_IDLE_TIMEOUT, TYPING_SIGNAL_TTL};
use palaver_shared::types::UserId;

/// Throttle state for the local user's outgoing typing signals.
#[derive(Debug, Default)]
pub struct TypingBroadcaster {
    last_broadcast: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl TypingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keystroke.  Returns `true` when an active broadcast is
    /// due, at most once per `TYPING_BROADCAST_INTERVAL`.  The idle
    /// deadline restarts on every call.
    pub fn on_input(&mut self, now: Instant) -> bool {
        self.idle_deadline = Some(now + TYPING_IDLE_TIMEOUT);
        let due = match self.last_broadcast {
            Some(previous) => now.duration_since(previous) >= TYPING_BROADCAST_INTERVAL,
            None => true,
        };
        if due {
            self.last_broadcast = Some(now);
        }
        due
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// Returns `true` when the idle window has elapsed and the explicit
    /// stop broadcast is due.  Clears local typing state either way once
    /// the deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.idle_deadline {
            Some(deadline) if now >= deadline => {
                self.idle_deadline = None;
                self.last_broadcast = None;
                true
            }
            _ => false,
        }
    }
}

/// Remote users currently typing, most recent first signal last.
#[derive(Debug, Default)]
pub struct TypingRoster {
    active: Vec<(UserId, Instant)>,
}

impl TypingRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a typist with a fresh expiry deadline.
    pub fn apply_active(&mut self, user: UserId, now: Instant) {
        let deadline = now + TYPING_SIGNAL_TTL;
        match self.active.iter_mut().find(|(u, _)| *u == user) {
            Some(slot) => slot.1 = deadline,
            None => self.active.push((user, deadline)),
        }
    }

    /// Remove a typist immediately.  Returns whether one was present.
    pub fn apply_stopped(&mut self, user: UserId) -> bool {
        let before = self.active.len();
        self.active.retain(|(u, _)| *u != user);
        before != self.active.len()
    }

    /// Drop entries whose deadline has passed.  Returns whether any did.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.active.len();
        self.active.retain(|(_, deadline)| *deadline > now);
        before != self.active.len()
    }

    /// Earliest pending expiry, for the scope's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.iter().map(|(_, deadline)| *deadline).min()
    }

    pub fn users(&self) -> Vec<UserId> {
        self.active.iter().map(|(user, _)| *user).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
