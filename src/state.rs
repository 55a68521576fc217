//! Connection state machine.
//!
//! [`StateMachine`] is pure bookkeeping owned by the session loop: the
//! current and previous [`ConnectionState`], when the last transition
//! happened, how many reconnect attempts have been made since the last
//! stable connection, and a bounded log of recent transitions.
//!
//! Transitions are checked against a fixed edge table. [`ConnectionState::Closed`]
//! has no outgoing edges; only [`StateMachine::reset`] leaves it.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ImError, Result};

/// Number of transitions kept in the history ring.
pub const HISTORY_CAPACITY: usize = 64;

/// Lifecycle state of the IM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// A transport is being established.
    Connecting,
    /// The transport is open.
    Connected,
    /// A reconnect attempt has been scheduled.
    Reconnecting,
    /// No transport and nothing scheduled.
    #[default]
    Disconnected,
    /// Terminal: the session was kicked by a duplicate login.
    Closed,
}

impl ConnectionState {
    /// Returns `true` if `self -> to` is an edge of the transition table.
    pub const fn can_transition_to(self, to: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting | Reconnecting | Closed)
                | (Connecting, Connecting | Connected | Disconnected | Closed)
                | (Connected, Connecting | Disconnected | Closed)
                | (Reconnecting, Connecting | Disconnected | Closed)
        )
    }

    /// Returns `true` for the terminal state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Reconnecting => 2,
            Self::Disconnected => 3,
            Self::Closed => 4,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Reconnecting,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the transition.
    pub from: ConnectionState,
    /// State after the transition.
    pub to: ConnectionState,
    /// Free-form reason supplied by the caller.
    pub reason: String,
    /// When the transition was applied.
    pub at: Instant,
}

/// Tracks the session's [`ConnectionState`] and reconnect bookkeeping.
#[derive(Debug)]
pub struct StateMachine {
    current: ConnectionState,
    previous: Option<ConnectionState>,
    last_transition_at: Instant,
    connected_since: Option<Instant>,
    reconnect_attempts: u32,
    history: VecDeque<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine in [`ConnectionState::Disconnected`] with a zero counter.
    pub fn new() -> Self {
        Self {
            current: ConnectionState::Disconnected,
            previous: None,
            last_transition_at: Instant::now(),
            connected_since: None,
            reconnect_attempts: 0,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Move to `to`, recording `reason`.
    ///
    /// Entering [`Connected`](ConnectionState::Connected) starts the
    /// connection-duration clock; entering
    /// [`Reconnecting`](ConnectionState::Reconnecting) counts one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::IllegalTransition`] and leaves the machine untouched
    /// if the edge is not in the transition table.
    pub fn transition(&mut self, to: ConnectionState, reason: impl Into<String>) -> Result<()> {
        let from = self.current;
        let reason = reason.into();
        if !from.can_transition_to(to) {
            warn!(%from, %to, %reason, "rejected illegal state transition");
            return Err(ImError::IllegalTransition { from, to });
        }

        let now = Instant::now();
        debug!(%from, %to, %reason, "state transition");

        self.previous = Some(from);
        self.current = to;
        self.last_transition_at = now;

        match to {
            ConnectionState::Connected => self.connected_since = Some(now),
            ConnectionState::Reconnecting => {
                self.connected_since = None;
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
            }
            _ => self.connected_since = None,
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            reason,
            at: now,
        });
        Ok(())
    }

    /// Returns `true` if the machine is currently in `state`.
    pub fn is(&self, state: ConnectionState) -> bool {
        self.current == state
    }

    /// The current state.
    pub fn current(&self) -> ConnectionState {
        self.current
    }

    /// The state before the last applied transition, if any.
    pub fn previous(&self) -> Option<ConnectionState> {
        self.previous
    }

    /// When the last transition was applied (or the machine was created/reset).
    pub fn last_transition_at(&self) -> Instant {
        self.last_transition_at
    }

    /// Reconnect attempts since the last stable connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Zero the attempt counter. Called once a connection has proven stable.
    pub fn reset_reconnect_attempts(&mut self) {
        if self.reconnect_attempts > 0 {
            debug!(attempts = self.reconnect_attempts, "reconnect attempts reset");
        }
        self.reconnect_attempts = 0;
    }

    /// Lower the attempt counter by `by`, floored at zero.
    pub fn taper_reconnect_attempts(&mut self, by: u32) {
        self.reconnect_attempts = self.reconnect_attempts.saturating_sub(by);
    }

    /// Time spent in the current [`Connected`](ConnectionState::Connected)
    /// stint, or zero when not connected.
    pub fn connection_duration(&self) -> Duration {
        self.connected_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    /// Recent transitions, oldest first. Holds at most [`HISTORY_CAPACITY`].
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Return to a fresh [`Disconnected`](ConnectionState::Disconnected)
    /// machine, clearing the terminal state, counters and history.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn starts_disconnected() {
        let sm = StateMachine::new();
        assert!(sm.is(Disconnected));
        assert_eq!(sm.previous(), None);
        assert_eq!(sm.reconnect_attempts(), 0);
        assert_eq!(sm.history().count(), 0);
    }

    #[test]
    fn transition_records_previous_and_log() {
        let mut sm = StateMachine::new();
        sm.transition(Connecting, "init").unwrap();
        sm.transition(Connected, "open").unwrap();

        assert!(sm.is(Connected));
        assert_eq!(sm.previous(), Some(Connecting));

        let log: Vec<_> = sm.history().collect();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from, Disconnected);
        assert_eq!(log[0].to, Connecting);
        assert_eq!(log[1].reason, "open");
    }

    #[test]
    fn closed_is_terminal() {
        let mut sm = StateMachine::new();
        sm.transition(Closed, "kicked").unwrap();

        for to in [Connecting, Connected, Reconnecting, Disconnected, Closed] {
            let err = sm.transition(to, "retry").unwrap_err();
            assert!(matches!(err, ImError::IllegalTransition { from: Closed, .. }));
        }
        assert!(sm.is(Closed));
        assert_eq!(sm.history().count(), 1);
    }

    #[test]
    fn illegal_edge_leaves_machine_unchanged() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(Connected, "skip connecting").is_err());
        assert!(sm.is(Disconnected));
        assert_eq!(sm.previous(), None);
    }

    #[test]
    fn reconnecting_counts_attempts() {
        let mut sm = StateMachine::new();
        for _ in 0..3 {
            sm.transition(Reconnecting, "close").unwrap();
            sm.transition(Connecting, "timer").unwrap();
            sm.transition(Disconnected, "failed").unwrap();
        }
        assert_eq!(sm.reconnect_attempts(), 3);

        sm.taper_reconnect_attempts(2);
        assert_eq!(sm.reconnect_attempts(), 1);
        sm.taper_reconnect_attempts(2);
        assert_eq!(sm.reconnect_attempts(), 0);

        sm.transition(Reconnecting, "close").unwrap();
        sm.reset_reconnect_attempts();
        assert_eq!(sm.reconnect_attempts(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut sm = StateMachine::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            sm.transition(Connecting, format!("attempt {i}")).unwrap();
        }
        assert_eq!(sm.history().count(), HISTORY_CAPACITY);
        assert_eq!(sm.history().next().unwrap().reason, "attempt 10");
    }

    #[tokio::test(start_paused = true)]
    async fn connection_duration_tracks_connected_stint() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.connection_duration(), Duration::ZERO);

        sm.transition(Connecting, "init").unwrap();
        sm.transition(Connected, "open").unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(sm.connection_duration(), Duration::from_secs(3));

        sm.transition(Disconnected, "close").unwrap();
        assert_eq!(sm.connection_duration(), Duration::ZERO);
    }

    #[test]
    fn reset_leaves_terminal_state() {
        let mut sm = StateMachine::new();
        sm.transition(Reconnecting, "close").unwrap();
        sm.transition(Closed, "kicked").unwrap();
        sm.reset();
        assert!(sm.is(Disconnected));
        assert_eq!(sm.reconnect_attempts(), 0);
        sm.transition(Connecting, "fresh start").unwrap();
    }

    #[test]
    fn u8_encoding_is_stable() {
        for state in [Connecting, Connected, Reconnecting, Disconnected, Closed] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }
}
