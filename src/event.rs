//! Events emitted by the session loop.
//!
//! [`ImClient::start`](crate::client::ImClient::start) returns the receiving
//! half of a bounded channel of [`ImEvent`]s. User-facing messages that a
//! browser client would show as toasts arrive as [`ImEvent::Notice`].

use std::time::Duration;

use crate::protocol::Frame;
use crate::state::ConnectionState;

/// Severity of a [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    /// Informational.
    Info,
    /// Something degraded but recovering on its own.
    Warning,
    /// Needs the user's attention.
    Error,
}

/// A message meant for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity.
    pub level: NoticeLevel,
    /// Human-readable text.
    pub text: String,
    /// `true` if the host should keep showing it until the user acts.
    pub persistent: bool,
}

impl Notice {
    /// Transient informational notice.
    pub fn info(text: impl Into<String>) -> Self {
        Self::transient(NoticeLevel::Info, text)
    }

    /// Transient warning.
    pub fn warning(text: impl Into<String>) -> Self {
        Self::transient(NoticeLevel::Warning, text)
    }

    /// Persistent error.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
            persistent: true,
        }
    }

    fn transient(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            persistent: false,
        }
    }
}

/// Everything the session reports to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImEvent {
    /// The session moved between connection states.
    StateChanged {
        /// State before.
        from: ConnectionState,
        /// State after.
        to: ConnectionState,
        /// Why.
        reason: String,
    },
    /// The WebSocket opened.
    Connected,
    /// A data frame arrived.
    Message(Frame),
    /// The WebSocket closed.
    Disconnected {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason or error text.
        reason: String,
    },
    /// A reconnect attempt is armed.
    ReconnectScheduled {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay until the attempt.
        delay: Duration,
    },
    /// A new token was adopted and persisted.
    TokenRotated,
    /// Another login for the same user ended this session. No further
    /// automatic reconnects happen.
    Kicked,
    /// A message for the user.
    Notice(Notice),
}

impl From<Notice> for ImEvent {
    fn from(notice: Notice) -> Self {
        Self::Notice(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_errors_are_persistent() {
        assert!(!Notice::info("a").persistent);
        assert!(!Notice::warning("b").persistent);
        let error = Notice::error("c");
        assert!(error.persistent);
        assert_eq!(error.level, NoticeLevel::Error);
    }

    #[test]
    fn notice_converts_into_event() {
        let event: ImEvent = Notice::warning("offline").into();
        assert!(matches!(
            event,
            ImEvent::Notice(Notice {
                level: NoticeLevel::Warning,
                ..
            })
        ));
    }
}
