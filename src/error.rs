//! Error types for the IM session client.

use thiserror::Error;

use crate::state::ConnectionState;

/// Errors that can occur inside the IM session client.
///
/// None of these cross the [`ImClient`](crate::client::ImClient) boundary as a
/// failure of a public call: the session loop logs them and turns them into
/// [`Notice`](crate::event::Notice) events. They are returned directly by the
/// lower-level building blocks (transports, the token API, the state machine).
#[derive(Debug, Error)]
pub enum ImError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// No live transport, or the live transport is not open.
    #[error("not connected to server")]
    NotConnected,

    /// Failed to serialize or deserialize a wire payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An endpoint or API base URL could not be parsed.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The HTTP request to the token API failed before a response was decoded.
    #[cfg(feature = "http-api")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success envelope.
    #[error("api error {code}: {message}")]
    Api {
        /// Envelope `code` field.
        code: i64,
        /// Envelope `message` field (may be empty).
        message: String,
    },

    /// The backend answered successfully but left out the `data` field.
    #[error("api response missing data")]
    MissingData,

    /// The long-lived user credential needed for token regeneration is absent.
    #[error("missing user credential")]
    MissingCredential,

    /// A state change outside the legal transition table was requested.
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// State the machine was in.
        from: ConnectionState,
        /// State that was requested.
        to: ConnectionState,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImError {
    /// Returns `true` if the backend itself rejected the request, as opposed
    /// to the request never reaching it.
    ///
    /// Token renewal uses this to decide between regenerating the token
    /// (rejected) and waiting for the next check (network trouble).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::MissingData)
    }
}

/// A specialized [`Result`] type for IM session operations.
pub type Result<T> = std::result::Result<T, ImError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_are_rejections() {
        let err = ImError::Api {
            code: 401,
            message: "token expired".into(),
        };
        assert!(err.is_rejection());
        assert!(ImError::MissingData.is_rejection());
        assert!(!ImError::Timeout.is_rejection());
        assert!(!ImError::TransportClosed.is_rejection());
    }

    #[test]
    fn illegal_transition_message_names_both_states() {
        let err = ImError::IllegalTransition {
            from: ConnectionState::Closed,
            to: ConnectionState::Connecting,
        };
        assert_eq!(err.to_string(), "illegal transition Closed -> Connecting");
    }
}
