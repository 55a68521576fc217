//! Wire types shared with the IM backend.
//!
//! - [`Frame`]: one WebSocket message as seen by the session, including close
//!   frames with their code.
//! - [`ApiResponse`]: the `{code, data, message}` envelope every HTTP endpoint
//!   answers with.
//! - [`HeartbeatMessage`]: the application-level WebSocket heartbeat.

use serde::{Deserialize, Serialize};

use crate::error::{ImError, Result};

/// `code` value of a successful [`ApiResponse`].
pub const API_SUCCESS_CODE: i64 = 200;

/// `messageType` of the application heartbeat.
pub const HEARTBEAT_MESSAGE_TYPE: u8 = 0;

/// `content` of the application heartbeat.
pub const HEARTBEAT_CONTENT: &str = "heartbeat";

// ── Frames ──────────────────────────────────────────────────────────

/// How binary payloads are surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryType {
    /// One owned buffer per message (the browser's `blob`).
    #[default]
    Blob,
    /// Binary messages are dropped with a warning.
    Ignore,
}

/// A single message on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// The peer closed the connection.
    Close {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason (may be empty).
        reason: String,
    },
}

impl Frame {
    /// Shorthand for a text frame.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Returns the text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for Frame {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Frame {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

// ── HTTP envelope ───────────────────────────────────────────────────

/// Response envelope used by every `/im/*` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    /// `200` on success.
    pub code: i64,
    /// Payload; absent or `null` on most failures.
    pub data: Option<T>,
    /// Human-readable message.
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Returns `true` when `code` is [`API_SUCCESS_CODE`].
    pub fn is_success(&self) -> bool {
        self.code == API_SUCCESS_CODE
    }

    /// Unwrap the payload of a successful envelope.
    ///
    /// # Errors
    ///
    /// [`ImError::Api`] for a non-success code, [`ImError::MissingData`] for a
    /// success envelope without `data`.
    pub fn into_data(self) -> Result<T> {
        if !self.is_success() {
            return Err(ImError::Api {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        self.data.ok_or(ImError::MissingData)
    }

    /// Like [`into_data`](Self::into_data) but treats a missing payload as `None`.
    ///
    /// # Errors
    ///
    /// [`ImError::Api`] for a non-success code.
    pub fn into_optional_data(self) -> Result<Option<T>> {
        if !self.is_success() {
            return Err(ImError::Api {
                code: self.code,
                message: self.message.unwrap_or_default(),
            });
        }
        Ok(self.data)
    }
}

// ── Heartbeat ───────────────────────────────────────────────────────

/// Application-level heartbeat sent over the WebSocket.
///
/// Serializes as
/// `{"messageType":0,"content":"heartbeat","fromId":<id>,"timestamp":<ms>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    /// Always [`HEARTBEAT_MESSAGE_TYPE`].
    pub message_type: u8,
    /// Always [`HEARTBEAT_CONTENT`].
    pub content: String,
    /// Sending user.
    pub from_id: Option<i64>,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl HeartbeatMessage {
    /// Heartbeat from `from_id` stamped with `timestamp` epoch milliseconds.
    pub fn new(from_id: Option<i64>, timestamp: u64) -> Self {
        Self {
            message_type: HEARTBEAT_MESSAGE_TYPE,
            content: HEARTBEAT_CONTENT.to_owned(),
            from_id,
            timestamp,
        }
    }

    /// Heartbeat stamped with the current wall-clock time.
    pub fn now(from_id: Option<i64>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self::new(from_id, timestamp)
    }

    /// JSON text for the socket.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
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

    #[test]
    fn heartbeat_wire_format() {
        let json = HeartbeatMessage::new(Some(7), 1_700_000_000_000)
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"messageType":0,"content":"heartbeat","fromId":7,"timestamp":1700000000000}"#
        );
    }

    #[test]
    fn heartbeat_without_user_sends_null_from_id() {
        let value: serde_json::Value =
            serde_json::from_str(&HeartbeatMessage::new(None, 1).to_json().unwrap()).unwrap();
        assert!(value["fromId"].is_null());
    }

    #[test]
    fn success_envelope_yields_data() {
        let resp: ApiResponse<String> =
            serde_json::from_str(r#"{"code":200,"data":"tok-2","message":null}"#).unwrap();
        assert_eq!(resp.into_data().unwrap(), "tok-2");
    }

    #[test]
    fn failure_envelope_maps_to_api_error() {
        let resp: ApiResponse<String> =
            serde_json::from_str(r#"{"code":500,"message":"token invalid"}"#).unwrap();
        match resp.into_data().unwrap_err() {
            ImError::Api { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "token invalid");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn success_without_data() {
        let resp: ApiResponse<i64> = serde_json::from_str(r#"{"code":200}"#).unwrap();
        assert!(matches!(
            resp.clone().into_data().unwrap_err(),
            ImError::MissingData
        ));
        assert_eq!(resp.into_optional_data().unwrap(), None);
    }

    #[test]
    fn frame_conversions() {
        assert_eq!(Frame::from("hi"), Frame::Text("hi".into()));
        assert_eq!(Frame::from(vec![1, 2]), Frame::Binary(vec![1, 2]));
        assert_eq!(Frame::text("x").as_text(), Some("x"));
        assert_eq!(Frame::Binary(vec![]).as_text(), None);
    }
}
