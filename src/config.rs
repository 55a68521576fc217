//! Session configuration.
//!
//! [`ImConfig`] is supplied to [`ImClient::start`](crate::client::ImClient::start).
//! Only the [`Endpoint`] is required; every timing has a default matching the
//! backend's expectations.
//!
//! # Example
//!
//! ```
//! use imlink::config::{Endpoint, ImConfig};
//! use std::time::Duration;
//!
//! let config = ImConfig::new(Endpoint::new("wss", "im.example.com"))
//!     .with_user_id(42)
//!     .with_ws_heartbeat_interval(Duration::from_secs(30));
//! assert_eq!(config.user_id, Some(42));
//! ```

use std::time::Duration;

use url::Url;

use crate::error::Result;
use crate::protocol::BinaryType;
use crate::strategy::ReconnectStrategyConfig;

/// Path of the WebSocket endpoint.
pub const SOCKET_PATH: &str = "/socket";

const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_HTTP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_TOKEN_RENEW_THRESHOLD_MINUTES: i64 = 10;
const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_VISIBILITY_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_VISIBILITY_TAPER: u32 = 2;

/// Where the WebSocket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `ws` or `wss`.
    pub protocol: String,
    /// Host name or address.
    pub host: String,
    /// Explicit port; omitted from the URL when `None`.
    pub port: Option<u16>,
}

impl Endpoint {
    /// Endpoint on the scheme's default port.
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port: None,
        }
    }

    /// Set an explicit port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// `<protocol>://<host>[:<port>]/socket?token=<urlencoded token>`.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::Url`](crate::error::ImError::Url) if the parts do
    /// not form a valid URL.
    pub fn socket_url(&self, token: &str) -> Result<String> {
        let authority = match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        };
        let mut url = Url::parse(&format!("{}://{authority}{SOCKET_PATH}", self.protocol))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.into())
    }
}

/// Configuration for an [`ImClient`](crate::client::ImClient).
#[derive(Debug, Clone)]
pub struct ImConfig {
    /// WebSocket endpoint.
    pub endpoint: Endpoint,
    /// Id sent as `fromId` in WebSocket heartbeats.
    pub user_id: Option<i64>,
    /// Token handed over by the host (the page's query string). Takes
    /// precedence over the stored token.
    pub initial_token: Option<String>,
    /// How binary frames are surfaced.
    pub binary_type: BinaryType,
    /// Reconnect backoff.
    pub reconnect: ReconnectStrategyConfig,
    /// Period of the WebSocket heartbeat. Defaults to **60 s**.
    pub ws_heartbeat_interval: Duration,
    /// Period of the HTTP heartbeat. Defaults to **180 s**.
    pub http_heartbeat_interval: Duration,
    /// Period of the token-expiry check. Defaults to **5 min**.
    pub token_check_interval: Duration,
    /// Renew once this many minutes or fewer remain. Defaults to **10**.
    pub token_renew_threshold_minutes: i64,
    /// How long a connection must stay up before the attempt counter resets.
    /// Defaults to **5 s**.
    pub stability_window: Duration,
    /// Delay between the page becoming visible and the health check.
    /// Defaults to **1 s**.
    pub visibility_grace: Duration,
    /// Attempts forgiven when the page becomes visible again. Defaults to **2**.
    pub visibility_taper: u32,
    /// Capacity of the bounded event channel. Defaults to **256**; values
    /// below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`ImClient::destroy`](crate::client::ImClient::destroy) waits
    /// for the session loop before aborting it. Defaults to **1 s**.
    pub shutdown_timeout: Duration,
    /// Deadline for each token API call. A call still pending after this is
    /// treated as unreachable. Defaults to **30 s**.
    pub api_timeout: Duration,
}

impl ImConfig {
    /// Configuration for `endpoint` with default timings.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            user_id: None,
            initial_token: None,
            binary_type: BinaryType::Blob,
            reconnect: ReconnectStrategyConfig::default(),
            ws_heartbeat_interval: DEFAULT_WS_HEARTBEAT_INTERVAL,
            http_heartbeat_interval: DEFAULT_HTTP_HEARTBEAT_INTERVAL,
            token_check_interval: DEFAULT_TOKEN_CHECK_INTERVAL,
            token_renew_threshold_minutes: DEFAULT_TOKEN_RENEW_THRESHOLD_MINUTES,
            stability_window: DEFAULT_STABILITY_WINDOW,
            visibility_grace: DEFAULT_VISIBILITY_GRACE,
            visibility_taper: DEFAULT_VISIBILITY_TAPER,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            api_timeout: DEFAULT_API_TIMEOUT,
        }
    }

    /// Set the user id sent in heartbeats.
    #[must_use]
    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set the token handed over by the host.
    #[must_use]
    pub fn with_initial_token(mut self, token: impl Into<String>) -> Self {
        self.initial_token = Some(token.into());
        self
    }

    /// Set how binary frames are surfaced.
    #[must_use]
    pub fn with_binary_type(mut self, binary_type: BinaryType) -> Self {
        self.binary_type = binary_type;
        self
    }

    /// Set the reconnect backoff.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectStrategyConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the WebSocket heartbeat period.
    #[must_use]
    pub fn with_ws_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.ws_heartbeat_interval = interval;
        self
    }

    /// Set the HTTP heartbeat period.
    #[must_use]
    pub fn with_http_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.http_heartbeat_interval = interval;
        self
    }

    /// Set the token-expiry check period.
    #[must_use]
    pub fn with_token_check_interval(mut self, interval: Duration) -> Self {
        self.token_check_interval = interval;
        self
    }

    /// Set the renewal threshold in minutes.
    #[must_use]
    pub fn with_token_renew_threshold_minutes(mut self, minutes: i64) -> Self {
        self.token_renew_threshold_minutes = minutes;
        self
    }

    /// Set the stability window.
    #[must_use]
    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Set the visibility grace delay.
    #[must_use]
    pub fn with_visibility_grace(mut self, grace: Duration) -> Self {
        self.visibility_grace = grace;
        self
    }

    /// Set the event channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the deadline for token API calls.
    #[must_use]
    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
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
    fn socket_url_with_port() {
        let endpoint = Endpoint::new("ws", "127.0.0.1").with_port(8081);
        assert_eq!(
            endpoint.socket_url("abc").unwrap(),
            "ws://127.0.0.1:8081/socket?token=abc"
        );
    }

    #[test]
    fn socket_url_without_port_encodes_token() {
        let endpoint = Endpoint::new("wss", "im.example.com");
        assert_eq!(
            endpoint.socket_url("a+b/c=").unwrap(),
            "wss://im.example.com/socket?token=a%2Bb%2Fc%3D"
        );
    }

    #[test]
    fn socket_url_rejects_garbage_host() {
        assert!(Endpoint::new("ws", "bad host").socket_url("t").is_err());
    }

    #[test]
    fn defaults() {
        let config = ImConfig::new(Endpoint::new("ws", "localhost"));
        assert_eq!(config.ws_heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.http_heartbeat_interval, Duration::from_secs(180));
        assert_eq!(config.token_check_interval, Duration::from_secs(300));
        assert_eq!(config.token_renew_threshold_minutes, 10);
        assert_eq!(config.stability_window, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert!(config.initial_token.is_none());
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config =
            ImConfig::new(Endpoint::new("ws", "localhost")).with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }
}
