//! The IM socket over `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] wraps one open connection and [`WebSocketConnector`]
//! opens them for the session, one per connection attempt. `ws://` and
//! `wss://` both work; `wss://` goes through
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::error::ImError;
use crate::protocol::Frame;
use crate::transport::{Connector, Transport};

/// Default upper bound for a single connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream type produced by `connect_async`.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a `tokio-tungstenite` WebSocket stream.
///
/// Binary messages surface as [`Frame::Binary`]; a close frame surfaces as
/// [`Frame::Close`] carrying its code, after which the stream ends.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::Io`] if the URL is invalid or the connection cannot
    /// be established. The [`ErrorKind`](std::io::ErrorKind) of an underlying
    /// I/O error is preserved; everything else maps to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, ImError> {
        tracing::debug!(url = %redact_query(url), "connecting to WebSocket server");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            ImError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %redact_query(url), "WebSocket connection established");

        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ImError::Timeout`] if the deadline elapses, or any error
    /// [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, ImError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| ImError::Timeout)?
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
        if self.closed {
            return Err(ImError::TransportClosed);
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Close { code, reason } => {
                self.closed = true;
                let close = code.map(|code| CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                });
                return self
                    .stream
                    .close(close)
                    .await
                    .map_err(|e| ImError::TransportSend(e.to_string()));
            }
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| ImError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Some(Err(ImError::TransportReceive(e.to_string()))),
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => return Some(Ok(Frame::Binary(bytes.to_vec()))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or_default();
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite answers pings itself.
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ImError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| ImError::TransportSend(e.to_string()))
    }
}

/// [`Connector`] producing [`WebSocketTransport`]s, one attempt per call.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WebSocketConnector {
    /// Connector with the default 10 second connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ImError> {
        let transport = WebSocketTransport::connect_with_timeout(url, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

/// Strip the query string (it carries the auth token) before logging a URL.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[test]
    fn transport_can_move_into_the_link_task() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[test]
    fn redact_query_drops_token() {
        assert_eq!(
            redact_query("ws://h:1/socket?token=secret"),
            "ws://h:1/socket"
        );
        assert_eq!(redact_query("ws://h/socket"), "ws://h/socket");
    }

    #[tokio::test]
    async fn connect_rejects_malformed_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::Io(_)));
    }

    #[tokio::test]
    async fn connect_reports_refused_port() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::Io(_)));
    }

    #[tokio::test]
    async fn connect_gives_up_after_timeout() {
        // TEST-NET-1 is never routable.
        let err = WebSocketTransport::connect_with_timeout(
            "ws://192.0.2.1:1",
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImError::Timeout));
    }

    // ── Mock-server helpers ──────────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the first
    /// accepted connection and return the URL to connect to.
    async fn spawn_im_server<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}/socket?token=t")
    }

    // ── Mock-server tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn recv_surfaces_text_and_binary() {
        let url = spawn_im_server(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::text("hello")
        );
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::Binary(vec![0xDE, 0xAD])
        );
    }

    #[tokio::test]
    async fn recv_reports_close_code() {
        let url = spawn_im_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4001),
                reason: "logged in elsewhere".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        match transport.recv().await {
            Some(Ok(Frame::Close { code, reason })) => {
                assert_eq!(code, Some(4001));
                assert_eq!(reason, "logged in elsewhere");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_reaches_server_and_echo_returns() {
        let url = spawn_im_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.send(Frame::text("ping_echo")).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::text("ping_echo")
        );
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let url = spawn_im_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send(Frame::text("oops")).await.unwrap_err();
        assert!(matches!(err, ImError::TransportClosed));
    }

    #[tokio::test]
    async fn connector_opens_boxed_transport() {
        let url = spawn_im_server(|mut ws| async move {
            ws.send(Message::Text("welcome".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let connector = WebSocketConnector::new().with_connect_timeout(Duration::from_secs(2));
        let mut transport = connector.connect(&url).await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            Frame::text("welcome")
        );
        transport.close().await.unwrap();
    }
}
