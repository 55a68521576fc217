//! # Loopback Session Example
//!
//! Runs a complete session against an in-process fake backend, no network
//! needed. Shows how to plug a custom [`Connector`] and [`TokenApi`] into
//! [`ImClient`]:
//!
//! 1. The fake server echoes every text frame
//! 2. After a few messages it drops the connection; the client reconnects
//! 3. Finally it closes with the duplicate-login code and the client stops
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use imlink::strategy::CLOSE_CODE_DUPLICATE_LOGIN;
use imlink::{
    Connector, Endpoint, Frame, ImClient, ImConfig, ImError, ImEvent, MemoryTokenStore, TokenApi,
    Transport,
};
use tokio::sync::mpsc;

/// Messages echoed before the server misbehaves.
const ECHOES_PER_CONNECTION: u32 = 3;

// ── Fake backend ────────────────────────────────────────────────────

/// Server side of a loopback connection: echoes text, then drops or kicks.
struct EchoTransport {
    connection: u32,
    echoed: u32,
    pending: mpsc::UnboundedReceiver<Frame>,
    queue: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
        if let Some(text) = frame.as_text() {
            let _ = self.queue.send(Frame::text(format!("echo: {text}")));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
        let frame = self.pending.recv().await?;
        self.echoed += 1;
        if self.echoed > ECHOES_PER_CONNECTION {
            return match self.connection {
                1 => None,
                _ => Some(Ok(Frame::Close {
                    code: Some(CLOSE_CODE_DUPLICATE_LOGIN),
                    reason: "signed in elsewhere".into(),
                })),
            };
        }
        Some(Ok(frame))
    }

    async fn close(&mut self) -> Result<(), ImError> {
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackConnector {
    connections: AtomicU32,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ImError> {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("loopback connection #{connection} to {url}");
        let (queue, pending) = mpsc::unbounded_channel();
        Ok(Box::new(EchoTransport {
            connection,
            echoed: 0,
            pending,
            queue,
        }))
    }
}

/// Token API that always answers "plenty of time left".
struct StaticTokenApi;

#[async_trait]
impl TokenApi for StaticTokenApi {
    async fn check_expiry(&self, _ws_token: &str) -> imlink::Result<i64> {
        Ok(60)
    }

    async fn renew(&self, _old_token: &str) -> imlink::Result<String> {
        Ok("loopback-renewed".into())
    }

    async fn regenerate(&self, _user_token: &str) -> imlink::Result<String> {
        Ok("loopback-regenerated".into())
    }

    async fn heartbeat(&self, _ws_token: &str) -> imlink::Result<Option<String>> {
        Ok(None)
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ImConfig::new(Endpoint::new("ws", "loopback"))
        .with_user_id(1)
        .with_initial_token("loopback-token");
    let (mut client, mut events) = ImClient::start(
        config,
        Arc::new(LoopbackConnector::default()),
        Arc::new(StaticTokenApi),
        Arc::new(MemoryTokenStore::new()),
    );

    let mut sent = 0u32;
    while let Some(event) = events.recv().await {
        match event {
            ImEvent::Connected => {
                for _ in 0..=ECHOES_PER_CONNECTION {
                    sent += 1;
                    client.send_msg(format!("message {sent}"));
                }
            }
            ImEvent::Message(frame) => {
                tracing::info!("received {:?}", frame.as_text().unwrap_or("<binary>"));
            }
            ImEvent::StateChanged { from, to, .. } => tracing::info!("{from} → {to}"),
            ImEvent::ReconnectScheduled { attempt, delay } => {
                tracing::info!("reconnect attempt {attempt} in {delay:?}");
            }
            ImEvent::Notice(notice) => tracing::info!("notice: {}", notice.text),
            ImEvent::Kicked => {
                tracing::info!("kicked, final state {}", client.state());
                break;
            }
            _ => {}
        }
    }

    client.destroy().await;
}
