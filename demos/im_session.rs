//! # IM Session Example
//!
//! Keeps a session to a real IM backend alive:
//!
//! 1. Connect over WebSocket with the token from `IM_TOKEN` (or the token file)
//! 2. Renew the token through the HTTP API as it nears expiry
//! 3. Print incoming frames and user notices
//! 4. Send a line typed on stdin as a text message
//! 5. Shut down on Ctrl+C or when kicked by another login
//!
//! ## Running
//!
//! ```sh
//! IM_HOST=im.example.com IM_API=https://im.example.com/api/ IM_TOKEN=... \
//!     cargo run --example im_session
//! ```

use std::sync::Arc;

use imlink::{
    Endpoint, FileTokenStore, HttpTokenApi, ImClient, ImConfig, ImEvent, WebSocketConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_API: &str = "http://localhost:8081/api/";
const TOKEN_FILE: &str = "imlink-tokens.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=imlink=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let host = std::env::var("IM_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let api_base = std::env::var("IM_API").unwrap_or_else(|_| DEFAULT_API.to_string());
    let secure = std::env::var("IM_SECURE").is_ok_and(|v| v == "1");

    let mut endpoint = Endpoint::new(if secure { "wss" } else { "ws" }, host);
    if let Some(port) = std::env::var("IM_PORT").ok().and_then(|p| p.parse().ok()) {
        endpoint = endpoint.with_port(port);
    }
    let mut config = ImConfig::new(endpoint);
    if let Ok(token) = std::env::var("IM_TOKEN") {
        config = config.with_initial_token(token);
    }
    if let Some(user_id) = std::env::var("IM_USER_ID").ok().and_then(|v| v.parse().ok()) {
        config = config.with_user_id(user_id);
    }

    // ── Start ───────────────────────────────────────────────────────
    let (mut client, mut events) = ImClient::start(
        config,
        Arc::new(WebSocketConnector::new()),
        Arc::new(HttpTokenApi::new(&api_base)?),
        Arc::new(FileTokenStore::new(TOKEN_FILE)),
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Event channel closed, exiting");
                    break;
                };
                match event {
                    ImEvent::StateChanged { from, to, reason } => {
                        tracing::info!("{from} → {to} ({reason})");
                    }
                    ImEvent::Connected => tracing::info!("Connected; type a line to send it"),
                    ImEvent::Message(frame) => match frame.as_text() {
                        Some(text) => println!("< {text}"),
                        None => println!("< {frame:?}"),
                    },
                    ImEvent::Disconnected { code, reason } => {
                        tracing::warn!("Disconnected (code {code:?}): {reason}");
                    }
                    ImEvent::ReconnectScheduled { attempt, delay } => {
                        tracing::info!("Reconnect attempt {attempt} in {delay:?}");
                    }
                    ImEvent::TokenRotated => tracing::info!("Token rotated"),
                    ImEvent::Notice(notice) => {
                        eprintln!("[{:?}] {}", notice.level, notice.text);
                    }
                    ImEvent::Kicked => {
                        tracing::warn!("Signed in elsewhere, exiting");
                        break;
                    }
                }
            }

            line = stdin.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/retry" => client.retry_now(),
                    Some(line) => {
                        if !client.send_msg(line) {
                            tracing::warn!("Message not sent");
                        }
                    }
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    client.destroy().await;
    Ok(())
}
