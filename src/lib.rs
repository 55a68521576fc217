//! # imlink
//!
//! Async client that keeps one authenticated WebSocket session to an IM
//! backend alive.
//!
//! The crate covers the connection layer only: a checked connection state
//! machine, exponential reconnect backoff with jitter, named timers,
//! WebSocket and HTTP heartbeats, and token renewal. Message-level protocol
//! is left to the host, which receives raw [`Frame`]s.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Connector`] and [`Transport`] for any backend
//! - **WebSocket built-in**: default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **HTTP token API built-in**: default `http-api` feature provides [`HttpTokenApi`]
//! - **Event-driven**: receive typed [`ImEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use imlink::{Endpoint, FileTokenStore, HttpTokenApi, ImClient, ImConfig, ImEvent, WebSocketConnector};
//!
//! let config = ImConfig::new(Endpoint::new("wss", "im.example.com")).with_user_id(42);
//! let (client, mut events) = ImClient::start(
//!     config,
//!     Arc::new(WebSocketConnector::new()),
//!     Arc::new(HttpTokenApi::new("https://im.example.com/api/")?),
//!     Arc::new(FileTokenStore::new("tokens.json")),
//! );
//! while let Some(event) = events.recv().await {
//!     if let ImEvent::Message(frame) = event {
//!         println!("{frame:?}");
//!     }
//! }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod protocol;
pub mod reconnect;
pub mod state;
pub mod strategy;
pub mod timer;
pub mod token;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use api::TokenApi;
#[cfg(feature = "http-api")]
pub use api::HttpTokenApi;
pub use client::ImClient;
pub use config::{Endpoint, ImConfig};
pub use error::{ImError, Result};
pub use event::{ImEvent, Notice, NoticeLevel};
pub use link::{LinkEvent, ReadyState, SocketLink};
pub use protocol::{ApiResponse, BinaryType, Frame, HeartbeatMessage};
pub use reconnect::{ReconnectContext, ReconnectManager, ScheduleOutcome};
pub use state::{ConnectionState, StateMachine, Transition};
pub use strategy::{
    EnvSignals, GiveUpReason, ReconnectDecision, ReconnectStrategy, ReconnectStrategyConfig,
};
pub use timer::TimerManager;
pub use token::{FileTokenStore, MemoryTokenStore, TokenCell, TokenStore};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
