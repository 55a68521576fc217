#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for imlink integration tests.
//!
//! Provides a channel-based [`MockConnector`] whose connections are driven by
//! the test through [`Peer`] handles, and a scripted [`MockTokenApi`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use imlink::{Connector, Frame, ImError, ImEvent, TokenApi, Transport};
use tokio::sync::mpsc;

// ── MockTransport ───────────────────────────────────────────────────

/// Transport whose other end is a [`Peer`] held by the test.
///
/// `recv()` yields frames pushed by the peer and `None` once the peer is
/// dropped. Frames the client sends are forwarded to the peer.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
        self.outgoing
            .send(frame)
            .map_err(|_| ImError::TransportSend("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ImError> {
        Ok(())
    }
}

/// Server side of one accepted connection.
pub struct Peer {
    /// URL the client connected to.
    pub url: String,
    to_client: Option<mpsc::UnboundedSender<Frame>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl Peer {
    /// Deliver `frame` to the client.
    pub fn push(&self, frame: Frame) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(frame);
        }
    }

    /// Close the connection with `code`.
    pub fn close_with(&self, code: u16, reason: &str) {
        self.push(Frame::Close {
            code: Some(code),
            reason: reason.to_owned(),
        });
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Next frame the client sent, or `None` once the client closed.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Frames sent so far, without waiting.
    pub fn drain_sent(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the next connection attempt does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Connect and hand a [`Peer`] to the test.
    Accept,
    /// Fail immediately.
    Refuse,
    /// Never finish connecting.
    Hang,
}

/// Connector that follows a queue of [`Plan`]s, then the default plan.
pub struct MockConnector {
    plans: StdMutex<VecDeque<Plan>>,
    default_plan: StdMutex<Plan>,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<Peer>,
}

impl MockConnector {
    /// Connector accepting every attempt. Accepted connections arrive on the
    /// returned receiver.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: StdMutex::new(VecDeque::new()),
            default_plan: StdMutex::new(Plan::Accept),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, peer_rx)
    }

    /// Queue plans for the next attempts.
    pub fn script(&self, plans: impl IntoIterator<Item = Plan>) {
        self.plans.lock().unwrap().extend(plans);
    }

    /// Plan used once the queue is empty.
    pub fn set_default(&self, plan: Plan) {
        *self.default_plan.lock().unwrap() = plan;
    }

    /// Number of connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ImError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_plan.lock().unwrap());
        match plan {
            Plan::Accept => {
                let (to_client, incoming) = mpsc::unbounded_channel();
                let (outgoing, from_client) = mpsc::unbounded_channel();
                let _ = self.peers.send(Peer {
                    url: url.to_owned(),
                    to_client: Some(to_client),
                    from_client,
                });
                Ok(Box::new(MockTransport { incoming, outgoing }))
            }
            Plan::Refuse => Err(ImError::TransportReceive("connection refused".into())),
            Plan::Hang => std::future::pending().await,
        }
    }
}

// ── MockTokenApi ────────────────────────────────────────────────────

/// Scripted answer of a [`MockTokenApi`] endpoint.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    /// Success with `T`.
    Ok(T),
    /// The backend answered with a non-200 envelope.
    Reject,
    /// The request never reached the backend.
    Unreachable,
    /// Success with `T`, after a delay.
    Delayed(Duration, T),
    /// The request is sent and never answered.
    Hang,
}

impl<T> Reply<T> {
    async fn resolve(self) -> Result<T, ImError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Reject => Err(ImError::Api {
                code: 401,
                message: "token invalid".into(),
            }),
            Self::Unreachable => Err(ImError::Timeout),
            Self::Delayed(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Self::Hang => std::future::pending().await,
        }
    }
}

/// [`TokenApi`] with per-endpoint answer queues and a call log.
///
/// Empty queues answer: expiry 60 minutes, renew/regenerate unreachable,
/// heartbeat no token.
#[derive(Default)]
pub struct MockTokenApi {
    expiry: StdMutex<VecDeque<Reply<i64>>>,
    renew: StdMutex<VecDeque<Reply<String>>>,
    regenerate: StdMutex<VecDeque<Reply<String>>>,
    heartbeat: StdMutex<VecDeque<Reply<Option<String>>>>,
    calls: StdMutex<Vec<String>>,
}

impl MockTokenApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_expiry(&self, reply: Reply<i64>) {
        self.expiry.lock().unwrap().push_back(reply);
    }

    pub fn on_renew(&self, reply: Reply<String>) {
        self.renew.lock().unwrap().push_back(reply);
    }

    pub fn on_regenerate(&self, reply: Reply<String>) {
        self.regenerate.lock().unwrap().push_back(reply);
    }

    pub fn on_heartbeat(&self, reply: Reply<Option<String>>) {
        self.heartbeat.lock().unwrap().push_back(reply);
    }

    /// Calls made so far, as `"<endpoint>:<argument>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, endpoint: &str, argument: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{endpoint}:{argument}"));
    }
}

#[async_trait]
impl TokenApi for MockTokenApi {
    async fn check_expiry(&self, ws_token: &str) -> imlink::Result<i64> {
        self.record("check", ws_token);
        let reply = self.expiry.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Ok(60)).resolve().await
    }

    async fn renew(&self, old_token: &str) -> imlink::Result<String> {
        self.record("renew", old_token);
        let reply = self.renew.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Unreachable).resolve().await
    }

    async fn regenerate(&self, user_token: &str) -> imlink::Result<String> {
        self.record("regenerate", user_token);
        let reply = self.regenerate.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Unreachable).resolve().await
    }

    async fn heartbeat(&self, ws_token: &str) -> imlink::Result<Option<String>> {
        self.record("heartbeat", ws_token);
        let reply = self.heartbeat.lock().unwrap().pop_front();
        reply.unwrap_or(Reply::Ok(None)).resolve().await
    }
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one matches `pred`, returning it together with
/// everything received before it. Panics if the channel closes first.
pub async fn recv_until(
    events: &mut mpsc::Receiver<ImEvent>,
    pred: impl Fn(&ImEvent) -> bool,
) -> (ImEvent, Vec<ImEvent>) {
    let mut skipped = Vec::new();
    loop {
        let event = events.recv().await.expect("event channel closed");
        if pred(&event) {
            return (event, skipped);
        }
        skipped.push(event);
    }
}

/// Everything already queued on the event channel.
pub fn drain(events: &mut mpsc::Receiver<ImEvent>) -> Vec<ImEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
