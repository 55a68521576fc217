//! Socket link: the transport wrapper owned by the session.
//!
//! A [`SocketLink`] owns exactly one connection attempt to one URL. It spawns
//! a task that opens a [`Transport`] through a [`Connector`], pumps frames in
//! both directions, and re-dispatches everything that happens as
//! [`LinkEvent`]s to the handler given to [`SocketLink::connect`]. It never
//! retries: a dropped connection ends the link, and the session decides
//! whether to build a new one.
//!
//! Each link carries the generation number it was created with, so the owner
//! can recognise events from a link it has already replaced.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::protocol::{BinaryType, Frame};
use crate::transport::{Connector, Transport};

/// Close code reported when the link is closed locally.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Mirror of the WebSocket `readyState` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Connection attempt in progress (or not started).
    Connecting,
    /// Frames can be sent.
    Open,
    /// Local close requested, not finished yet.
    Closing,
    /// Closed, failed, or never opened.
    Closed,
}

impl ReadyState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The transport opened.
    Open,
    /// A data frame arrived.
    Message(Frame),
    /// Connecting, sending or receiving failed. Always followed by `Close`.
    Error(String),
    /// The link is finished. Emitted exactly once per connected link.
    Close {
        /// Close code from the peer, [`CLOSE_CODE_NORMAL`] for a local close,
        /// `None` when the connection dropped without one.
        code: Option<u16>,
        /// Close reason or error text.
        reason: String,
    },
}

#[derive(Debug)]
enum LinkCommand {
    Send(Frame),
    Close,
}

/// Cloneable sending half of a [`SocketLink`].
#[derive(Debug, Clone)]
pub struct LinkSender {
    generation: u64,
    ready: Arc<AtomicU8>,
    outbound: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkSender {
    /// Generation of the link this sender belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current ready state of the link.
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::Acquire))
    }

    /// Returns `true` iff the link is [`ReadyState::Open`].
    pub fn is_ready(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue `frame` for sending. Returns `false` without side effects if the
    /// link is not open or its task has exited.
    pub fn send(&self, frame: Frame) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.outbound.send(LinkCommand::Send(frame)).is_ok()
    }
}

/// Transport wrapper around a single connection to a fixed URL.
#[derive(Debug)]
pub struct SocketLink {
    url: String,
    binary_type: BinaryType,
    generation: u64,
    ready: Arc<AtomicU8>,
    sender: Option<LinkSender>,
}

impl SocketLink {
    /// Create an unconnected link. `url` is final; build it with
    /// [`Endpoint::socket_url`](crate::config::Endpoint::socket_url).
    pub fn new(url: impl Into<String>, binary_type: BinaryType, generation: u64) -> Self {
        Self {
            url: url.into(),
            binary_type,
            generation,
            ready: Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8())),
            sender: None,
        }
    }

    /// The URL this link connects to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The generation this link was created with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current ready state.
    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::Acquire))
    }

    /// Returns `true` iff the transport exists and is open.
    pub fn is_ready(&self) -> bool {
        self.sender.is_some() && self.ready_state() == ReadyState::Open
    }

    /// Sending half, once [`connect`](Self::connect) has been called.
    pub fn sender(&self) -> Option<LinkSender> {
        self.sender.clone()
    }

    /// Start connecting. Every outcome is reported through `handler`.
    ///
    /// Calling `connect` on a link that already started is a no-op.
    pub fn connect<F>(&mut self, connector: Arc<dyn Connector>, handler: F)
    where
        F: Fn(LinkEvent) + Send + 'static,
    {
        if self.sender.is_some() {
            warn!(generation = self.generation, "link already started");
            return;
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.ready
            .store(ReadyState::Connecting.as_u8(), Ordering::Release);
        self.sender = Some(LinkSender {
            generation: self.generation,
            ready: Arc::clone(&self.ready),
            outbound: outbound_tx,
        });

        tokio::spawn(run_link(
            connector,
            self.url.clone(),
            self.binary_type,
            self.generation,
            Arc::clone(&self.ready),
            outbound_rx,
            handler,
        ));
    }

    /// Queue `frame` for sending. Returns `false` if there is no socket or it
    /// is not open; never panics.
    pub fn send(&self, frame: Frame) -> bool {
        self.sender.as_ref().is_some_and(|sender| sender.send(frame))
    }

    /// Close the link. Safe to call before `connect` and more than once.
    pub fn close(&mut self) {
        let Some(sender) = self.sender.take() else {
            self.ready.store(ReadyState::Closed.as_u8(), Ordering::Release);
            return;
        };
        if self.ready_state() != ReadyState::Closed {
            self.ready.store(ReadyState::Closing.as_u8(), Ordering::Release);
        }
        // The link task may already have exited; nothing left to close then.
        let _ = sender.outbound.send(LinkCommand::Close);
    }
}

/// Background task of one link.
async fn run_link<F>(
    connector: Arc<dyn Connector>,
    url: String,
    binary_type: BinaryType,
    generation: u64,
    ready: Arc<AtomicU8>,
    mut outbound_rx: mpsc::UnboundedReceiver<LinkCommand>,
    handler: F,
) where
    F: Fn(LinkEvent) + Send + 'static,
{
    let set_state = |state: ReadyState| ready.store(state.as_u8(), Ordering::Release);

    let mut transport = tokio::select! {
        result = connector.connect(&url) => match result {
            Ok(transport) => transport,
            Err(e) => {
                debug!(generation, error = %e, "link connect failed");
                set_state(ReadyState::Closed);
                handler(LinkEvent::Error(e.to_string()));
                handler(LinkEvent::Close { code: None, reason: e.to_string() });
                return;
            }
        },
        () = wait_for_close(&mut outbound_rx) => {
            debug!(generation, "link closed while connecting");
            set_state(ReadyState::Closed);
            handler(LinkEvent::Close {
                code: Some(CLOSE_CODE_NORMAL),
                reason: "closed before open".to_owned(),
            });
            return;
        }
    };

    set_state(ReadyState::Open);
    debug!(generation, "link open");
    handler(LinkEvent::Open);

    let (code, reason) = loop {
        tokio::select! {
            incoming = transport.recv() => match incoming {
                Some(Ok(Frame::Close { code, reason })) => break (code, reason),
                Some(Ok(Frame::Binary(_))) if binary_type == BinaryType::Ignore => {
                    warn!(generation, "dropping binary frame");
                }
                Some(Ok(frame)) => {
                    trace!(generation, "link frame received");
                    handler(LinkEvent::Message(frame));
                }
                Some(Err(e)) => {
                    handler(LinkEvent::Error(e.to_string()));
                    break (None, e.to_string());
                }
                None => break (None, "connection dropped".to_owned()),
            },
            cmd = outbound_rx.recv() => match cmd {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        handler(LinkEvent::Error(e.to_string()));
                        break (None, e.to_string());
                    }
                }
                Some(LinkCommand::Close) | None => {
                    set_state(ReadyState::Closing);
                    if let Err(e) = transport.close().await {
                        debug!(generation, error = %e, "close handshake failed");
                    }
                    break (Some(CLOSE_CODE_NORMAL), "closed by client".to_owned());
                }
            },
        }
    };

    set_state(ReadyState::Closed);
    debug!(generation, ?code, %reason, "link closed");
    handler(LinkEvent::Close { code, reason });
}

/// Resolves once a close is requested or the owning link is dropped.
async fn wait_for_close(outbound_rx: &mut mpsc::UnboundedReceiver<LinkCommand>) {
    while let Some(cmd) = outbound_rx.recv().await {
        if matches!(cmd, LinkCommand::Close) {
            return;
        }
    }
}

#[cfg(test)]
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
    use crate::error::ImError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    // ── Channel transport ───────────────────────────────────────────

    /// Transport whose peer side is a pair of channels held by the test.
    struct ChannelTransport {
        incoming: mpsc::UnboundedReceiver<Frame>,
        sent: Arc<StdMutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, frame: Frame) -> Result<(), ImError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<Frame, ImError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), ImError> {
            Ok(())
        }
    }

    struct OneShotConnector {
        transport: StdMutex<Option<ChannelTransport>>,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, ImError> {
            match self.transport.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(ImError::TransportClosed),
            }
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, ImError> {
            Err(ImError::Timeout)
        }
    }

    fn channel_connector() -> (
        Arc<dyn Connector>,
        mpsc::UnboundedSender<Frame>,
        Arc<StdMutex<Vec<Frame>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let connector = OneShotConnector {
            transport: StdMutex::new(Some(ChannelTransport {
                incoming: rx,
                sent: Arc::clone(&sent),
            })),
        };
        (Arc::new(connector), tx, sent)
    }

    fn event_sink() -> (
        impl Fn(LinkEvent) + Send + 'static,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |event| {
                let _ = tx.send(event);
            },
            rx,
        )
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[test]
    fn send_on_unconnected_link_returns_false() {
        let link = SocketLink::new("ws://localhost/socket?token=", BinaryType::Blob, 1);
        assert!(!link.send(Frame::text("hello")));
        assert!(!link.is_ready());
        assert!(link.sender().is_none());
    }

    #[test]
    fn close_without_socket_is_safe() {
        let mut link = SocketLink::new("ws://localhost/socket", BinaryType::Blob, 1);
        link.close();
        link.close();
        assert_eq!(link.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn open_message_close_sequence() {
        let (connector, peer, sent) = channel_connector();
        let (handler, mut events) = event_sink();
        let mut link = SocketLink::new("ws://test/socket", BinaryType::Blob, 7);
        link.connect(connector, handler);

        assert_eq!(events.recv().await.unwrap(), LinkEvent::Open);
        assert!(link.is_ready());

        assert!(link.send(Frame::text("out")));
        for _ in 0..100 {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        peer.send(Frame::text("in")).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Message(Frame::text("in"))
        );

        peer.send(Frame::Close {
            code: Some(4001),
            reason: "kick".into(),
        })
        .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Close {
                code: Some(4001),
                reason: "kick".into()
            }
        );
        assert_eq!(link.ready_state(), ReadyState::Closed);
        assert!(!link.send(Frame::text("late")));
        assert_eq!(sent.lock().unwrap().as_slice(), &[Frame::text("out")]);
    }

    #[tokio::test]
    async fn failed_connect_emits_error_then_close() {
        let (handler, mut events) = event_sink();
        let mut link = SocketLink::new("ws://test/socket", BinaryType::Blob, 1);
        link.connect(Arc::new(FailingConnector), handler);

        assert!(matches!(events.recv().await.unwrap(), LinkEvent::Error(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Close { code: None, .. }
        ));
        assert!(!link.is_ready());
    }

    #[tokio::test]
    async fn local_close_reports_normal_code() {
        let (connector, _peer, _sent) = channel_connector();
        let (handler, mut events) = event_sink();
        let mut link = SocketLink::new("ws://test/socket", BinaryType::Blob, 1);
        link.connect(connector, handler);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Open);

        link.close();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Close {
                code: Some(CLOSE_CODE_NORMAL),
                reason: "closed by client".into()
            }
        );
        assert!(!link.is_ready());
    }

    #[tokio::test]
    async fn ignored_binary_frames_are_dropped() {
        let (connector, peer, _sent) = channel_connector();
        let (handler, mut events) = event_sink();
        let mut link = SocketLink::new("ws://test/socket", BinaryType::Ignore, 1);
        link.connect(connector, handler);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Open);

        peer.send(Frame::Binary(vec![1, 2, 3])).unwrap();
        peer.send(Frame::text("after")).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Message(Frame::text("after"))
        );
    }
}
