//! Async IM session client.
//!
//! [`ImClient`] is a thin handle over a background session loop. The loop owns
//! the [`StateMachine`], the [`ReconnectManager`], the [`TimerManager`], the
//! current [`SocketLink`] and the [`TokenCell`], and handles one input at a
//! time: link events, timer ticks, token API answers and the host's calls all
//! arrive on the same unbounded channel. Events are emitted on a bounded
//! channel ([`tokio::sync::mpsc::Receiver<ImEvent>`]) returned from
//! [`ImClient::start`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ImConfig::new(Endpoint::new("wss", "im.example.com")).with_user_id(42);
//! let (client, mut events) = ImClient::start(
//!     config,
//!     Arc::new(WebSocketConnector::default()),
//!     Arc::new(HttpTokenApi::new("https://im.example.com/api/")?),
//!     Arc::new(FileTokenStore::new("tokens.json")),
//! );
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ImEvent::Connected => { client.send_msg("hello"); }
//!         ImEvent::Message(frame) => { /* … */ }
//!         ImEvent::Kicked => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::api::TokenApi;
use crate::config::ImConfig;
use crate::error::{ImError, Result};
use crate::event::{ImEvent, Notice};
use crate::link::{LinkEvent, LinkSender, ReadyState, SocketLink};
use crate::protocol::{Frame, HeartbeatMessage};
use crate::reconnect::{ReconnectContext, ReconnectManager, ScheduleOutcome};
use crate::state::{ConnectionState, StateMachine};
use crate::strategy::{EnvSignals, GiveUpReason, ReconnectStrategy};
use crate::timer::TimerManager;
use crate::token::{Adoption, TokenCell, TokenStore, USER_TOKEN_KEY, WS_TOKEN_KEY};
use crate::transport::Connector;

/// Timer sending the WebSocket heartbeat.
pub const WS_HEARTBEAT_TIMER: &str = "ws_heartbeat";
/// Timer calling the HTTP heartbeat.
pub const HTTP_HEARTBEAT_TIMER: &str = "http_heartbeat";
/// Timer checking token expiry.
pub const TOKEN_CHECK_TIMER: &str = "token_check";
/// One-shot timer resetting the attempt counter after a stable connection.
pub const STABILITY_TIMER: &str = "stability";
/// One-shot timer delaying the health check after the page becomes visible.
pub const VISIBILITY_TIMER: &str = "visibility";

const LOGIN_AGAIN: &str = "Your session has expired. Please log in again.";
const KICKED: &str = "Your account signed in on another device. This session has been closed.";
const EXHAUSTED: &str = "Unable to reach the chat server. Check your network and retry.";

// ── Shared state ────────────────────────────────────────────────────

/// State mirrored by the session loop for the handle's synchronous accessors.
struct Shared {
    state: AtomicU8,
    attempts: AtomicU32,
    active_timers: AtomicUsize,
    destroyed: AtomicBool,
    token: Mutex<String>,
    link: Mutex<Option<LinkSender>>,
    events: Mutex<Option<mpsc::Sender<ImEvent>>>,
}

impl Shared {
    fn new(token: String, events: mpsc::Sender<ImEvent>) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            attempts: AtomicU32::new(0),
            active_timers: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            token: Mutex::new(token),
            link: Mutex::new(None),
            events: Mutex::new(Some(events)),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn link(&self) -> Option<LinkSender> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_link(&self, link: Option<LinkSender>) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = link;
    }

    fn token(&self) -> String {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: &str) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token.to_owned();
    }

    fn notify(&self, notice: Notice) {
        if let Some(events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            emit_event(events, ImEvent::Notice(notice));
        }
    }

    fn close_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ── Session inputs ──────────────────────────────────────────────────

/// Everything the session loop reacts to.
#[derive(Debug)]
enum Input {
    Link { generation: u64, event: LinkEvent },
    ReconnectDue(u32),
    Tick(Tick),
    ExpiryChecked(Result<i64>),
    TokenFetched {
        request_id: u64,
        source: TokenSource,
        result: Result<String>,
    },
    HeartbeatAnswered {
        request_id: u64,
        sent_with: String,
        result: Result<Option<String>>,
    },
    PageVisible(bool),
    Online(bool),
    Reconnect,
    RetryNow,
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    WsHeartbeat,
    HttpHeartbeat,
    TokenCheck,
    Stable(u64),
    VisibilityGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Renew,
    Regenerate,
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to one IM session.
///
/// Created via [`ImClient::start`], which spawns the background session loop
/// and returns this handle together with an event receiver. Methods never
/// fail: problems are logged and reported as [`ImEvent::Notice`]s.
///
/// The host owns exactly one client per session and calls
/// [`destroy`](Self::destroy) before creating a replacement.
pub struct ImClient {
    input_tx: mpsc::UnboundedSender<Input>,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl ImClient {
    /// Start the session loop and return a handle plus event receiver.
    ///
    /// The token is taken from [`ImConfig::initial_token`] if set (and saved
    /// to `store`), otherwise from `store`. The loop connects immediately.
    ///
    /// # Arguments
    ///
    /// * `config`: endpoint, user id and timings.
    /// * `connector`: opens the WebSocket for each connection attempt.
    /// * `api`: token endpoints of the backend.
    /// * `store`: persistent token storage.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        config: ImConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn TokenApi>,
        store: Arc<dyn TokenStore>,
    ) -> (Self, mpsc::Receiver<ImEvent>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Input>();
        let (event_tx, event_rx) = mpsc::channel::<ImEvent>(config.event_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let token = initial_token(&config, store.as_ref());
        let shared = Arc::new(Shared::new(token, event_tx.clone()));
        let shutdown_timeout = config.shutdown_timeout;

        let session = Session::new(
            config,
            connector,
            api,
            store,
            Arc::clone(&shared),
            input_tx.clone(),
            event_tx,
        );
        let task = tokio::spawn(session.run(input_rx, shutdown_rx));

        let client = Self {
            input_tx,
            shared,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (client, event_rx)
    }

    /// Send `message` over the WebSocket.
    ///
    /// Returns `false`, with a notice, if the session was kicked or destroyed,
    /// if there is no socket, or if the socket is not open. In the last case
    /// a reconnect is requested when the socket has fully closed.
    pub fn send_msg(&self, message: impl Into<Frame>) -> bool {
        if self.shared.destroyed.load(Ordering::Acquire) {
            self.shared
                .notify(Notice::warning("The chat session has ended. Message not sent."));
            return false;
        }
        if self.shared.state().is_terminal() {
            self.shared.notify(Notice::warning(
                "This session was closed by another login. Message not sent.",
            ));
            return false;
        }
        let Some(link) = self.shared.link() else {
            self.shared
                .notify(Notice::warning("Not connected to the chat server. Message not sent."));
            return false;
        };
        if !link.is_ready() {
            let ready = link.ready_state();
            debug!(?ready, "send while link not ready");
            self.shared
                .notify(Notice::warning("Connection is not ready. Message not sent."));
            if ready == ReadyState::Closed {
                self.push(Input::Reconnect);
            }
            return false;
        }
        if link.send(message.into()) {
            true
        } else {
            self.shared
                .notify(Notice::warning("Connection is not ready. Message not sent."));
            false
        }
    }

    /// Report whether the host page is visible.
    ///
    /// Hiding cancels a pending reconnect and pauses heartbeats; becoming
    /// visible again checks the connection after a short grace delay.
    pub fn set_page_visible(&self, visible: bool) {
        self.push(Input::PageVisible(visible));
    }

    /// Report whether the network is available.
    pub fn set_online(&self, online: bool) {
        self.push(Input::Online(online));
    }

    /// Reconnect now unless the session is closed or already connected.
    pub fn reconnect(&self) {
        self.push(Input::Reconnect);
    }

    /// Forget previous failed attempts and reconnect now. Has no effect on a
    /// kicked session.
    pub fn retry_now(&self) {
        self.push(Input::RetryNow);
    }

    /// Tear the session down: clear every timer, cancel reconnects, close the
    /// socket and stop the background loop.
    ///
    /// Safe to call more than once. Once it returns, the event receiver
    /// yields `None` after the remaining events.
    pub async fn destroy(&mut self) {
        debug!("ImClient: destroy requested");
        self.shared.destroyed.store(true, Ordering::Release);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared.close_events();
        self.shared.set_link(None);
        self.shared
            .state
            .store(ConnectionState::Disconnected.as_u8(), Ordering::Release);
        self.shared.attempts.store(0, Ordering::Release);
        self.shared.active_timers.store(0, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Reconnect attempts since the last stable connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// The WebSocket token currently in use (may be empty).
    pub fn token(&self) -> String {
        self.shared.token()
    }

    /// Number of timers the session has armed.
    pub fn active_timers(&self) -> usize {
        self.shared.active_timers.load(Ordering::Acquire)
    }

    /// Returns `true` if the socket is open.
    pub fn is_ready(&self) -> bool {
        self.shared.link().is_some_and(|link| link.is_ready())
    }

    fn push(&self, input: Input) {
        if self.input_tx.send(input).is_err() {
            debug!("session loop gone, input dropped");
        }
    }
}

impl std::fmt::Debug for ImClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImClient")
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .field("is_ready", &self.is_ready())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ImClient {
    fn drop(&mut self) {
        // Aborting drops the session, whose timers and link shut down with it.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn initial_token(config: &ImConfig, store: &dyn TokenStore) -> String {
    if let Some(token) = config.initial_token.as_deref().filter(|t| !t.is_empty()) {
        if let Err(e) = store.save(WS_TOKEN_KEY, token) {
            warn!(error = %e, "failed to persist initial token");
        }
        return token.to_owned();
    }
    match store.load(WS_TOKEN_KEY).filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => {
            warn!("no websocket token available, connecting without one");
            String::new()
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

struct Session {
    config: ImConfig,
    connector: Arc<dyn Connector>,
    api: Arc<dyn TokenApi>,
    store: Arc<dyn TokenStore>,
    shared: Arc<Shared>,
    input_tx: mpsc::UnboundedSender<Input>,
    events: mpsc::Sender<ImEvent>,
    machine: StateMachine,
    reconnects: ReconnectManager,
    timers: TimerManager,
    link: Option<SocketLink>,
    generation: u64,
    token: TokenCell,
    token_busy: bool,
    page_hidden: bool,
    offline: bool,
}

impl Session {
    fn new(
        config: ImConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn TokenApi>,
        store: Arc<dyn TokenStore>,
        shared: Arc<Shared>,
        input_tx: mpsc::UnboundedSender<Input>,
        events: mpsc::Sender<ImEvent>,
    ) -> Self {
        let mut reconnects =
            ReconnectManager::new(ReconnectStrategy::new(config.reconnect.clone()));
        let tx = input_tx.clone();
        reconnects.on_reconnect(move |attempt| {
            let _ = tx.send(Input::ReconnectDue(attempt));
        });
        let token = TokenCell::new(shared.token());

        Self {
            config,
            connector,
            api,
            store,
            shared,
            input_tx,
            events,
            machine: StateMachine::new(),
            reconnects,
            timers: TimerManager::new(),
            link: None,
            generation: 0,
            token,
            token_busy: false,
            page_hidden: false,
            offline: false,
        }
    }

    /// Exits on shutdown. The loop holds a sender itself, so the input
    /// channel only closes if every sender is gone.
    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<Input>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session loop started");
        self.init_ws("initial connect");
        self.publish();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }
                input = input_rx.recv() => match input {
                    Some(input) => {
                        self.handle(input).await;
                        self.publish();
                    }
                    None => break,
                },
            }
        }

        self.teardown();
        debug!("session loop exited");
    }

    async fn handle(&mut self, input: Input) {
        trace!(?input, "session input");
        match input {
            Input::Link { generation, event } => self.on_link_event(generation, event).await,
            Input::ReconnectDue(attempt) => {
                if !self.machine.is(ConnectionState::Reconnecting) || self.link_pending() {
                    debug!(attempt, "reconnect timer superseded");
                    return;
                }
                info!(attempt, "reconnect attempt");
                self.init_ws("reconnect attempt");
            }
            Input::Tick(tick) => self.on_tick(tick),
            Input::ExpiryChecked(result) => self.on_expiry_checked(result),
            Input::TokenFetched {
                request_id,
                source,
                result,
            } => self.on_token_fetched(request_id, source, result),
            Input::HeartbeatAnswered {
                request_id,
                sent_with,
                result,
            } => match result {
                Ok(Some(token)) => {
                    let adoption = self.token.adopt_rotation(request_id, &sent_with, token);
                    self.on_adoption(request_id, adoption);
                }
                Ok(None) => trace!("http heartbeat ok"),
                Err(e) => warn!(error = %e, "http heartbeat failed"),
            },
            Input::PageVisible(visible) => self.on_visibility(visible),
            Input::Online(online) => self.on_online(online),
            Input::Reconnect => self.reconnect("reconnect requested"),
            Input::RetryNow => {
                if self.machine.is(ConnectionState::Closed) {
                    debug!("retry ignored, session closed");
                    return;
                }
                self.machine.reset_reconnect_attempts();
                self.reconnect("manual retry");
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    fn init_ws(&mut self, reason: &str) {
        if self.machine.is(ConnectionState::Closed) {
            debug!("session closed, not connecting");
            return;
        }
        self.reconnects.cancel(&mut self.timers);
        self.detach_link();

        let url = match self.config.endpoint.socket_url(self.token.get()) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "cannot build socket url");
                self.emit(Notice::error(format!("Invalid chat server address: {e}")).into());
                return;
            }
        };

        self.transition(ConnectionState::Connecting, reason);
        self.generation += 1;
        let generation = self.generation;
        let mut link = SocketLink::new(url, self.config.binary_type, generation);
        let tx = self.input_tx.clone();
        link.connect(Arc::clone(&self.connector), move |event| {
            let _ = tx.send(Input::Link { generation, event });
        });
        self.shared.set_link(link.sender());
        self.link = Some(link);
        info!(generation, "connecting");
    }

    async fn on_link_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation || self.link.is_none() {
            trace!(
                generation,
                current = self.generation,
                "ignoring event from superseded link"
            );
            return;
        }
        match event {
            LinkEvent::Open => self.on_open(),
            LinkEvent::Message(frame) => self.emit(ImEvent::Message(frame)),
            LinkEvent::Error(text) => {
                warn!(generation, error = %text, "socket error");
                self.emit(Notice::warning("Connection problem, trying to recover.").into());
            }
            LinkEvent::Close { code, reason } => self.on_close(code, reason).await,
        }
    }

    fn on_open(&mut self) {
        if !self.transition(ConnectionState::Connected, "socket open") {
            return;
        }
        self.reconnects.cancel(&mut self.timers);
        self.every(
            WS_HEARTBEAT_TIMER,
            self.config.ws_heartbeat_interval,
            Tick::WsHeartbeat,
        );
        self.every(
            HTTP_HEARTBEAT_TIMER,
            self.config.http_heartbeat_interval,
            Tick::HttpHeartbeat,
        );
        self.every(
            TOKEN_CHECK_TIMER,
            self.config.token_check_interval,
            Tick::TokenCheck,
        );
        self.after(
            STABILITY_TIMER,
            self.config.stability_window,
            Tick::Stable(self.generation),
        );
        info!(generation = self.generation, "connected");
        self.publish();
        self.emit(ImEvent::Connected);
    }

    async fn on_close(&mut self, code: Option<u16>, reason: String) {
        let connection_duration = self.machine.connection_duration();
        self.stop_session_timers();
        if self.machine.is(ConnectionState::Closed) {
            return;
        }

        info!(?code, %reason, "disconnected");
        self.transition(ConnectionState::Disconnected, &reason);
        self.emit(ImEvent::Disconnected { code, reason });

        let env = EnvSignals {
            is_page_hidden: self.page_hidden,
            is_offline: self.offline,
            close_code: code,
            connection_duration,
        };
        let attempt = self.machine.reconnect_attempts().saturating_add(1);
        match self
            .reconnects
            .schedule_reconnect(&mut self.timers, attempt, ReconnectContext::new(env))
        {
            ScheduleOutcome::Scheduled { attempt, delay } => {
                self.transition(ConnectionState::Reconnecting, "reconnect scheduled");
                self.emit(ImEvent::ReconnectScheduled { attempt, delay });
            }
            ScheduleOutcome::GaveUp(GiveUpReason::Exhausted) => {
                error!(attempt, "reconnect attempts exhausted");
                self.emit(Notice::error(EXHAUSTED).into());
            }
            ScheduleOutcome::GaveUp(reason) => debug!(?reason, "reconnect deferred"),
            ScheduleOutcome::Kicked => self.kick().await,
        }
    }

    async fn kick(&mut self) {
        warn!("session kicked by another login");
        self.transition(ConnectionState::Closed, "duplicate login");
        self.reconnects.cancel(&mut self.timers);
        self.timers.clear_all();
        self.detach_link();
        self.publish();
        self.emit(Notice::error(KICKED).into());
        if self.events.send(ImEvent::Kicked).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }

    fn reconnect(&mut self, reason: &str) {
        if self.machine.is(ConnectionState::Closed) {
            debug!("session closed, reconnect ignored");
            return;
        }
        if self.link_ready() {
            return;
        }
        self.init_ws(reason);
    }

    fn on_visibility(&mut self, visible: bool) {
        if visible {
            if std::mem::replace(&mut self.page_hidden, false) {
                debug!("page visible");
                self.after(
                    VISIBILITY_TIMER,
                    self.config.visibility_grace,
                    Tick::VisibilityGrace,
                );
            }
        } else {
            debug!("page hidden");
            self.page_hidden = true;
            self.timers.clear(VISIBILITY_TIMER);
            self.reconnects.cancel(&mut self.timers);
        }
    }

    fn on_online(&mut self, online: bool) {
        if online {
            self.offline = false;
            info!("network online");
            if !self.link_pending() {
                self.reconnect("network online");
            }
        } else {
            self.offline = true;
            self.reconnects.cancel(&mut self.timers);
            warn!("network offline");
            self.emit(Notice::warning("Network connection lost.").into());
        }
    }

    fn teardown(&mut self) {
        self.reconnects.cancel(&mut self.timers);
        self.timers.clear_all();
        self.detach_link();
        self.machine.reset();
        self.publish();
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn on_tick(&mut self, tick: Tick) {
        match tick {
            Tick::WsHeartbeat => self.send_ws_heartbeat(),
            Tick::HttpHeartbeat => self.send_http_heartbeat(),
            Tick::TokenCheck => self.check_token(),
            Tick::Stable(generation) => {
                if generation == self.generation && self.machine.is(ConnectionState::Connected) {
                    self.machine.reset_reconnect_attempts();
                }
            }
            Tick::VisibilityGrace => {
                if !self.machine.is(ConnectionState::Closed) && !self.link_pending() {
                    self.machine
                        .taper_reconnect_attempts(self.config.visibility_taper);
                    self.init_ws("page visible");
                }
            }
        }
    }

    fn every(&mut self, name: &'static str, period: Duration, tick: Tick) {
        let tx = self.input_tx.clone();
        self.timers.set_interval(name, period, move || {
            let _ = tx.send(Input::Tick(tick));
        });
    }

    fn after(&mut self, name: &'static str, delay: Duration, tick: Tick) {
        let tx = self.input_tx.clone();
        self.timers.set_timeout(name, delay, move || {
            let _ = tx.send(Input::Tick(tick));
        });
    }

    fn stop_session_timers(&mut self) {
        for name in [
            WS_HEARTBEAT_TIMER,
            HTTP_HEARTBEAT_TIMER,
            TOKEN_CHECK_TIMER,
            STABILITY_TIMER,
        ] {
            self.timers.clear(name);
        }
    }

    // ── Heartbeats ──────────────────────────────────────────────────

    fn send_ws_heartbeat(&mut self) {
        if self.page_hidden || !self.link_ready() {
            return;
        }
        let payload = match HeartbeatMessage::now(self.config.user_id).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode heartbeat");
                return;
            }
        };
        let sent = self
            .link
            .as_ref()
            .is_some_and(|link| link.send(Frame::Text(payload)));
        if sent {
            trace!("ws heartbeat sent");
        } else {
            debug!("ws heartbeat not sent");
        }
    }

    fn send_http_heartbeat(&mut self) {
        if self.page_hidden || self.token.get().is_empty() {
            return;
        }
        let request_id = self.token.begin_request();
        let api = Arc::clone(&self.api);
        let sent_with = self.token.get().to_owned();
        let token = sent_with.clone();
        self.spawn_request(
            async move { api.heartbeat(&token).await },
            move |result| Input::HeartbeatAnswered {
                request_id,
                sent_with,
                result,
            },
        );
    }

    // ── Token renewal ───────────────────────────────────────────────

    fn check_token(&mut self) {
        if self.token_busy {
            debug!("token refresh already in flight");
            return;
        }
        self.token_busy = true;
        if self.token.get().is_empty() {
            self.regenerate_token();
            return;
        }
        let api = Arc::clone(&self.api);
        let token = self.token.get().to_owned();
        self.spawn_request(
            async move { api.check_expiry(&token).await },
            Input::ExpiryChecked,
        );
    }

    fn on_expiry_checked(&mut self, result: Result<i64>) {
        match result {
            Ok(minutes) if minutes <= self.config.token_renew_threshold_minutes => {
                info!(minutes, "token about to expire, renewing");
                self.renew_token();
            }
            Ok(minutes) => {
                self.token_busy = false;
                debug!(minutes, "token still valid");
            }
            Err(e) if e.is_rejection() => {
                warn!(error = %e, "token check rejected, regenerating");
                self.regenerate_token();
            }
            Err(e) => {
                self.token_busy = false;
                warn!(error = %e, "token check failed, retrying next period");
            }
        }
    }

    fn renew_token(&mut self) {
        let request_id = self.token.begin_request();
        let api = Arc::clone(&self.api);
        let old_token = self.token.get().to_owned();
        self.spawn_request(
            async move { api.renew(&old_token).await },
            move |result| Input::TokenFetched {
                request_id,
                source: TokenSource::Renew,
                result,
            },
        );
    }

    fn regenerate_token(&mut self) {
        let Some(user_token) = self
            .store
            .load(USER_TOKEN_KEY)
            .filter(|token| !token.is_empty())
        else {
            self.token_busy = false;
            error!(error = %ImError::MissingCredential, "cannot regenerate token");
            self.emit(Notice::error(LOGIN_AGAIN).into());
            return;
        };
        let request_id = self.token.begin_request();
        let api = Arc::clone(&self.api);
        self.spawn_request(
            async move { api.regenerate(&user_token).await },
            move |result| Input::TokenFetched {
                request_id,
                source: TokenSource::Regenerate,
                result,
            },
        );
    }

    fn on_token_fetched(&mut self, request_id: u64, source: TokenSource, result: Result<String>) {
        match result {
            Ok(token) => {
                self.token_busy = false;
                self.adopt_token(request_id, token);
            }
            Err(e) if source == TokenSource::Renew && e.is_rejection() => {
                warn!(error = %e, "token renewal rejected, regenerating");
                self.regenerate_token();
            }
            Err(e) if source == TokenSource::Regenerate => {
                self.token_busy = false;
                error!(error = %e, "token regeneration failed");
                self.emit(Notice::error(LOGIN_AGAIN).into());
            }
            Err(e) => {
                self.token_busy = false;
                warn!(error = %e, "token renewal failed, retrying next period");
            }
        }
    }

    fn adopt_token(&mut self, request_id: u64, token: String) {
        let adoption = self.token.adopt(request_id, token);
        self.on_adoption(request_id, adoption);
    }

    fn on_adoption(&mut self, request_id: u64, adoption: Adoption) {
        match adoption {
            Adoption::Adopted => {
                let token = self.token.get();
                self.shared.set_token(token);
                if let Err(e) = self.store.save(WS_TOKEN_KEY, token) {
                    warn!(error = %e, "failed to persist token");
                }
                info!(request_id, "token rotated");
                self.emit(ImEvent::TokenRotated);
            }
            Adoption::Unchanged => trace!(request_id, "token unchanged"),
            Adoption::Stale => {}
        }
    }

    /// Run a token API call off the loop. A call that outlives
    /// `api_timeout` answers [`ImError::Timeout`].
    fn spawn_request<T, Fut>(
        &self,
        request: Fut,
        into_input: impl FnOnce(Result<T>) -> Input + Send + 'static,
    ) where
        T: Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let tx = self.input_tx.clone();
        let deadline = self.config.api_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(deadline, request)
                .await
                .unwrap_or_else(|_| {
                    warn!(?deadline, "token api call timed out");
                    Err(ImError::Timeout)
                });
            let _ = tx.send(into_input(result));
        });
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Apply a transition and report it. Returns `false` if it was refused.
    fn transition(&mut self, to: ConnectionState, reason: &str) -> bool {
        let from = self.machine.current();
        if from == to && !from.can_transition_to(to) {
            return false;
        }
        if self.machine.transition(to, reason).is_err() {
            return false;
        }
        self.publish();
        self.emit(ImEvent::StateChanged {
            from,
            to,
            reason: reason.to_owned(),
        });
        true
    }

    fn detach_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.shared.set_link(None);
    }

    fn link_ready(&self) -> bool {
        self.link.as_ref().is_some_and(SocketLink::is_ready)
    }

    /// A link exists and has not closed: open, or still connecting.
    fn link_pending(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.ready_state() != ReadyState::Closed)
    }

    fn publish(&self) {
        self.shared
            .state
            .store(self.machine.current().as_u8(), Ordering::Release);
        self.shared
            .attempts
            .store(self.machine.reconnect_attempts(), Ordering::Release);
        self.shared
            .active_timers
            .store(self.timers.active_count(), Ordering::Release);
    }

    fn emit(&self, event: ImEvent) {
        emit_event(&self.events, event);
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the session loop.
fn emit_event(event_tx: &mpsc::Sender<ImEvent>, event: ImEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                "event channel full, dropping event: {:?}",
                std::mem::discriminant(&dropped)
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use crate::config::Endpoint;
    use crate::token::MemoryTokenStore;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    // ── Mocks ───────────────────────────────────────────────────────

    /// Transport that stays open until closed and records what was sent.
    struct IdleTransport {
        sent: Arc<StdMutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl Transport for IdleTransport {
        async fn send(&mut self, frame: Frame) -> std::result::Result<(), ImError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<Frame, ImError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), ImError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingConnector {
        urls: StdMutex<Vec<String>>,
        sent: Arc<StdMutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn connect(&self, url: &str) -> std::result::Result<Box<dyn Transport>, ImError> {
            self.urls.lock().unwrap().push(url.to_owned());
            Ok(Box::new(IdleTransport {
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    struct NoApi;

    #[async_trait]
    impl TokenApi for NoApi {
        async fn check_expiry(&self, _ws_token: &str) -> Result<i64> {
            Ok(60)
        }

        async fn renew(&self, _old_token: &str) -> Result<String> {
            Err(ImError::Timeout)
        }

        async fn regenerate(&self, _user_token: &str) -> Result<String> {
            Err(ImError::Timeout)
        }

        async fn heartbeat(&self, _ws_token: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn config() -> ImConfig {
        ImConfig::new(Endpoint::new("ws", "im.test").with_port(9000)).with_user_id(7)
    }

    async fn wait_for(events: &mut mpsc::Receiver<ImEvent>, want: &ImEvent) {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if &event == want {
                return;
            }
        }
    }

    fn session() -> (
        Session,
        mpsc::UnboundedReceiver<Input>,
        mpsc::Receiver<ImEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared::new("t".to_owned(), event_tx.clone()));
        let session = Session::new(
            config(),
            Arc::new(RecordingConnector::default()),
            Arc::new(NoApi),
            Arc::new(MemoryTokenStore::new()),
            shared,
            input_tx,
            event_tx,
        );
        (session, input_rx, event_rx)
    }

    // ── Token selection ─────────────────────────────────────────────

    #[test]
    fn initial_token_prefers_config_and_persists_it() {
        let store = MemoryTokenStore::with_entries([(WS_TOKEN_KEY, "stored")]);
        let token = initial_token(&config().with_initial_token("from-host"), &store);
        assert_eq!(token, "from-host");
        assert_eq!(store.load(WS_TOKEN_KEY).as_deref(), Some("from-host"));
    }

    #[test]
    fn initial_token_falls_back_to_store_then_empty() {
        let store = MemoryTokenStore::with_entries([(WS_TOKEN_KEY, "stored")]);
        assert_eq!(initial_token(&config(), &store), "stored");
        assert_eq!(initial_token(&config(), &MemoryTokenStore::new()), "");
    }

    // ── Session ─────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_connects_with_token_in_url() {
        let connector = Arc::new(RecordingConnector::default());
        let (mut client, mut events) = ImClient::start(
            config().with_initial_token("tok en"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(NoApi),
            Arc::new(MemoryTokenStore::new()),
        );

        wait_for(&mut events, &ImEvent::Connected).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.is_ready());
        assert_eq!(
            connector.urls.lock().unwrap().as_slice(),
            &["ws://im.test:9000/socket?token=tok+en".to_owned()]
        );

        client.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ws_heartbeat_carries_user_id() {
        let connector = Arc::new(RecordingConnector::default());
        let (mut client, mut events) = ImClient::start(
            config().with_initial_token("t"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(NoApi),
            Arc::new(MemoryTokenStore::new()),
        );
        wait_for(&mut events, &ImEvent::Connected).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let sent = connector.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let json: serde_json::Value = serde_json::from_str(sent[0].as_text().unwrap()).unwrap();
        assert_eq!(json["messageType"], 0);
        assert_eq!(json["content"], "heartbeat");
        assert_eq!(json["fromId"], 7);

        client.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_page_pauses_ws_heartbeat() {
        let connector = Arc::new(RecordingConnector::default());
        let (mut client, mut events) = ImClient::start(
            config().with_initial_token("t"),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(NoApi),
            Arc::new(MemoryTokenStore::new()),
        );
        wait_for(&mut events, &ImEvent::Connected).await;

        client.set_page_visible(false);
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(connector.sent.lock().unwrap().is_empty());

        client.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_timer_queued_behind_manual_reconnect_is_ignored() {
        let (mut session, _inputs, _events) = session();
        session.init_ws("initial connect");
        let first = session.generation;
        session
            .handle(Input::Link {
                generation: first,
                event: LinkEvent::Close {
                    code: None,
                    reason: "dropped".into(),
                },
            })
            .await;
        assert!(session.machine.is(ConnectionState::Reconnecting));

        // The host reconnects before the already-fired timer input is handled.
        session.handle(Input::Reconnect).await;
        let replacement = session.generation;
        assert_eq!(replacement, first + 1);
        session.handle(Input::ReconnectDue(1)).await;

        assert_eq!(session.generation, replacement);
        assert!(session.machine.is(ConnectionState::Connecting));
        session.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn send_msg_after_destroy_returns_false() {
        let (mut client, mut events) = ImClient::start(
            config().with_initial_token("t"),
            Arc::new(RecordingConnector::default()),
            Arc::new(NoApi),
            Arc::new(MemoryTokenStore::new()),
        );
        wait_for(&mut events, &ImEvent::Connected).await;
        assert!(client.send_msg("hi"));

        client.destroy().await;
        assert!(!client.send_msg("hi"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
