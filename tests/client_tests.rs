#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Integration-style session tests for `ImClient`.
//!
//! Uses the shared `MockConnector` and `MockTokenApi` from `tests/common` to
//! drive connections and token endpoints, with tokio's paused clock standing
//! in for the session timers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use imlink::token::{USER_TOKEN_KEY, WS_TOKEN_KEY};
use imlink::{
    ConnectionState, Endpoint, Frame, ImClient, ImConfig, ImEvent, MemoryTokenStore, NoticeLevel,
    ReconnectStrategyConfig, TokenStore,
};
use tokio::sync::mpsc;

use common::{drain, recv_until, MockConnector, MockTokenApi, Peer, Plan, Reply};

// ════════════════════════════════════════════════════════════════════
// Harness
// ════════════════════════════════════════════════════════════════════

struct Harness {
    client: ImClient,
    events: mpsc::Receiver<ImEvent>,
    connector: Arc<MockConnector>,
    peers: mpsc::UnboundedReceiver<Peer>,
    api: Arc<MockTokenApi>,
    store: Arc<MemoryTokenStore>,
}

impl Harness {
    async fn next_peer(&mut self) -> Peer {
        self.peers.recv().await.expect("connector dropped")
    }

    async fn until(&mut self, pred: impl Fn(&ImEvent) -> bool) -> (ImEvent, Vec<ImEvent>) {
        recv_until(&mut self.events, pred).await
    }

    async fn connected(&mut self) -> Peer {
        self.until(|e| matches!(e, ImEvent::Connected)).await;
        self.next_peer().await
    }
}

/// Three attempts, 1 s base, 8 s cap, no jitter.
fn config() -> ImConfig {
    ImConfig::new(Endpoint::new("ws", "im.test"))
        .with_user_id(7)
        .with_initial_token("t0")
        .with_reconnect(
            ReconnectStrategyConfig::new(
                3,
                Duration::from_secs(1),
                Duration::from_secs(8),
                2.0,
            )
            .with_jitter(0.0),
        )
}

fn start_with(config: ImConfig, store: MemoryTokenStore, plans: &[Plan]) -> Harness {
    let (connector, peers) = MockConnector::new();
    connector.script(plans.iter().copied());
    let api = MockTokenApi::new();
    let store = Arc::new(store);
    let (client, events) = ImClient::start(
        config,
        Arc::clone(&connector) as Arc<dyn imlink::Connector>,
        Arc::clone(&api) as Arc<dyn imlink::TokenApi>,
        Arc::clone(&store) as Arc<dyn TokenStore>,
    );
    Harness {
        client,
        events,
        connector,
        peers,
        api,
        store,
    }
}

fn start(plans: &[Plan]) -> Harness {
    start_with(config(), MemoryTokenStore::new(), plans)
}

fn is_persistent_error(event: &ImEvent) -> bool {
    matches!(event, ImEvent::Notice(n) if n.level == NoticeLevel::Error && n.persistent)
}

// ════════════════════════════════════════════════════════════════════
// Connection lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn connect_reports_state_changes_and_uses_token() {
    let mut h = start(&[]);

    let (_, before) = h.until(|e| matches!(e, ImEvent::Connected)).await;
    let changes: Vec<_> = before
        .iter()
        .filter_map(|e| match e {
            ImEvent::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        changes,
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
        ]
    );

    let peer = h.next_peer().await;
    assert_eq!(peer.url, "ws://im.test/socket?token=t0");
    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert!(h.client.is_ready());
    assert_eq!(h.client.token(), "t0");
    assert_eq!(h.store.load(WS_TOKEN_KEY).as_deref(), Some("t0"));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn messages_flow_both_ways() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    assert!(h.client.send_msg("hello"));
    assert_eq!(peer.next_sent().await, Some(Frame::text("hello")));

    peer.push(Frame::text("welcome"));
    let (event, _) = h.until(|e| matches!(e, ImEvent::Message(_))).await;
    assert_eq!(event, ImEvent::Message(Frame::text("welcome")));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn ws_heartbeat_reaches_peer() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    let frame = peer.next_sent().await.expect("heartbeat");
    let json: serde_json::Value = serde_json::from_str(frame.as_text().unwrap()).unwrap();
    assert_eq!(json["messageType"], 0);
    assert_eq!(json["content"], "heartbeat");
    assert_eq!(json["fromId"], 7);
    assert!(json["timestamp"].as_u64().is_some());

    h.client.destroy().await;
}

// ════════════════════════════════════════════════════════════════════
// Reconnect policy
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn backoff_then_stable_connection_resets_attempts() {
    let mut h = start(&[Plan::Refuse, Plan::Refuse]);

    let (_, before) = h.until(|e| matches!(e, ImEvent::Connected)).await;
    let scheduled: Vec<_> = before
        .iter()
        .filter_map(|e| match e {
            ImEvent::ReconnectScheduled { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        scheduled,
        vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
    );
    assert_eq!(h.connector.attempts(), 3);
    assert_eq!(h.client.reconnect_attempts(), 2);

    // Past the 5 s stability window.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert_eq!(h.client.reconnect_attempts(), 0);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_is_reconnected() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    peer.drop_connection();
    let (event, _) = h
        .until(|e| matches!(e, ImEvent::Disconnected { .. }))
        .await;
    assert_eq!(
        event,
        ImEvent::Disconnected {
            code: None,
            reason: "connection dropped".into()
        }
    );

    h.connected().await;
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.client.reconnect_attempts(), 1);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_notify_and_retry_now_recovers() {
    let mut h = start(&[]);
    h.connector.set_default(Plan::Refuse);

    let (_, before) = h.until(is_persistent_error).await;
    let attempts: Vec<u32> = before
        .iter()
        .filter_map(|e| match e {
            ImEvent::ReconnectScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.connector.attempts(), 4);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    // Nothing else happens on its own.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 4);

    h.connector.set_default(Plan::Accept);
    h.client.retry_now();
    h.connected().await;
    assert_eq!(h.client.reconnect_attempts(), 0);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn send_on_closed_link_requests_reconnect() {
    let mut h = start(&[]);
    h.connector.set_default(Plan::Refuse);
    h.until(is_persistent_error).await;

    h.connector.set_default(Plan::Accept);
    assert!(!h.client.send_msg("hello"));
    h.connected().await;
    assert!(h.client.send_msg("hello"));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn send_before_ready_returns_false_with_notice() {
    let mut h = start(&[Plan::Hang]);

    assert!(!h.client.send_msg("too early"));
    let (event, _) = h.until(|e| matches!(e, ImEvent::Notice(_))).await;
    assert!(matches!(event, ImEvent::Notice(n) if n.level == NoticeLevel::Warning));
    assert!(!h.client.is_ready());

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn superseded_link_does_not_disturb_new_one() {
    let mut h = start(&[Plan::Hang]);
    while h.connector.attempts() == 0 {
        tokio::task::yield_now().await;
    }

    // The first link is still connecting; replace it.
    h.client.retry_now();
    let (_, before) = h.until(|e| matches!(e, ImEvent::Connected)).await;
    assert!(!before
        .iter()
        .any(|e| matches!(e, ImEvent::Disconnected { .. })));
    assert_eq!(h.connector.attempts(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, ImEvent::Disconnected { .. })));
    assert_eq!(h.client.state(), ConnectionState::Connected);

    h.client.destroy().await;
}

// ════════════════════════════════════════════════════════════════════
// Kick
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn kick_is_terminal() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    peer.close_with(4001, "duplicate login");
    let (_, before) = h.until(|e| matches!(e, ImEvent::Kicked)).await;
    assert!(before.iter().any(is_persistent_error));
    assert_eq!(h.client.state(), ConnectionState::Closed);
    assert_eq!(h.client.active_timers(), 0);

    h.client.reconnect();
    h.client.retry_now();
    h.client.set_online(true);
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.client.state(), ConnectionState::Closed);

    // The transport is never touched again.
    assert!(!h.client.send_msg("hello"));
    assert_eq!(peer.next_sent().await, None);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn policy_violation_close_is_a_kick() {
    let mut h = start(&[]);
    let peer = h.connected().await;

    peer.close_with(1008, "policy");
    h.until(|e| matches!(e, ImEvent::Kicked)).await;
    assert_eq!(h.client.state(), ConnectionState::Closed);

    h.client.destroy().await;
}

// ════════════════════════════════════════════════════════════════════
// Environment signals
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn offline_suppresses_reconnect_until_online() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    h.client.set_online(false);
    peer.drop_connection();
    h.until(|e| matches!(e, ImEvent::Disconnected { .. })).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    h.client.set_online(true);
    h.connected().await;
    assert_eq!(h.connector.attempts(), 2);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn hidden_page_defers_reconnect_until_visible() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    h.client.set_page_visible(false);
    peer.drop_connection();
    h.until(|e| matches!(e, ImEvent::Disconnected { .. })).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts(), 1);

    h.client.set_page_visible(true);
    h.connected().await;
    assert_eq!(h.connector.attempts(), 2);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn connect_in_progress_survives_online_and_visible() {
    let mut h = start(&[Plan::Hang]);
    while h.connector.attempts() == 0 {
        tokio::task::yield_now().await;
    }

    h.client.set_online(false);
    h.client.set_online(true);
    h.client.set_page_visible(false);
    h.client.set_page_visible(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.client.state(), ConnectionState::Connecting);
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, ImEvent::Disconnected { .. })));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn hiding_page_cancels_pending_reconnect() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;

    peer.drop_connection();
    h.until(|e| matches!(e, ImEvent::ReconnectScheduled { .. }))
        .await;
    h.client.set_page_visible(false);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.client.state(), ConnectionState::Reconnecting);

    h.client.destroy().await;
}

// ════════════════════════════════════════════════════════════════════
// Token renewal
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn token_renewed_when_close_to_expiry() {
    let mut h = start(&[]);
    h.api.on_expiry(Reply::Ok(5));
    h.api.on_renew(Reply::Ok("t1".into()));
    let mut peer = h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    assert_eq!(h.client.token(), "t1");
    assert_eq!(h.store.load(WS_TOKEN_KEY).as_deref(), Some("t1"));
    let calls = h.api.calls();
    assert!(calls.contains(&"check:t0".to_owned()));
    assert!(calls.contains(&"renew:t0".to_owned()));

    // The next connection uses the new token.
    peer.drop_connection();
    let peer = {
        h.until(|e| matches!(e, ImEvent::Connected)).await;
        h.next_peer().await
    };
    assert_eq!(peer.url, "ws://im.test/socket?token=t1");

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn token_with_time_left_is_kept() {
    let mut h = start(&[]);
    h.api.on_expiry(Reply::Ok(30));
    h.connected().await;

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.api.calls().iter().filter(|c| c.starts_with("check:")).count(), 1);
    assert!(!h.api.calls().iter().any(|c| c.starts_with("renew:")));
    assert_eq!(h.client.token(), "t0");

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_renewal_falls_back_to_regeneration() {
    let store = MemoryTokenStore::with_entries([(USER_TOKEN_KEY, "user-1")]);
    let mut h = start_with(config(), store, &[]);
    h.api.on_expiry(Reply::Ok(3));
    h.api.on_renew(Reply::Reject);
    h.api.on_regenerate(Reply::Ok("t2".into()));
    h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    assert_eq!(h.client.token(), "t2");
    assert!(h.api.calls().contains(&"regenerate:user-1".to_owned()));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn missing_user_credential_asks_to_log_in_again() {
    let mut h = start(&[]);
    h.api.on_expiry(Reply::Reject);
    h.connected().await;

    let (event, _) = h.until(is_persistent_error).await;
    let ImEvent::Notice(notice) = event else {
        panic!("expected notice");
    };
    assert!(notice.text.contains("log in"));
    assert!(!h.api.calls().iter().any(|c| c.starts_with("regenerate:")));
    assert_eq!(h.client.token(), "t0");

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_renewal_retries_next_period() {
    let mut h = start(&[]);
    h.api.on_expiry(Reply::Ok(2));
    h.api.on_expiry(Reply::Ok(1));
    h.api.on_renew(Reply::Unreachable);
    h.api.on_renew(Reply::Ok("t3".into()));
    h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    assert_eq!(h.client.token(), "t3");
    assert_eq!(
        h.api
            .calls()
            .iter()
            .filter(|c| c.starts_with("renew:"))
            .count(),
        2
    );

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn http_heartbeat_rotates_token() {
    let mut h = start(&[]);
    h.api.on_heartbeat(Reply::Ok(Some("t9".into())));
    h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    assert_eq!(h.client.token(), "t9");
    assert_eq!(h.api.calls().first().map(String::as_str), Some("heartbeat:t0"));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn late_token_response_is_discarded() {
    let config = config()
        .with_token_check_interval(Duration::from_secs(100))
        .with_http_heartbeat_interval(Duration::from_secs(101));
    let mut h = start_with(config, MemoryTokenStore::new(), &[]);
    h.api.on_expiry(Reply::Ok(1));
    // Issued at 100 s, answers at 110 s.
    h.api
        .on_renew(Reply::Delayed(Duration::from_secs(10), "from-renew".into()));
    // Issued at 101 s, answers at once.
    h.api.on_heartbeat(Reply::Ok(Some("from-heartbeat".into())));
    h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.client.token(), "from-heartbeat");
    assert!(h.api.calls().contains(&"renew:t0".to_owned()));
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, ImEvent::TokenRotated)));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_echo_of_old_token_keeps_renewed_one() {
    let config = config()
        .with_token_check_interval(Duration::from_secs(100))
        .with_http_heartbeat_interval(Duration::from_secs(101));
    let mut h = start_with(config, MemoryTokenStore::new(), &[]);
    h.api.on_expiry(Reply::Ok(1));
    // Issued at 100 s, answers at 110 s.
    h.api
        .on_renew(Reply::Delayed(Duration::from_secs(10), "t1".into()));
    // Issued at 101 s with the old token, echoes it at 116 s.
    h.api.on_heartbeat(Reply::Delayed(
        Duration::from_secs(15),
        Some("t0".into()),
    ));
    h.connected().await;

    h.until(|e| matches!(e, ImEvent::TokenRotated)).await;
    assert_eq!(h.client.token(), "t1");
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.api.calls().contains(&"heartbeat:t0".to_owned()));
    assert_eq!(h.client.token(), "t1");
    assert_eq!(h.store.load(WS_TOKEN_KEY).as_deref(), Some("t1"));
    assert!(!drain(&mut h.events)
        .iter()
        .any(|e| matches!(e, ImEvent::TokenRotated)));

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_token_check_does_not_stop_later_checks() {
    let mut h = start(&[]);
    h.api.on_expiry(Reply::Hang);
    h.connected().await;

    // Checks at 300 s, 600 s, ... 3600 s; the first never answers.
    tokio::time::sleep(Duration::from_secs(3650)).await;
    let checks = h
        .api
        .calls()
        .iter()
        .filter(|c| c.starts_with("check:"))
        .count();
    assert_eq!(checks, 12);

    h.client.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn stored_token_is_used_when_none_is_given() {
    let store = MemoryTokenStore::with_entries([(WS_TOKEN_KEY, "stored")]);
    let config = ImConfig::new(Endpoint::new("wss", "im.test").with_port(8443));
    let mut h = start_with(config, store, &[]);

    let peer = h.connected().await;
    assert_eq!(peer.url, "wss://im.test:8443/socket?token=stored");

    h.client.destroy().await;
}

// ════════════════════════════════════════════════════════════════════
// Cleanup
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn destroy_twice_leaves_no_timers() {
    let mut h = start(&[]);
    let mut peer = h.connected().await;
    assert_eq!(h.client.active_timers(), 4);

    h.client.destroy().await;
    assert_eq!(h.client.active_timers(), 0);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    h.client.destroy().await;
    assert_eq!(h.client.active_timers(), 0);

    // The socket was closed and nothing reconnects.
    assert_eq!(peer.next_sent().await, None);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);

    // The event stream ends.
    drain(&mut h.events);
    assert!(h.events.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn destroy_during_backoff_cancels_reconnect() {
    let mut h = start(&[Plan::Refuse]);
    h.until(|e| matches!(e, ImEvent::ReconnectScheduled { .. }))
        .await;

    h.client.destroy().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.client.active_timers(), 0);
}
