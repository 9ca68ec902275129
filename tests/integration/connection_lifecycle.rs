// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for the realtime connection lifecycle as seen through
//! [`SyncEngine`].
//!
//! These tests validate:
//! - Frames queued while disconnected are flushed ahead of newer sends
//! - Token rejection or session expiry during backoff stops reconnection
//! - Backoff delays grow between failed attempts
//! - Exhausted attempts are surfaced while reconnection continues
//! - Every reconnect triggers a chat list resync
//!
//! All tests run on paused tokio time, so backoff sleeps finish instantly.

use std::time::Duration;

use kirpich::backend::memory::InMemoryBackend;
use kirpich::config::{ClientConfig, ReconnectConfig};
use kirpich::connection::ConnectionState;
use kirpich::engine::SyncEngine;
use kirpich::event::SyncEvent;
use kirpich::state::{DeliveryState, FailureReason};
use kirpich::transport::loopback::{ConnectOutcome, LoopbackConnector, LoopbackServer};
use kirpich_proto::frame::ClientFrame;
use kirpich_proto::ids::ChatId;
use kirpich_proto::message::ChatSummary;
use tokio::sync::mpsc;

type Engine = SyncEngine<LoopbackConnector, InMemoryBackend>;

struct Harness {
    engine: Engine,
    events: mpsc::Receiver<SyncEvent>,
    connector: LoopbackConnector,
    server: LoopbackServer,
    backend: InMemoryBackend,
}

/// Deterministic backoff: 500ms doubling, no jitter.
fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.reconnect = ReconnectConfig {
        jitter: 0.0,
        ..ReconnectConfig::default()
    };
    config
}

async fn logged_in(config: &ClientConfig) -> Harness {
    let backend = InMemoryBackend::new()
        .with_chats(vec![ChatSummary::new(ChatId::new("c1"), "General")]);
    let (connector, server) = LoopbackConnector::new();
    let (engine, events) = SyncEngine::new(connector.clone(), backend.clone(), "loop://rt", config);
    engine.login("me@kirpich.app", "pw").await.unwrap();
    Harness {
        engine,
        events,
        connector,
        server,
        backend,
    }
}

async fn next_matching(
    rx: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_state(rx: &mut mpsc::Receiver<SyncEvent>, state: ConnectionState) {
    next_matching(rx, |e| matches!(e, SyncEvent::ConnectionChanged { to, .. } if *to == state)).await;
}

fn message_content(frame: Option<ClientFrame>) -> String {
    match frame {
        Some(ClientFrame::Message(outgoing)) => outgoing.content,
        other => panic!("expected message frame, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn queued_send_flushes_before_new_sends_after_reconnect() {
    let mut h = logged_in(&config()).await;
    h.engine.start().unwrap();
    let first = h.server.accept().await.unwrap();
    wait_for_state(&mut h.events, ConnectionState::Connected).await;

    // Lose the link and keep the next attempts failing.
    h.connector
        .script(std::iter::repeat_n(ConnectOutcome::Fail, 3));
    drop(first);
    next_matching(&mut h.events, |e| matches!(e, SyncEvent::ReconnectScheduled { .. })).await;

    let queued = h.engine.send_message(ChatId::new("c1"), "queued").unwrap();
    assert_eq!(h.engine.connection().queued(), 1);

    // Disconnect mid-cycle; the outbox survives.
    h.engine.disconnect().await;
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
    assert_eq!(h.engine.connection().queued(), 1);

    // The remaining scripted failures play out before the link comes back.
    h.engine.start().unwrap();
    let mut second = h.server.accept().await.unwrap();
    h.engine.send_message(ChatId::new("c1"), "fresh").unwrap();

    assert_eq!(message_content(second.recv_non_ping().await), "queued");
    assert_eq!(message_content(second.recv_non_ping().await), "fresh");

    let entries = h.engine.messages().entries(&ChatId::new("c1"));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].client_temp_id, Some(queued.client_temp_id));
}

#[tokio::test(start_paused = true)]
async fn rejected_token_while_reconnecting_stops_for_good() {
    let mut h = logged_in(&config()).await;
    h.engine.start().unwrap();
    let first = h.server.accept().await.unwrap();
    wait_for_state(&mut h.events, ConnectionState::Connected).await;

    h.connector
        .script([ConnectOutcome::Fail, ConnectOutcome::Reject("token revoked".into())]);
    drop(first);

    let event = next_matching(&mut h.events, |e| matches!(e, SyncEvent::AuthExpired { .. })).await;
    assert_eq!(
        event,
        SyncEvent::AuthExpired {
            reason: "token revoked".into()
        }
    );
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);
    assert!(!h.engine.session().is_active());

    let attempts = h.connector.attempts();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts(), attempts, "no attempts after expiry");
}

#[tokio::test(start_paused = true)]
async fn session_expiring_during_backoff_halts_reconnection() {
    let mut h = logged_in(&config()).await;
    h.engine.start().unwrap();
    let first = h.server.accept().await.unwrap();
    wait_for_state(&mut h.events, ConnectionState::Connected).await;

    h.connector
        .script(std::iter::repeat_n(ConnectOutcome::Fail, 100));
    drop(first);
    wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;

    h.engine.session().expire("signed in elsewhere");
    next_matching(&mut h.events, |e| matches!(e, SyncEvent::AuthExpired { .. })).await;
    assert_eq!(h.engine.state(), ConnectionState::Disconnected);

    let attempts = h.connector.attempts();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts(), attempts);
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_double_between_failures() {
    let mut h = logged_in(&config()).await;
    h.connector
        .script(std::iter::repeat_n(ConnectOutcome::Fail, 4));
    h.engine.start().unwrap();

    let mut delays = Vec::new();
    while delays.len() < 4 {
        if let SyncEvent::ReconnectScheduled { delay, .. } =
            next_matching(&mut h.events, |e| matches!(e, SyncEvent::ReconnectScheduled { .. })).await
        {
            delays.push(delay);
        }
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]
    );

    let _end = h.server.accept().await.unwrap();
    wait_for_state(&mut h.events, ConnectionState::Connected).await;
    assert_eq!(h.connector.attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_surface_connection_lost_and_keep_retrying() {
    let mut config = config();
    config.connection.reconnect.max_attempts = Some(2);
    let mut h = logged_in(&config).await;
    h.connector
        .script(std::iter::repeat_n(ConnectOutcome::Fail, 5));
    h.engine.start().unwrap();

    let event = next_matching(&mut h.events, |e| matches!(e, SyncEvent::ConnectionLost { .. })).await;
    assert_eq!(event, SyncEvent::ConnectionLost { attempts: 2 });

    let _end = h.server.accept().await.unwrap();
    wait_for_state(&mut h.events, ConnectionState::Connected).await;
    assert_eq!(h.connector.attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn every_reconnect_resyncs_the_chat_list() {
    let mut h = logged_in(&config()).await;
    h.engine.start().unwrap();
    let first = h.server.accept().await.unwrap();
    next_matching(&mut h.events, |e| matches!(e, SyncEvent::ChatsReplaced { .. })).await;
    assert_eq!(h.backend.get_chats_calls(), 1);

    // The server-side list changes while the link is down.
    h.backend
        .set_chats(vec![ChatSummary::new(ChatId::new("c2"), "Ops")]);
    drop(first);
    let _second = h.server.accept().await.unwrap();

    let event = next_matching(&mut h.events, |e| matches!(e, SyncEvent::ChatsReplaced { .. })).await;
    assert_eq!(event, SyncEvent::ChatsReplaced { count: 1 });
    assert_eq!(h.backend.get_chats_calls(), 2);
    assert!(h.engine.chats().get(&ChatId::new("c1")).is_none());
    assert_eq!(h.engine.chats().get(&ChatId::new("c2")).unwrap().title, "Ops");
}

#[tokio::test(start_paused = true)]
async fn queued_send_times_out_when_link_never_returns() {
    let mut h = logged_in(&config()).await;
    h.connector
        .script(std::iter::repeat_n(ConnectOutcome::Fail, 1_000));
    h.engine.start().unwrap();
    wait_for_state(&mut h.events, ConnectionState::Reconnecting).await;

    let handle = h.engine.send_message(ChatId::new("c1"), "hello?").unwrap();
    let event = next_matching(&mut h.events, |e| matches!(e, SyncEvent::MessageFailed { .. })).await;
    assert_eq!(
        event,
        SyncEvent::MessageFailed {
            chat_id: ChatId::new("c1"),
            client_temp_id: handle.client_temp_id,
            reason: FailureReason::Timeout,
        }
    );
    let entries = h.engine.messages().entries(&ChatId::new("c1"));
    assert_eq!(entries[0].delivery, DeliveryState::Failed(FailureReason::Timeout));
}
