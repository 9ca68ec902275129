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

//! Integration tests against an in-process `kirpich-backend` over real
//! WebSocket and HTTP.
//!
//! These tests validate:
//! - Two clients exchange messages, read receipts and presence
//! - The request send route and media uploads go through HTTP
//! - A severed TCP link reconnects, flushes queued sends and resyncs
//! - Server-side token revocation ends the session
//! - Bad credentials and stale tokens are auth failures
//!
//! ## Disconnect simulation
//!
//! Aborting the server does not close sockets already handed to connection
//! tasks, so a **TCP proxy** sits between the client and the backend.
//! Severing aborts every proxied connection while the proxy keeps
//! accepting, so the client sees a dropped link and can reconnect.

use std::sync::Arc;
use std::time::Duration;

use kirpich::backend::http::HttpBackend;
use kirpich::backend::{Backend, BackendError};
use kirpich::config::{ClientConfig, ReconnectConfig, SendRoute};
use kirpich::connection::ConnectionState;
use kirpich::engine::{EngineError, SyncEngine};
use kirpich::event::SyncEvent;
use kirpich::state::DeliveryState;
use kirpich::transport::ws::WsConnector;
use kirpich_backend::server::{self, BackendState};
use kirpich_proto::ids::{ChatId, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type Engine = SyncEngine<WsConnector, HttpBackend>;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards TCP connections to the backend. [`sever`](Self::sever) aborts
/// every live connection; new ones are still accepted.
struct TcpProxy {
    addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    async fn new(backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let handles = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            loop {
                let Ok((mut client_stream, _)) = listener.accept().await else {
                    break;
                };
                let backend = backend.clone();
                let conn = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                handles.lock().push(conn);
            }
        });

        Self {
            addr,
            accept_handle,
            conn_handles,
        }
    }

    /// Drops every proxied connection.
    fn sever(&self) {
        for handle in self.conn_handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.accept_handle.abort();
        self.sever();
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn start_backend() -> (String, Arc<BackendState>) {
    let state = Arc::new(BackendState::new());
    state
        .store
        .create_chat(ChatId::new("general"), "General")
        .await;
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start backend");
    (addr.to_string(), state)
}

/// Fast, jitter-free reconnects.
fn fast_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.connection.reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
        jitter: 0.0,
        ..ReconnectConfig::default()
    };
    config
}

fn client(addr: &str, config: &ClientConfig) -> (Engine, mpsc::Receiver<SyncEvent>) {
    let backend = HttpBackend::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    SyncEngine::new(WsConnector::new(), backend, format!("ws://{addr}/ws"), config)
}

/// Logs in, starts, and waits until the first chat list arrives.
async fn online(
    addr: &str,
    email: &str,
    config: &ClientConfig,
) -> (Engine, mpsc::Receiver<SyncEvent>) {
    let (engine, mut events) = client(addr, config);
    engine.login(email, "pw").await.unwrap();
    engine.start().unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::ChatsReplaced { .. })).await;
    (engine, events)
}

async fn next_matching(
    rx: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
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

/// Waits until the backend has registered `count` realtime connections.
async fn wait_for_connections(state: &BackendState, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while state.connection_count().await != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backend never saw the expected connections");
}

fn general() -> ChatId {
    ChatId::new("general")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn two_clients_exchange_messages_and_receipts() {
    let (addr, state) = start_backend().await;
    let (alice, mut alice_events) = online(&addr, "alice@kirpich.app", &fast_config()).await;
    let (bob, mut bob_events) = online(&addr, "bob@kirpich.app", &fast_config()).await;
    wait_for_connections(&state, 2).await;

    assert_eq!(bob.chats().get(&general()).unwrap().title, "General");

    let handle = alice.send_message(general(), "hello bob").unwrap();
    next_matching(&mut alice_events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    let entries = alice.messages().entries(&general());
    assert_eq!(entries.len(), 1, "own broadcast must not duplicate the entry");
    assert_eq!(entries[0].client_temp_id, Some(handle.client_temp_id));
    assert_eq!(entries[0].delivery, DeliveryState::Sent);

    let SyncEvent::MessageReceived { message } =
        next_matching(&mut bob_events, |e| matches!(e, SyncEvent::MessageReceived { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(message.content, "hello bob");
    assert_eq!(message.sender_id, UserId::new("alice@kirpich.app"));
    assert_eq!(Some(message.id.clone()), entries[0].id);
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::UnreadChanged { unread: 1, .. })).await;
    assert_eq!(bob.chats().unread(&general()), 1);

    bob.mark_read(&general());
    assert_eq!(bob.chats().unread(&general()), 0);
    let event = next_matching(&mut alice_events, |e| matches!(e, SyncEvent::ReadBy { .. })).await;
    assert_eq!(
        event,
        SyncEvent::ReadBy {
            chat_id: general(),
            user_id: UserId::new("bob@kirpich.app"),
            message_id: Some(message.id),
        }
    );

    // The server agrees after a resync.
    bob.resync().await.unwrap();
    assert_eq!(bob.chats().unread(&general()), 0);
}

#[tokio::test]
async fn presence_and_typing_reach_the_other_client() {
    let (addr, state) = start_backend().await;
    let (alice, mut alice_events) = online(&addr, "alice@kirpich.app", &fast_config()).await;
    wait_for_connections(&state, 1).await;
    let (bob, mut bob_events) = online(&addr, "bob@kirpich.app", &fast_config()).await;

    let event = next_matching(&mut alice_events, |e| matches!(e, SyncEvent::Presence { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Presence {
            user_id: UserId::new("bob@kirpich.app"),
            is_online: true,
            last_seen: None,
        }
    );

    wait_for_connections(&state, 2).await;
    alice.set_typing(&general(), true);
    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::Typing { .. })).await;
    assert_eq!(
        event,
        SyncEvent::Typing {
            chat_id: general(),
            user_id: UserId::new("alice@kirpich.app"),
            is_typing: true,
        }
    );

    bob.logout().await;
    let event = next_matching(&mut alice_events, |e| {
        matches!(e, SyncEvent::Presence { is_online: false, .. })
    })
    .await;
    assert!(matches!(event, SyncEvent::Presence { last_seen: Some(_), .. }));
}

#[tokio::test]
async fn request_route_sends_over_http() {
    let (addr, state) = start_backend().await;
    let mut config = fast_config();
    config.outbound.route = SendRoute::Request;
    let (alice, mut alice_events) = online(&addr, "alice@kirpich.app", &config).await;
    let (_bob, mut bob_events) = online(&addr, "bob@kirpich.app", &fast_config()).await;
    wait_for_connections(&state, 2).await;

    alice.send_message(general(), "over rest").unwrap();
    next_matching(&mut alice_events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    let SyncEvent::MessageReceived { message } =
        next_matching(&mut bob_events, |e| matches!(e, SyncEvent::MessageReceived { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(message.content, "over rest");
    assert_eq!(state.store.messages(&general()).await.len(), 1);
}

#[tokio::test]
async fn uploaded_media_is_linked_and_served() {
    let (addr, state) = start_backend().await;
    let (alice, mut alice_events) = online(&addr, "alice@kirpich.app", &fast_config()).await;
    wait_for_connections(&state, 1).await;

    let bytes = vec![0x89, b'P', b'N', b'G', 1, 2, 3];
    alice
        .upload_media(general(), "cat.png", bytes.clone())
        .await
        .unwrap();
    next_matching(&mut alice_events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;

    let entries = alice.messages().entries(&general());
    let url = entries[0].content.clone();
    assert_eq!(url, format!("http://{addr}/media/general/cat.png"));
    let served = reqwest::get(&url).await.unwrap().bytes().await.unwrap();
    assert_eq!(served.as_ref(), bytes.as_slice());
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let (addr, _state) = start_backend().await;
    let (alice, _events) = online(&addr, "alice@kirpich.app", &fast_config()).await;

    let err = alice
        .upload_media(general(), "empty.png", Vec::new())
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("File payload is empty"),
        "unexpected error: {err}"
    );
    assert_eq!(alice.messages().len(&general()), 0);
}

#[tokio::test]
async fn notifications_reach_the_backend() {
    let (addr, state) = start_backend().await;
    let mut config = fast_config();
    config.sync.notifications = true;
    let (alice, _alice_events) = online(&addr, "alice@kirpich.app", &fast_config()).await;
    let (_bob, mut bob_events) = online(&addr, "bob@kirpich.app", &config).await;
    wait_for_connections(&state, 2).await;

    alice.send_message(general(), "lunch?").unwrap();
    next_matching(&mut bob_events, |e| matches!(e, SyncEvent::UnreadChanged { .. })).await;

    let notifications = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let sent = state.notifications().await;
            if !sent.is_empty() {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let (user, request) = &notifications[0];
    assert_eq!(user, &UserId::new("bob@kirpich.app"));
    assert_eq!(request.title, "General");
    assert_eq!(request.body, "alice@kirpich.app: lunch?");
}

#[tokio::test]
async fn severed_link_reconnects_flushes_and_resyncs() {
    let (backend_addr, state) = start_backend().await;
    let proxy = TcpProxy::new(&backend_addr).await;

    // Realtime goes through the proxy; REST talks to the backend directly.
    let http = HttpBackend::new(&format!("http://{backend_addr}"), Duration::from_secs(5)).unwrap();
    let (alice, mut events) = SyncEngine::new(
        WsConnector::new(),
        http,
        format!("ws://{}/ws", proxy.addr),
        &fast_config(),
    );
    alice.login("alice@kirpich.app", "pw").await.unwrap();
    alice.start().unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::ChatsReplaced { .. })).await;
    wait_for_connections(&state, 1).await;

    // A chat created while connected only shows up after the resync.
    state.store.create_chat(ChatId::new("ops"), "Ops").await;
    proxy.sever();
    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::ConnectionChanged { to: ConnectionState::Reconnecting, .. })
    })
    .await;

    alice.send_message(general(), "sent during outage").unwrap();

    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::ConnectionChanged { to: ConnectionState::Connected, .. })
    })
    .await;

    // The resync and the outbox flush race each other.
    let (mut confirmed, mut resynced) = (false, None);
    while !confirmed || resynced.is_none() {
        match next_matching(&mut events, |e| {
            matches!(
                e,
                SyncEvent::MessageConfirmed { .. } | SyncEvent::ChatsReplaced { .. }
            )
        })
        .await
        {
            SyncEvent::ChatsReplaced { count } => resynced = Some(count),
            _ => confirmed = true,
        }
    }
    assert_eq!(resynced, Some(2));
    assert!(alice.chats().get(&ChatId::new("ops")).is_some());

    let stored = state.store.messages(&general()).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "sent during outage");
}

#[tokio::test]
async fn revoked_session_gets_auth_expired() {
    let (addr, state) = start_backend().await;
    let (alice, mut events) = online(&addr, "alice@kirpich.app", &fast_config()).await;
    wait_for_connections(&state, 1).await;

    assert_eq!(state.revoke_all_sessions("password changed").await, 1);
    next_matching(&mut events, |e| matches!(e, SyncEvent::AuthExpired { .. })).await;
    assert!(!alice.session().is_active());
    assert_eq!(alice.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn stale_token_is_refused_at_handshake() {
    let (addr, state) = start_backend().await;
    let (alice, mut events) = client(&addr, &fast_config());
    alice.login("alice@kirpich.app", "pw").await.unwrap();
    state.store.revoke_all().await;

    alice.start().unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::AuthExpired { .. })).await;
    assert!(!alice.session().is_active());
    assert_eq!(state.connection_count().await, 0);
}

#[tokio::test]
async fn bad_credentials_fail_login() {
    let (addr, _state) = start_backend().await;
    let (alice, _events) = client(&addr, &fast_config());
    let err = alice.login("alice@kirpich.app", "").await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(BackendError::Auth(_))));

    let http = HttpBackend::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    let err = http.get_chats("forged").await.unwrap_err();
    assert!(err.is_auth());
}
