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

//! End-to-end sync scenarios over the loopback transport and the in-memory
//! backend.
//!
//! The test plays the server through a [`ServerEnd`]: it reads the frames
//! the engine sends and pushes the frames a real server would push back.
//!
//! These tests validate:
//! - Incoming messages update the chat list and unread counts exactly once
//! - Acknowledgements turn optimistic entries into sent ones in place
//! - Rejections, timeouts, retries and late acknowledgements
//! - Read receipts, typing and presence handling
//! - Malformed frames are reported without stopping the router
//! - The request send route, media uploads and notifications

use std::time::Duration;

use kirpich::backend::memory::{InMemoryBackend, Notification};
use kirpich::config::{ClientConfig, SendRoute};
use kirpich::connection::ConnectionState;
use kirpich::engine::SyncEngine;
use kirpich::event::SyncEvent;
use kirpich::state::{DeliveryState, FailureReason};
use kirpich::transport::loopback::{ConnectOutcome, LoopbackConnector, ServerEnd};
use kirpich_proto::frame::{
    ClientFrame, OutgoingMessage, PresenceUpdate, ReadReceipt, SendAck, ServerError, ServerFrame,
    TypingIndicator,
};
use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use kirpich_proto::message::{ChatSummary, Message};
use tokio::sync::mpsc;

const ME: &str = "me@kirpich.app";

type Engine = SyncEngine<LoopbackConnector, InMemoryBackend>;

struct Connected {
    engine: Engine,
    events: mpsc::Receiver<SyncEvent>,
    end: ServerEnd,
    backend: InMemoryBackend,
}

fn c1() -> ChatId {
    ChatId::new("c1")
}

/// Logs in, connects, and waits for the initial chat list so later frames
/// are not overwritten by it.
async fn connected(config: ClientConfig) -> Connected {
    let backend = InMemoryBackend::new().with_chats(vec![ChatSummary::new(c1(), "General")]);
    let (connector, mut server) = LoopbackConnector::new();
    let (engine, mut events) = SyncEngine::new(connector, backend.clone(), "loop://rt", &config);
    engine.login(ME, "pw").await.unwrap();
    engine.start().unwrap();
    let end = server.accept().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::ChatsReplaced { .. })).await;
    Connected {
        engine,
        events,
        end,
        backend,
    }
}

async fn next_matching(
    rx: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
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

fn incoming(id: &str, sender: &str, content: &str, at: u64) -> Message {
    Message {
        id: MessageId::new(id),
        chat_id: c1(),
        sender_id: UserId::new(sender),
        content: content.into(),
        timestamp: Timestamp::from_millis(at),
        client_temp_id: None,
    }
}

async fn next_outgoing(end: &mut ServerEnd) -> OutgoingMessage {
    match end.recv_non_ping().await {
        Some(ClientFrame::Message(outgoing)) => outgoing,
        other => panic!("expected message frame, got {other:?}"),
    }
}

async fn ack(end: &ServerEnd, temp: &ClientTempId, id: &str, at: u64) {
    end.push(&ServerFrame::Ack(SendAck {
        client_temp_id: temp.clone(),
        message_id: MessageId::new(id),
        chat_id: c1(),
        timestamp: Timestamp::from_millis(at),
    }))
    .await
    .unwrap();
}

#[tokio::test]
async fn incoming_message_updates_unread_and_last_message() {
    let mut c = connected(ClientConfig::default()).await;

    let m1 = incoming("m1", "alice", "hello", 1_000);
    c.end
        .push(&ServerFrame::NewMessage {
            message: m1.clone(),
        })
        .await
        .unwrap();

    let received = next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageReceived { .. })).await;
    assert_eq!(received, SyncEvent::MessageReceived { message: m1.clone() });
    let event = next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { .. })).await;
    assert_eq!(
        event,
        SyncEvent::UnreadChanged {
            chat_id: c1(),
            unread: 1
        }
    );

    let chat = c.engine.chats().get(&c1()).unwrap();
    assert_eq!(chat.unread_count, 1);
    assert_eq!(chat.last_message, Some(m1));
}

#[tokio::test]
async fn redelivered_message_counts_once() {
    let mut c = connected(ClientConfig::default()).await;

    let m1 = incoming("m1", "alice", "hello", 1_000);
    for _ in 0..3 {
        c.end
            .push(&ServerFrame::NewMessage {
                message: m1.clone(),
            })
            .await
            .unwrap();
    }
    c.end
        .push(&ServerFrame::NewMessage {
            message: incoming("m2", "alice", "again", 2_000),
        })
        .await
        .unwrap();

    next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { unread: 2, .. })).await;
    assert_eq!(c.engine.chats().unread(&c1()), 2);
    assert_eq!(c.engine.messages().len(&c1()), 2);
}

#[tokio::test]
async fn ack_replaces_pending_entry_in_place() {
    let mut c = connected(ClientConfig::default()).await;

    let handle = c.engine.send_message(c1(), "hi").unwrap();
    let entries = c.engine.messages().entries(&c1());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].delivery, DeliveryState::Pending);
    assert_eq!(entries[0].id, None);

    let outgoing = next_outgoing(&mut c.end).await;
    assert_eq!(outgoing.client_temp_id, handle.client_temp_id);
    assert_eq!(outgoing.content, "hi");
    ack(&c.end, &outgoing.client_temp_id, "m2", 5_000).await;

    let event = next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    assert_eq!(
        event,
        SyncEvent::MessageConfirmed {
            chat_id: c1(),
            client_temp_id: handle.client_temp_id.clone(),
            message_id: MessageId::new("m2"),
        }
    );
    let entries = c.engine.messages().entries(&c1());
    assert_eq!(entries.len(), 1, "confirmation replaces, never appends");
    assert_eq!(entries[0].id, Some(MessageId::new("m2")));
    assert_eq!(entries[0].client_temp_id, Some(handle.client_temp_id));
    assert_eq!(entries[0].delivery, DeliveryState::Sent);
}

#[tokio::test]
async fn echo_before_ack_confirms_once() {
    let mut c = connected(ClientConfig::default()).await;

    c.engine.send_message(c1(), "hi").unwrap();
    let outgoing = next_outgoing(&mut c.end).await;

    let mut echo = incoming("m2", ME, "hi", 5_000);
    echo.client_temp_id = Some(outgoing.client_temp_id.clone());
    c.end
        .push(&ServerFrame::NewMessage { message: echo })
        .await
        .unwrap();
    ack(&c.end, &outgoing.client_temp_id, "m2", 5_000).await;
    // A marker frame so we know both were routed.
    c.end
        .push(&ServerFrame::Typing(TypingIndicator {
            chat_id: c1(),
            user_id: UserId::new("alice"),
            is_typing: true,
        }))
        .await
        .unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::Typing { .. })).await;

    let entries = c.engine.messages().entries(&c1());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].delivery, DeliveryState::Sent);
    assert_eq!(c.engine.chats().unread(&c1()), 0, "own messages are never unread");
}

#[tokio::test]
async fn rejected_send_can_be_retried() {
    let mut c = connected(ClientConfig::default()).await;

    let handle = c.engine.send_message(c1(), "hi").unwrap();
    let first = next_outgoing(&mut c.end).await;
    c.end
        .push(&ServerFrame::Error(ServerError {
            client_temp_id: Some(first.client_temp_id.clone()),
            code: "rate_limited".into(),
            reason: "slow down".into(),
        }))
        .await
        .unwrap();

    let event = next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageFailed { .. })).await;
    assert_eq!(
        event,
        SyncEvent::MessageFailed {
            chat_id: c1(),
            client_temp_id: handle.client_temp_id.clone(),
            reason: FailureReason::Rejected("slow down".into()),
        }
    );

    c.engine.retry(&handle.client_temp_id).unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageRetrying { .. })).await;
    let second = next_outgoing(&mut c.end).await;
    assert_eq!(second.client_temp_id, first.client_temp_id, "retries reuse the temp id");
    assert_eq!(
        c.engine.messages().entries(&c1())[0].delivery,
        DeliveryState::Pending
    );

    ack(&c.end, &second.client_temp_id, "m9", 9_000).await;
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    let entries = c.engine.messages().entries(&c1());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, Some(MessageId::new("m9")));
}

#[tokio::test(start_paused = true)]
async fn late_ack_confirms_timed_out_entry() {
    let mut c = connected(ClientConfig::default()).await;

    let handle = c.engine.send_message(c1(), "slow").unwrap();
    let outgoing = next_outgoing(&mut c.end).await;

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(
        c.engine.messages().entries(&c1())[0].delivery,
        DeliveryState::Failed(FailureReason::Timeout)
    );

    ack(&c.end, &outgoing.client_temp_id, "m3", 3_000).await;
    let event = next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    assert!(matches!(
        event,
        SyncEvent::MessageConfirmed { ref client_temp_id, .. } if *client_temp_id == handle.client_temp_id
    ));
    assert_eq!(
        c.engine.messages().entries(&c1())[0].delivery,
        DeliveryState::Sent
    );
}

#[tokio::test]
async fn read_receipts_from_others_and_from_self() {
    let mut c = connected(ClientConfig::default()).await;

    c.end
        .push(&ServerFrame::NewMessage {
            message: incoming("m1", "alice", "hello", 1_000),
        })
        .await
        .unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { unread: 1, .. })).await;

    c.end
        .push(&ServerFrame::Read(ReadReceipt {
            chat_id: c1(),
            user_id: UserId::new("alice"),
            message_id: Some(MessageId::new("m1")),
            unread_count: None,
        }))
        .await
        .unwrap();
    let event = next_matching(&mut c.events, |e| matches!(e, SyncEvent::ReadBy { .. })).await;
    assert_eq!(
        event,
        SyncEvent::ReadBy {
            chat_id: c1(),
            user_id: UserId::new("alice"),
            message_id: Some(MessageId::new("m1")),
        }
    );
    assert_eq!(c.engine.chats().unread(&c1()), 1, "another reader leaves our count alone");

    // Read on another device of ours.
    c.end
        .push(&ServerFrame::Read(ReadReceipt {
            chat_id: c1(),
            user_id: UserId::new(ME),
            message_id: Some(MessageId::new("m1")),
            unread_count: Some(0),
        }))
        .await
        .unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { unread: 0, .. })).await;
    assert_eq!(c.engine.chats().unread(&c1()), 0);
}

#[tokio::test]
async fn mark_read_sends_read_frame_for_last_confirmed() {
    let mut c = connected(ClientConfig::default()).await;

    c.end
        .push(&ServerFrame::NewMessage {
            message: incoming("m1", "alice", "hello", 1_000),
        })
        .await
        .unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { unread: 1, .. })).await;

    c.engine.mark_read(&c1());
    assert_eq!(c.engine.chats().unread(&c1()), 0);
    assert_eq!(
        c.end.recv_non_ping().await,
        Some(ClientFrame::Read {
            chat_id: c1(),
            message_id: Some(MessageId::new("m1")),
        })
    );
}

#[tokio::test]
async fn typing_and_presence_are_forwarded() {
    let mut c = connected(ClientConfig::default()).await;

    c.end
        .push(&ServerFrame::Typing(TypingIndicator {
            chat_id: c1(),
            user_id: UserId::new("alice"),
            is_typing: true,
        }))
        .await
        .unwrap();
    c.end
        .push(&ServerFrame::OnlineStatus(PresenceUpdate {
            user_id: UserId::new("alice"),
            is_online: false,
            last_seen: Some(Timestamp::from_millis(7)),
        }))
        .await
        .unwrap();

    assert_eq!(
        next_matching(&mut c.events, |e| matches!(e, SyncEvent::Typing { .. })).await,
        SyncEvent::Typing {
            chat_id: c1(),
            user_id: UserId::new("alice"),
            is_typing: true,
        }
    );
    assert_eq!(
        next_matching(&mut c.events, |e| matches!(e, SyncEvent::Presence { .. })).await,
        SyncEvent::Presence {
            user_id: UserId::new("alice"),
            is_online: false,
            last_seen: Some(Timestamp::from_millis(7)),
        }
    );

    c.engine.set_typing(&c1(), true);
    assert_eq!(
        c.end.recv_non_ping().await,
        Some(ClientFrame::Typing {
            chat_id: c1(),
            is_typing: true,
        })
    );
}

#[tokio::test]
async fn malformed_frames_are_reported_and_routing_continues() {
    let mut c = connected(ClientConfig::default()).await;

    c.end.push_raw("{not json").await.unwrap();
    c.end
        .push_raw(r#"{"type":"reaction","emoji":"+1"}"#)
        .await
        .unwrap();
    c.end
        .push(&ServerFrame::NewMessage {
            message: incoming("m1", "alice", "still here", 1_000),
        })
        .await
        .unwrap();

    let mut protocol_errors = 0;
    loop {
        match next_matching(&mut c.events, |e| {
            matches!(e, SyncEvent::ProtocolError { .. } | SyncEvent::UnreadChanged { .. })
        })
        .await
        {
            SyncEvent::ProtocolError { .. } => protocol_errors += 1,
            _ => break,
        }
    }
    assert_eq!(protocol_errors, 2);
    assert_eq!(c.engine.chats().unread(&c1()), 1);
    assert_eq!(c.engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn uncorrelated_error_is_a_protocol_error() {
    let mut c = connected(ClientConfig::default()).await;

    c.end
        .push(&ServerFrame::Error(ServerError {
            client_temp_id: None,
            code: "rate_limited".into(),
            reason: "too many frames".into(),
        }))
        .await
        .unwrap();
    assert_eq!(
        next_matching(&mut c.events, |e| matches!(e, SyncEvent::ProtocolError { .. })).await,
        SyncEvent::ProtocolError {
            reason: "rate_limited: too many frames".into()
        }
    );
}

#[tokio::test]
async fn auth_expired_frame_ends_the_session() {
    let mut c = connected(ClientConfig::default()).await;

    c.end
        .push(&ServerFrame::AuthExpired {
            reason: "password changed".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        next_matching(&mut c.events, |e| matches!(e, SyncEvent::AuthExpired { .. })).await,
        SyncEvent::AuthExpired {
            reason: "password changed".into()
        }
    );
    assert!(!c.engine.session().is_active());
    assert_eq!(c.engine.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn request_route_confirms_through_backend() {
    let mut config = ClientConfig::default();
    config.outbound.route = SendRoute::Request;
    let mut c = connected(config).await;

    let handle = c.engine.send_message(c1(), "via rest").unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;

    let sent = c.backend.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].client_temp_id, handle.client_temp_id);
    assert_eq!(sent[0].content, "via rest");
    assert_eq!(
        c.engine.messages().entries(&c1())[0].delivery,
        DeliveryState::Sent
    );
    assert!(
        !matches!(c.end.try_recv(), Some(ClientFrame::Message(_))),
        "request route never writes a message frame"
    );
}

#[tokio::test]
async fn media_upload_sends_its_link() {
    let mut c = connected(ClientConfig::default()).await;

    c.engine
        .upload_media(c1(), "cat.png", vec![0x89, 0x50, 0x4e, 0x47])
        .await
        .unwrap();
    let outgoing = next_outgoing(&mut c.end).await;
    assert_eq!(outgoing.content, "https://media.kirpich.app/c1/cat.png");
    assert_eq!(c.backend.uploads().len(), 1);
}

#[tokio::test]
async fn notifications_are_forwarded_for_incoming_messages() {
    let mut config = ClientConfig::default();
    config.sync.notifications = true;
    let mut c = connected(config).await;

    c.end
        .push(&ServerFrame::NewMessage {
            message: incoming("m1", "alice", "ping", 1_000),
        })
        .await
        .unwrap();
    next_matching(&mut c.events, |e| matches!(e, SyncEvent::UnreadChanged { .. })).await;

    let notifications = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let sent = c.backend.notifications();
            if !sent.is_empty() {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        notifications,
        vec![Notification {
            title: "General".into(),
            body: "alice: ping".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn full_outbox_fails_the_evicted_send() {
    let mut config = ClientConfig::default();
    config.connection.outbox_capacity = 1;
    let backend = InMemoryBackend::new();
    let (connector, _server) = LoopbackConnector::new();
    connector.script(std::iter::repeat_n(ConnectOutcome::Fail, 1_000));
    let (engine, mut events) = SyncEngine::new(connector, backend, "loop://rt", &config);
    engine.login(ME, "pw").await.unwrap();
    engine.start().unwrap();
    next_matching(&mut events, |e| {
        matches!(e, SyncEvent::ConnectionChanged { to: ConnectionState::Reconnecting, .. })
    })
    .await;

    let first = engine.send_message(c1(), "one").unwrap();
    engine.send_message(c1(), "two").unwrap();

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::MessageFailed { .. })).await;
    assert_eq!(
        event,
        SyncEvent::MessageFailed {
            chat_id: c1(),
            client_temp_id: first.client_temp_id,
            reason: FailureReason::Backpressure,
        }
    );
    assert_eq!(engine.connection().queued(), 1);
}
