//! Events emitted by the sync engine for the UI layer.

use std::time::Duration;

use tokio::sync::mpsc;

use kirpich_proto::frame::ClientFrame;
use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use kirpich_proto::message::Message;

use crate::connection::ConnectionState;
use crate::state::FailureReason;

/// Notifications for the UI. State itself lives in the stores; events say
/// what changed so the UI knows what to re-read.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The realtime connection changed state.
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A reconnect attempt is scheduled.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Reconnection has failed `attempts` times in a row. It continues in
    /// the background; the UI should show the connection as lost.
    ConnectionLost { attempts: u32 },
    /// The session expired and the user must log in again.
    AuthExpired { reason: String },

    /// A message from the server was inserted into a chat.
    MessageReceived { message: Message },
    /// An optimistic entry was appended.
    MessagePending {
        chat_id: ChatId,
        client_temp_id: ClientTempId,
    },
    /// An optimistic entry was confirmed.
    MessageConfirmed {
        chat_id: ChatId,
        client_temp_id: ClientTempId,
        message_id: MessageId,
    },
    /// An optimistic entry failed and can be retried.
    MessageFailed {
        chat_id: ChatId,
        client_temp_id: ClientTempId,
        reason: FailureReason,
    },
    /// A failed entry is being sent again.
    MessageRetrying {
        chat_id: ChatId,
        client_temp_id: ClientTempId,
    },

    /// A chat's unread count changed.
    UnreadChanged { chat_id: ChatId, unread: u32 },
    /// The chat list was replaced from the server.
    ChatsReplaced { count: usize },
    /// Fetching the chat list failed; the previous list is kept.
    ResyncFailed { reason: String },
    /// Another user read a chat.
    ReadBy {
        chat_id: ChatId,
        user_id: UserId,
        message_id: Option<MessageId>,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<Timestamp>,
    },

    /// A frame was evicted from a full outbox without being sent.
    BackpressureDrop { frame: ClientFrame },
    /// The server sent something that could not be handled.
    ProtocolError { reason: String },
}

/// Non-blocking sender for [`SyncEvent`]s.
///
/// Events are best-effort: if the UI falls behind and the channel is full,
/// the event is dropped rather than stalling the sync path.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SyncEvent>,
}

impl EventSink {
    /// Creates a sink and its receiver with the given capacity.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            tracing::debug!(?event, "event channel full, dropping event");
        }
    }
}
