//! Realtime frames exchanged over the persistent connection.
//!
//! Every frame is a JSON object tagged by a `type` field. Server frames
//! carry new messages, read receipts, typing and presence signals, and the
//! acknowledgement or rejection of a client send. Client frames carry
//! outgoing messages, read markers, typing state and heartbeats.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use crate::message::Message;

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A message was posted to a chat.
    NewMessage {
        /// The confirmed message.
        message: Message,
    },
    /// A user read a chat up to some message.
    Read(ReadReceipt),
    /// A user started or stopped typing.
    Typing(TypingIndicator),
    /// A user went online or offline.
    OnlineStatus(PresenceUpdate),
    /// The server accepted a client send.
    Ack(SendAck),
    /// The server rejected a client frame.
    Error(ServerError),
    /// The session token is no longer valid.
    AuthExpired {
        /// Human-readable explanation.
        #[serde(default)]
        reason: String,
    },
    /// Heartbeat reply.
    Pong {
        /// Timestamp echoed from the ping.
        timestamp: Timestamp,
    },
}

/// Discriminant of a [`ServerFrame`], used for logging and routing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    NewMessage,
    ReadReceipt,
    Typing,
    Presence,
    Ack,
    Error,
    AuthExpired,
    Pong,
}

impl ServerFrame {
    /// Returns the kind of this frame.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::NewMessage { .. } => FrameKind::NewMessage,
            Self::Read(_) => FrameKind::ReadReceipt,
            Self::Typing(_) => FrameKind::Typing,
            Self::OnlineStatus(_) => FrameKind::Presence,
            Self::Ack(_) => FrameKind::Ack,
            Self::Error(_) => FrameKind::Error,
            Self::AuthExpired { .. } => FrameKind::AuthExpired,
            Self::Pong { .. } => FrameKind::Pong,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NewMessage => "new_message",
            Self::ReadReceipt => "read",
            Self::Typing => "typing",
            Self::Presence => "online_status",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::AuthExpired => "auth_expired",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A read receipt for a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub chat_id: ChatId,
    /// The user who read the chat.
    pub user_id: UserId,
    /// Last message covered by the receipt, when the server names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Server-side unread count after the receipt, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

/// Acknowledgement of a client send, correlated by `client_temp_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub client_temp_id: ClientTempId,
    /// Id the server assigned to the message.
    pub message_id: MessageId,
    pub chat_id: ChatId,
    /// Server timestamp of the stored message.
    pub timestamp: Timestamp,
}

/// Rejection of a client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Set when the rejected frame was a message send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
    /// Machine-readable error code.
    #[serde(default)]
    pub code: String,
    /// Human-readable explanation.
    #[serde(default)]
    pub reason: String,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Post a message to a chat.
    Message(OutgoingMessage),
    /// Mark a chat as read.
    Read {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    /// Report local typing state.
    Typing { chat_id: ChatId, is_typing: bool },
    /// Heartbeat.
    Ping { timestamp: Timestamp },
}

/// Body of a [`ClientFrame::Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub client_temp_id: ClientTempId,
}

impl ClientFrame {
    /// Returns the correlation id if this frame is a message send.
    #[must_use]
    pub const fn client_temp_id(&self) -> Option<&ClientTempId> {
        match self {
            Self::Message(message) => Some(&message.client_temp_id),
            _ => None,
        }
    }

    /// Short name of the frame type, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Read { .. } => "read",
            Self::Typing { .. } => "typing",
            Self::Ping { .. } => "ping",
        }
    }
}
