//! Message and chat summary records as they appear on the wire.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};

/// Maximum allowed message payload size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A confirmed message, carrying its server-assigned id.
///
/// `client_temp_id` is echoed back by the server on the sender's own
/// messages so the optimistic entry can be replaced in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Chat the message belongs to.
    pub chat_id: ChatId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text body, or a media URL for uploads.
    pub content: String,
    /// Server timestamp used for ordering.
    pub timestamp: Timestamp,
    /// Correlation id of the originating optimistic send, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<ClientTempId>,
}

/// One row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Chat identifier.
    pub id: ChatId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Most recent message known for this chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Messages from other users not yet read by the local user.
    #[serde(default)]
    pub unread_count: u32,
}

impl ChatSummary {
    /// Creates an empty summary with no messages and zero unread.
    #[must_use]
    pub fn new(id: ChatId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            last_message: None,
            unread_count: 0,
        }
    }
}

/// Error returned when outgoing content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outgoing message content against a size limit.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] if the content is blank, or
/// [`ValidationError::TooLarge`] if it exceeds `max` bytes.
pub fn validate_content(content: &str, max: usize) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > max {
        return Err(ValidationError::TooLarge { size, max });
    }
    Ok(())
}
