//! Request and response bodies for the REST endpoints.
//!
//! | Endpoint               | Request                 | Response                 |
//! |------------------------|-------------------------|--------------------------|
//! | `POST /api/auth/login` | [`LoginRequest`]        | [`LoginResponse`]        |
//! | `GET  /api/chats`      |                         | `Vec<ChatSummary>`       |
//! | `POST /api/messages`   | [`SendMessageRequest`]  | [`SendMessageResponse`]  |
//! | `POST /api/media`      | [`UploadMediaRequest`]  | [`UploadMediaResponse`]  |
//! | `POST /api/notify`     | [`NotifyRequest`]       | empty                    |
//!
//! Failures carry an [`ApiError`] body. A 401 or 403 status means the
//! bearer token is no longer valid.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const CHATS_PATH: &str = "/api/chats";
pub const MESSAGES_PATH: &str = "/api/messages";
pub const MEDIA_PATH: &str = "/api/media";
pub const NOTIFY_PATH: &str = "/api/notify";

/// Name of the query parameter carrying the token on the realtime endpoint.
pub const TOKEN_QUERY_PARAM: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Bearer token for REST calls and the realtime connection.
    pub token: String,
    pub user_id: UserId,
    /// When the token stops being accepted, if the server says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub content: String,
    /// Lets the server deduplicate retries of the same logical send.
    pub client_temp_id: ClientTempId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: MessageId,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMediaRequest {
    pub chat_id: ChatId,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMediaResponse {
    /// Where the uploaded file can be fetched; sent as message content.
    pub media_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub title: String,
    pub body: String,
}

/// Error body returned with any non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
