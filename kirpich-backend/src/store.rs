//! In-memory data for the development backend: sessions, chats, messages,
//! read marks and uploaded media.
//!
//! Message sends are idempotent per `client_temp_id`: a retried send
//! returns the message stored by the first attempt instead of creating a
//! second one.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use kirpich_proto::api::LoginResponse;
use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use kirpich_proto::message::{ChatSummary, Message, ValidationError, validate_content};

/// Errors returned by [`Store`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid or expired token")]
    Unauthorized,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("File payload is empty")]
    EmptyUpload,
}

impl StoreError {
    /// Machine-readable code sent in realtime `error` frames.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unauthorized => "unauthorized",
            Self::Invalid(ValidationError::Empty) => "empty_message",
            Self::Invalid(ValidationError::TooLarge { .. }) => "message_too_large",
            Self::EmptyUpload => "empty_upload",
        }
    }
}

/// Result of [`Store::post_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub message: Message,
    /// The temp id was already used; `message` is the original.
    pub duplicate: bool,
}

struct Grant {
    user_id: UserId,
    expires_at: Option<Timestamp>,
}

struct ChatRecord {
    id: ChatId,
    title: String,
    messages: Vec<Message>,
    /// Number of messages each user has read.
    read_marks: HashMap<UserId, usize>,
}

impl ChatRecord {
    fn new(id: ChatId, title: String) -> Self {
        Self {
            id,
            title,
            messages: Vec::new(),
            read_marks: HashMap::new(),
        }
    }

    fn summary_for(&self, user: &UserId) -> ChatSummary {
        let read = self.read_marks.get(user).copied().unwrap_or(0);
        let unread = self
            .messages
            .iter()
            .skip(read)
            .filter(|m| &m.sender_id != user)
            .count();
        ChatSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            last_message: self.messages.last().cloned(),
            unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Default)]
struct Inner {
    tokens: HashMap<String, Grant>,
    chats: Vec<ChatRecord>,
    sent: HashMap<ClientTempId, Message>,
    media: HashMap<(ChatId, String), Vec<u8>>,
    next_id: u64,
    last_timestamp: u64,
}

impl Inner {
    fn chat_mut(&mut self, chat_id: &ChatId) -> &mut ChatRecord {
        let index = match self.chats.iter().position(|c| &c.id == chat_id) {
            Some(index) => index,
            None => {
                self.chats
                    .push(ChatRecord::new(chat_id.clone(), chat_id.to_string()));
                self.chats.len() - 1
            }
        };
        &mut self.chats[index]
    }

    /// Strictly increasing server timestamps, so message order is total.
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        Timestamp::from_millis(self.last_timestamp)
    }
}

/// Shared backend data. All methods take the lock for one operation.
pub struct Store {
    inner: RwLock<Inner>,
    token_ttl: Option<Duration>,
    max_message_size: usize,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Store {
    #[must_use]
    pub fn new(token_ttl: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            token_ttl,
            max_message_size: kirpich_proto::message::MAX_MESSAGE_SIZE,
        }
    }

    /// Creates a chat if it does not exist yet.
    pub async fn create_chat(&self, id: ChatId, title: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if !inner.chats.iter().any(|c| c.id == id) {
            inner.chats.push(ChatRecord::new(id, title.into()));
        }
    }

    /// Issues a token. Any non-empty email and password are accepted; the
    /// email becomes the user id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCredentials`] for a blank email or
    /// password.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, StoreError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(StoreError::InvalidCredentials);
        }
        let token = Uuid::now_v7().simple().to_string();
        let user_id = UserId::new(email);
        let expires_at = self.token_ttl.map(|ttl| {
            Timestamp::now().saturating_add_millis(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        });
        self.inner.write().await.tokens.insert(
            token.clone(),
            Grant {
                user_id: user_id.clone(),
                expires_at,
            },
        );
        tracing::info!(user = %user_id, "login");
        Ok(LoginResponse {
            token,
            user_id,
            expires_at,
        })
    }

    /// Resolves a token to its user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unauthorized`] for unknown, revoked or expired
    /// tokens.
    pub async fn authorize(&self, token: &str) -> Result<UserId, StoreError> {
        let inner = self.inner.read().await;
        let grant = inner.tokens.get(token).ok_or(StoreError::Unauthorized)?;
        if grant
            .expires_at
            .is_some_and(|at| Timestamp::now() >= at)
        {
            return Err(StoreError::Unauthorized);
        }
        Ok(grant.user_id.clone())
    }

    /// Invalidates every issued token. Returns how many there were.
    pub async fn revoke_all(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.tokens.len();
        inner.tokens.clear();
        count
    }

    /// Stores a message from `sender`, creating the chat if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] for empty or oversized content.
    pub async fn post_message(
        &self,
        sender: &UserId,
        chat_id: &ChatId,
        content: &str,
        client_temp_id: &ClientTempId,
    ) -> Result<Posted, StoreError> {
        validate_content(content, self.max_message_size)?;
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.sent.get(client_temp_id) {
            return Ok(Posted {
                message: existing.clone(),
                duplicate: true,
            });
        }

        inner.next_id += 1;
        let message = Message {
            id: MessageId::new(format!("m{}", inner.next_id)),
            chat_id: chat_id.clone(),
            sender_id: sender.clone(),
            content: content.to_owned(),
            timestamp: inner.next_timestamp(),
            client_temp_id: Some(client_temp_id.clone()),
        };
        inner.sent.insert(client_temp_id.clone(), message.clone());
        let chat = inner.chat_mut(chat_id);
        chat.messages.push(message.clone());
        // Sending implies having read everything before it.
        let len = chat.messages.len();
        chat.read_marks.insert(sender.clone(), len);
        Ok(Posted {
            message,
            duplicate: false,
        })
    }

    /// Records that `user` read `chat_id` up to `message_id`, or to the end
    /// when `None`. Returns the id of the last message covered.
    pub async fn mark_read(
        &self,
        user: &UserId,
        chat_id: &ChatId,
        message_id: Option<&MessageId>,
    ) -> Option<MessageId> {
        let mut inner = self.inner.write().await;
        let chat = inner.chat_mut(chat_id);
        let upto = match message_id {
            Some(id) => chat.messages.iter().position(|m| &m.id == id)? + 1,
            None => chat.messages.len(),
        };
        let mark = chat.read_marks.entry(user.clone()).or_insert(0);
        *mark = (*mark).max(upto);
        let covered = *mark;
        covered
            .checked_sub(1)
            .and_then(|i| chat.messages.get(i))
            .map(|m| m.id.clone())
    }

    /// Every chat as seen by `user`.
    pub async fn chats_for(&self, user: &UserId) -> Vec<ChatSummary> {
        self.inner
            .read()
            .await
            .chats
            .iter()
            .map(|c| c.summary_for(user))
            .collect()
    }

    /// Messages of one chat, oldest first.
    pub async fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        self.inner
            .read()
            .await
            .chats
            .iter()
            .find(|c| &c.id == chat_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Keeps an uploaded file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmptyUpload`] if `bytes` is empty.
    pub async fn store_media(
        &self,
        chat_id: &ChatId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::EmptyUpload);
        }
        self.inner
            .write()
            .await
            .media
            .insert((chat_id.clone(), file_name.to_owned()), bytes);
        Ok(())
    }

    pub async fn media(&self, chat_id: &ChatId, file_name: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .await
            .media
            .get(&(chat_id.clone(), file_name.to_owned()))
            .cloned()
    }
}
