//! In-process backend for tests and offline runs.
//!
//! Keeps issued tokens, chats, sent messages and uploads in memory, and can
//! be scripted to fail specific calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use kirpich_proto::api::{
    LoginResponse, SendMessageRequest, SendMessageResponse, UploadMediaRequest,
    UploadMediaResponse,
};
use kirpich_proto::ids::{MessageId, Timestamp, UserId};
use kirpich_proto::message::ChatSummary;

use super::{Backend, BackendError};

/// A notification raised through [`Backend::notify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct Inner {
    tokens: HashSet<String>,
    chats: Vec<ChatSummary>,
    sent: Vec<SendMessageRequest>,
    uploads: Vec<UploadMediaRequest>,
    notifications: Vec<Notification>,
    send_failure: Option<BackendError>,
    upload_failure: Option<BackendError>,
    chats_failure: Option<BackendError>,
    get_chats_calls: usize,
}

/// Scriptable [`Backend`] held entirely in memory.
///
/// Cloning shares the underlying state, so a test can keep one handle for
/// inspection while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the chat list returned by `get_chats`.
    #[must_use]
    pub fn with_chats(self, chats: Vec<ChatSummary>) -> Self {
        self.set_chats(chats);
        self
    }

    pub fn set_chats(&self, chats: Vec<ChatSummary>) {
        self.inner.lock().chats = chats;
    }

    /// Makes every following `send_message` call fail with `err`.
    /// `None` restores normal behaviour.
    pub fn fail_sends_with(&self, err: Option<BackendError>) {
        self.inner.lock().send_failure = err;
    }

    pub fn fail_uploads_with(&self, err: Option<BackendError>) {
        self.inner.lock().upload_failure = err;
    }

    pub fn fail_get_chats_with(&self, err: Option<BackendError>) {
        self.inner.lock().chats_failure = err;
    }

    /// Invalidates every token issued so far.
    pub fn revoke_tokens(&self) {
        self.inner.lock().tokens.clear();
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.inner.lock().sent.clone()
    }

    #[must_use]
    pub fn uploads(&self) -> Vec<UploadMediaRequest> {
        self.inner.lock().uploads.clone()
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.clone()
    }

    #[must_use]
    pub fn get_chats_calls(&self) -> usize {
        self.inner.lock().get_chats_calls
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn authorize(&self, token: &str) -> Result<(), BackendError> {
        if self.inner.lock().tokens.contains(token) {
            Ok(())
        } else {
            Err(BackendError::Auth("invalid or expired token".into()))
        }
    }
}

impl Backend for InMemoryBackend {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, BackendError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(BackendError::Auth("invalid credentials".into()));
        }
        let token = format!("token-{}", self.next());
        self.inner.lock().tokens.insert(token.clone());
        Ok(LoginResponse {
            token,
            user_id: UserId::new(email),
            expires_at: None,
        })
    }

    async fn get_chats(&self, token: &str) -> Result<Vec<ChatSummary>, BackendError> {
        self.authorize(token)?;
        let mut inner = self.inner.lock();
        inner.get_chats_calls += 1;
        if let Some(err) = inner.chats_failure.clone() {
            return Err(err);
        }
        Ok(inner.chats.clone())
    }

    async fn send_message(
        &self,
        token: &str,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, BackendError> {
        self.authorize(token)?;
        if let Some(err) = self.inner.lock().send_failure.clone() {
            return Err(err);
        }
        if request.content.trim().is_empty() {
            return Err(BackendError::Rejected("message content is empty".into()));
        }
        let message_id = MessageId::new(format!("msg-{}", self.next()));
        self.inner.lock().sent.push(request.clone());
        Ok(SendMessageResponse {
            message_id,
            timestamp: Timestamp::now(),
        })
    }

    async fn upload_media(
        &self,
        token: &str,
        request: &UploadMediaRequest,
    ) -> Result<UploadMediaResponse, BackendError> {
        self.authorize(token)?;
        if let Some(err) = self.inner.lock().upload_failure.clone() {
            return Err(err);
        }
        if request.bytes.is_empty() {
            return Err(BackendError::Rejected("File payload is empty".into()));
        }
        self.inner.lock().uploads.push(request.clone());
        Ok(UploadMediaResponse {
            media_url: format!(
                "https://media.kirpich.app/{}/{}",
                request.chat_id, request.file_name
            ),
        })
    }

    async fn notify(&self, token: &str, title: &str, body: &str) -> Result<(), BackendError> {
        self.authorize(token)?;
        self.inner.lock().notifications.push(Notification {
            title: title.to_owned(),
            body: body.to_owned(),
        });
        Ok(())
    }
}
