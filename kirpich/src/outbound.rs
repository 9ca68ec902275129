//! Optimistic sends and their reconciliation.
//!
//! [`OutboundCoordinator`] turns user intents into pending entries in
//! [`MessageState`] and issues them over the configured route. Each
//! attempt gets its own timer; whichever comes first of acknowledgement,
//! correlated echo, explicit error, or timer expiry decides the entry.
//! Resolution goes through [`MessageState`], which makes a second
//! resolution of the same entry a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use kirpich_proto::api::{SendMessageRequest, UploadMediaRequest};
use kirpich_proto::frame::{ClientFrame, OutgoingMessage};
use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp};
use kirpich_proto::message::{ValidationError, validate_content};

use crate::backend::{Backend, BackendError};
use crate::config::{OutboundConfig, SendRoute};
use crate::connection::ConnectionManager;
use crate::event::{EventSink, SyncEvent};
use crate::session::SessionState;
use crate::state::{ConfirmOutcome, FailureReason, MessageEntry, MessageState, MessageStateError};
use crate::transport::Connector;

/// Errors returned synchronously by send operations. Failures after the
/// pending entry exists are reported on the entry instead.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("not logged in")]
    NotAuthenticated,

    #[error(transparent)]
    State(#[from] MessageStateError),

    /// The media upload failed; no message was created.
    #[error("upload failed: {0}")]
    Upload(BackendError),
}

/// Identifies the optimistic entry created by a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub chat_id: ChatId,
    pub client_temp_id: ClientTempId,
}

/// Coordinates optimistic sends. Cheap to clone.
pub struct OutboundCoordinator<C: Connector, B: Backend> {
    inner: Arc<Inner<C, B>>,
}

impl<C: Connector, B: Backend> Clone for OutboundCoordinator<C, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector, B> {
    messages: MessageState,
    connection: ConnectionManager<C>,
    backend: Arc<B>,
    session: SessionState,
    config: OutboundConfig,
    events: EventSink,
    in_flight: Mutex<HashMap<ClientTempId, Attempt>>,
    next_generation: AtomicU64,
}

/// The live attempt for one temp id.
struct Attempt {
    generation: u64,
    timer: AbortHandle,
    request: Option<AbortHandle>,
}

impl Attempt {
    fn abort(&self) {
        self.timer.abort();
        if let Some(request) = &self.request {
            request.abort();
        }
    }
}

impl<C: Connector, B: Backend> OutboundCoordinator<C, B> {
    #[must_use]
    pub fn new(
        messages: MessageState,
        connection: ConnectionManager<C>,
        backend: Arc<B>,
        session: SessionState,
        config: OutboundConfig,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                messages,
                connection,
                backend,
                session,
                config,
                events,
                in_flight: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pending entry for `content` and starts sending it.
    ///
    /// Returns as soon as the entry exists; the outcome arrives later as a
    /// [`SyncEvent`].
    ///
    /// # Errors
    ///
    /// Fails before creating anything if the content is invalid or there
    /// is no active session.
    pub fn send_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
    ) -> Result<PendingHandle, SendError> {
        let content = content.into();
        validate_content(&content, self.inner.config.max_message_size)?;
        let session = self
            .inner
            .session
            .current()
            .ok_or(SendError::NotAuthenticated)?;

        let temp = ClientTempId::new();
        let entry = MessageEntry::pending(
            chat_id.clone(),
            session.user_id,
            content.clone(),
            temp.clone(),
            Timestamp::now(),
        );
        self.inner.messages.append_pending(entry)?;
        tracing::debug!(chat_id = %chat_id, client_temp_id = %temp, "message pending");
        self.inner.events.emit(SyncEvent::MessagePending {
            chat_id: chat_id.clone(),
            client_temp_id: temp.clone(),
        });

        self.issue(chat_id.clone(), content, temp.clone(), session.token);
        Ok(PendingHandle {
            chat_id,
            client_temp_id: temp,
        })
    }

    /// Re-sends a failed entry under the same temp id.
    ///
    /// # Errors
    ///
    /// Fails if there is no active session, or the entry is unknown or
    /// not in the failed state.
    pub fn retry(&self, temp: &ClientTempId) -> Result<PendingHandle, SendError> {
        let session = self
            .inner
            .session
            .current()
            .ok_or(SendError::NotAuthenticated)?;
        let entry = self.inner.messages.begin_retry(temp)?;
        tracing::info!(chat_id = %entry.chat_id, client_temp_id = %temp, "retrying send");
        self.inner.events.emit(SyncEvent::MessageRetrying {
            chat_id: entry.chat_id.clone(),
            client_temp_id: temp.clone(),
        });
        self.issue(entry.chat_id.clone(), entry.content, temp.clone(), session.token);
        Ok(PendingHandle {
            chat_id: entry.chat_id,
            client_temp_id: temp.clone(),
        })
    }

    /// Uploads a file, then sends its URL as a message.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Upload`] if the upload fails, in which case no
    /// pending entry is created. Otherwise as [`send_message`](Self::send_message).
    pub async fn upload_media(
        &self,
        chat_id: ChatId,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<PendingHandle, SendError> {
        let session = self
            .inner
            .session
            .current()
            .ok_or(SendError::NotAuthenticated)?;
        let request = UploadMediaRequest {
            chat_id: chat_id.clone(),
            file_name: file_name.into(),
            bytes,
        };
        let response = match self.inner.backend.upload_media(&session.token, &request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(chat_id = %chat_id, file = %request.file_name, error = %err, "media upload failed");
                if err.is_auth() {
                    self.inner.session.expire(err.to_string());
                }
                return Err(SendError::Upload(err));
            }
        };
        self.send_message(chat_id, response.media_url)
    }

    /// Confirms the entry for `temp` from an acknowledgement.
    ///
    /// Returns `false` if the entry was already resolved.
    pub fn resolve_pending(
        &self,
        temp: &ClientTempId,
        message_id: MessageId,
        timestamp: Option<Timestamp>,
    ) -> bool {
        self.settle(temp);
        match self
            .inner
            .messages
            .confirm_pending(temp, message_id.clone(), timestamp)
        {
            ConfirmOutcome::Confirmed { chat_id, .. } | ConfirmOutcome::Merged { chat_id } => {
                tracing::debug!(chat_id = %chat_id, client_temp_id = %temp, message_id = %message_id, "send confirmed");
                self.inner.events.emit(SyncEvent::MessageConfirmed {
                    chat_id,
                    client_temp_id: temp.clone(),
                    message_id,
                });
                true
            }
            ConfirmOutcome::NotPending => {
                tracing::debug!(client_temp_id = %temp, "acknowledgement for resolved entry");
                false
            }
        }
    }

    /// Stops tracking the attempt for `temp`, after the router confirmed
    /// it from an echoed message.
    pub fn settle(&self, temp: &ClientTempId) {
        if let Some(attempt) = self.inner.in_flight.lock().remove(temp) {
            attempt.abort();
        }
    }

    /// Fails the pending entry for `temp`.
    ///
    /// Returns `false` if there is no such entry or it is not pending.
    pub fn fail_pending(&self, temp: &ClientTempId, reason: FailureReason) -> bool {
        self.settle(temp);
        self.mark_failed(temp, reason)
    }

    /// Fails the send carried by a frame the outbox evicted.
    pub fn on_frame_dropped(&self, frame: &ClientFrame) {
        if let Some(temp) = frame.client_temp_id() {
            self.fail_pending(temp, FailureReason::Backpressure);
        }
    }

    /// Cancels every timer and in-flight request. Entries keep their state.
    pub fn shutdown(&self) {
        let attempts: Vec<Attempt> = self.inner.in_flight.lock().drain().map(|(_, a)| a).collect();
        for attempt in &attempts {
            attempt.abort();
        }
        if !attempts.is_empty() {
            tracing::info!(cancelled = attempts.len(), "cancelled in-flight sends");
        }
    }

    /// Number of attempts still waiting for an outcome.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    fn issue(&self, chat_id: ChatId, content: String, temp: ClientTempId, token: String) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let timer = {
            let this = self.clone();
            let temp = temp.clone();
            let timeout = self.inner.config.send_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.expire_attempt(&temp, generation);
            })
            .abort_handle()
        };

        let request = match self.inner.config.route {
            SendRoute::Realtime => None,
            SendRoute::Request => {
                let this = self.clone();
                let request = SendMessageRequest {
                    chat_id: chat_id.clone(),
                    content: content.clone(),
                    client_temp_id: temp.clone(),
                };
                Some(
                    tokio::spawn(async move { this.request(request, token, generation).await })
                        .abort_handle(),
                )
            }
        };

        let realtime = request.is_none();
        let attempt = Attempt {
            generation,
            timer,
            request,
        };
        if let Some(previous) = self.inner.in_flight.lock().insert(temp.clone(), attempt) {
            previous.abort();
        }

        if realtime {
            self.inner
                .connection
                .send(ClientFrame::Message(OutgoingMessage {
                    chat_id,
                    content,
                    client_temp_id: temp,
                }));
        }
    }

    async fn request(&self, request: SendMessageRequest, token: String, generation: u64) {
        let temp = request.client_temp_id.clone();
        match self.inner.backend.send_message(&token, &request).await {
            Ok(response) => {
                self.resolve_pending(&temp, response.message_id, Some(response.timestamp));
            }
            Err(err) => {
                tracing::warn!(chat_id = %request.chat_id, client_temp_id = %temp, error = %err, "send request failed");
                if err.is_auth() {
                    self.inner.session.expire(err.to_string());
                }
                if self.take_attempt(&temp, generation) {
                    self.mark_failed(&temp, FailureReason::Rejected(err.to_string()));
                }
            }
        }
    }

    fn expire_attempt(&self, temp: &ClientTempId, generation: u64) {
        if self.take_attempt(temp, generation) {
            tracing::warn!(client_temp_id = %temp, "send timed out");
            self.mark_failed(temp, FailureReason::Timeout);
        }
    }

    /// Removes the attempt for `temp` if it is still `generation`.
    fn take_attempt(&self, temp: &ClientTempId, generation: u64) -> bool {
        let mut in_flight = self.inner.in_flight.lock();
        if !in_flight.get(temp).is_some_and(|a| a.generation == generation) {
            return false;
        }
        if let Some(request) = in_flight.remove(temp).and_then(|a| a.request) {
            request.abort();
        }
        true
    }

    fn mark_failed(&self, temp: &ClientTempId, reason: FailureReason) -> bool {
        let Some(chat_id) = self.inner.messages.mark_failed(temp, reason.clone()) else {
            return false;
        };
        self.inner.events.emit(SyncEvent::MessageFailed {
            chat_id,
            client_temp_id: temp.clone(),
            reason,
        });
        true
    }
}
