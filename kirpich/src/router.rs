//! Inbound frame dispatch.
//!
//! [`MessageRouter::handle_frame`] decodes one raw frame and applies it to
//! the stores before returning, so frames from one connection take effect
//! in arrival order. Anything that cannot be decoded is dropped and
//! reported as [`SyncEvent::ProtocolError`].

use std::sync::Arc;

use kirpich_proto::codec;
use kirpich_proto::frame::{FrameKind, ReadReceipt, ServerError, ServerFrame};
use kirpich_proto::message::Message;

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::event::{EventSink, SyncEvent};
use crate::outbound::OutboundCoordinator;
use crate::session::SessionState;
use crate::state::{ApplyOutcome, ChatState, FailureReason, MessageState};
use crate::transport::Connector;

/// Applies server frames to local state.
pub struct MessageRouter<C: Connector, B: Backend> {
    chats: ChatState,
    messages: MessageState,
    session: SessionState,
    outbound: OutboundCoordinator<C, B>,
    backend: Arc<B>,
    events: EventSink,
    config: SyncConfig,
}

impl<C: Connector, B: Backend> MessageRouter<C, B> {
    #[must_use]
    pub const fn new(
        chats: ChatState,
        messages: MessageState,
        session: SessionState,
        outbound: OutboundCoordinator<C, B>,
        backend: Arc<B>,
        events: EventSink,
        config: SyncConfig,
    ) -> Self {
        Self {
            chats,
            messages,
            session,
            outbound,
            backend,
            events,
            config,
        }
    }

    /// Decodes and applies one frame.
    ///
    /// Returns the kind of frame handled, or `None` if it was dropped as
    /// malformed.
    pub fn handle_frame(&self, raw: &str) -> Option<FrameKind> {
        let frame: ServerFrame = match codec::decode_bounded(raw, self.config.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "dropping malformed frame");
                self.events.emit(SyncEvent::ProtocolError {
                    reason: e.to_string(),
                });
                return None;
            }
        };
        let kind = frame.kind();
        tracing::trace!(%kind, "routing frame");

        match frame {
            ServerFrame::NewMessage { message } => self.on_new_message(message),
            ServerFrame::Read(receipt) => self.on_read(receipt),
            ServerFrame::Typing(typing) => self.events.emit(SyncEvent::Typing {
                chat_id: typing.chat_id,
                user_id: typing.user_id,
                is_typing: typing.is_typing,
            }),
            ServerFrame::OnlineStatus(presence) => self.events.emit(SyncEvent::Presence {
                user_id: presence.user_id,
                is_online: presence.is_online,
                last_seen: presence.last_seen,
            }),
            ServerFrame::Ack(ack) => {
                self.outbound
                    .resolve_pending(&ack.client_temp_id, ack.message_id, Some(ack.timestamp));
            }
            ServerFrame::Error(error) => self.on_error(error),
            ServerFrame::AuthExpired { reason } => {
                self.session.expire(reason);
            }
            ServerFrame::Pong { timestamp } => tracing::trace!(%timestamp, "pong"),
        }
        Some(kind)
    }

    fn on_new_message(&self, message: Message) {
        let chat_id = message.chat_id.clone();
        match self.messages.apply_confirmed(&chat_id, message.clone()) {
            ApplyOutcome::Duplicate => {
                // An echo of an own send that was already acked still
                // becomes the chat's last message.
                self.chats.record_last_message(&message);
                tracing::debug!(chat_id = %chat_id, message_id = %message.id, "duplicate message ignored");
                return;
            }
            ApplyOutcome::ReplacedPending { client_temp_id, .. } => {
                self.outbound.settle(&client_temp_id);
                self.events.emit(SyncEvent::MessageConfirmed {
                    chat_id: chat_id.clone(),
                    client_temp_id,
                    message_id: message.id.clone(),
                });
            }
            ApplyOutcome::Inserted { .. } => {
                self.events.emit(SyncEvent::MessageReceived {
                    message: message.clone(),
                });
            }
        }

        self.chats.record_last_message(&message);

        let own = self.session.user_id().as_ref() == Some(&message.sender_id);
        if own {
            return;
        }
        if let Some(unread) = self.chats.bump_unread(&chat_id, &message.id) {
            self.events.emit(SyncEvent::UnreadChanged { chat_id, unread });
            if self.config.notifications {
                self.notify(&message);
            }
        }
    }

    fn on_read(&self, receipt: ReadReceipt) {
        if self.session.user_id().as_ref() == Some(&receipt.user_id) {
            if self
                .chats
                .clear_unread(&receipt.chat_id, receipt.message_id.as_ref())
            {
                self.events.emit(SyncEvent::UnreadChanged {
                    chat_id: receipt.chat_id,
                    unread: 0,
                });
            }
        } else {
            self.events.emit(SyncEvent::ReadBy {
                chat_id: receipt.chat_id,
                user_id: receipt.user_id,
                message_id: receipt.message_id,
            });
        }
    }

    fn on_error(&self, error: ServerError) {
        if let Some(temp) = &error.client_temp_id
            && self
                .outbound
                .fail_pending(temp, FailureReason::Rejected(error.reason.clone()))
        {
            tracing::warn!(client_temp_id = %temp, code = %error.code, reason = %error.reason, "send rejected");
            return;
        }
        tracing::warn!(code = %error.code, reason = %error.reason, "server error");
        self.events.emit(SyncEvent::ProtocolError {
            reason: format!("{}: {}", error.code, error.reason),
        });
    }

    fn notify(&self, message: &Message) {
        let Some(token) = self.session.current().map(|s| s.token) else {
            return;
        };
        let title = self
            .chats
            .get(&message.chat_id)
            .map_or_else(|| message.chat_id.to_string(), |chat| chat.title);
        let body = format!("{}: {}", message.sender_id, message.content);
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.notify(&token, &title, &body).await {
                tracing::debug!(error = %e, "notification failed");
            }
        });
    }
}
