//! Wiring of the sync components into one session-scoped engine.
//!
//! [`SyncEngine`] owns the session, the connection, the stores, the
//! router and the outbound coordinator. A pump task drains connection
//! events in order: frames go through the router one at a time, state
//! changes become [`SyncEvent`]s, and a full chat-list resync runs off the
//! pump whenever the link comes up after a gap.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use kirpich_proto::frame::ClientFrame;
use kirpich_proto::ids::{ChatId, ClientTempId};

use crate::backend::{Backend, BackendError};
use crate::config::ClientConfig;
use crate::connection::{ConnectError, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::event::{EventSink, SyncEvent};
use crate::outbound::{OutboundCoordinator, PendingHandle, SendError};
use crate::router::MessageRouter;
use crate::session::{Session, SessionState};
use crate::state::{ChatState, MessageState};
use crate::transport::Connector;

/// Errors from engine lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("cannot connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("not logged in")]
    NotAuthenticated,
}

/// The client-side sync engine for one account.
pub struct SyncEngine<C: Connector, B: Backend> {
    session: SessionState,
    connection: ConnectionManager<C>,
    chats: ChatState,
    messages: MessageState,
    outbound: OutboundCoordinator<C, B>,
    router: Arc<MessageRouter<C, B>>,
    backend: Arc<B>,
    events: EventSink,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector, B: Backend> SyncEngine<C, B> {
    /// Builds a signed-out engine and the receiver for its events.
    #[must_use]
    pub fn new(
        connector: C,
        backend: B,
        endpoint: impl Into<String>,
        config: &ClientConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (events, rx) = EventSink::channel(config.sync.event_buffer);
        let session = SessionState::new();
        let backend = Arc::new(backend);
        let connection = ConnectionManager::new(
            connector,
            endpoint,
            session.clone(),
            config.connection.clone(),
        );
        let chats = ChatState::new(config.sync.max_tracked_ids);
        let messages = MessageState::new();
        let outbound = OutboundCoordinator::new(
            messages.clone(),
            connection.clone(),
            Arc::clone(&backend),
            session.clone(),
            config.outbound.clone(),
            events.clone(),
        );
        let router = Arc::new(MessageRouter::new(
            chats.clone(),
            messages.clone(),
            session.clone(),
            outbound.clone(),
            Arc::clone(&backend),
            events.clone(),
            config.sync.clone(),
        ));
        let engine = Self {
            session,
            connection,
            chats,
            messages,
            outbound,
            router,
            backend,
            events,
            pump: Mutex::new(None),
        };
        (engine, rx)
    }

    /// Exchanges credentials for a session and installs it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Backend`] if the backend refuses the login.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, EngineError> {
        let response = self.backend.login(email, password).await?;
        let mut session = Session::new(response.user_id, response.token);
        if let Some(expires_at) = response.expires_at {
            session = session.with_expiry(expires_at);
        }
        self.session.begin(session.clone());
        Ok(session)
    }

    /// Starts the realtime connection for the current session.
    ///
    /// # Errors
    ///
    /// Fails if there is no active session or the connection refuses it.
    pub fn start(&self) -> Result<(), EngineError> {
        let session = self
            .session
            .current()
            .ok_or(EngineError::NotAuthenticated)?;
        {
            let mut pump = self.pump.lock();
            if pump.as_ref().is_none_or(JoinHandle::is_finished) {
                let rx = self.connection.subscribe();
                *pump = Some(tokio::spawn(self.pump_task().run(rx)));
            }
        }
        self.connection.connect(&session)?;
        Ok(())
    }

    /// Fetches the chat list and replaces local summaries with it.
    ///
    /// # Errors
    ///
    /// Returns the backend failure; an auth failure also expires the session.
    pub async fn resync(&self) -> Result<usize, EngineError> {
        resync(&*self.backend, &self.session, &self.chats, &self.events).await
    }

    /// See [`OutboundCoordinator::send_message`].
    ///
    /// # Errors
    ///
    /// As [`OutboundCoordinator::send_message`].
    pub fn send_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
    ) -> Result<PendingHandle, SendError> {
        self.outbound.send_message(chat_id, content)
    }

    /// See [`OutboundCoordinator::retry`].
    ///
    /// # Errors
    ///
    /// As [`OutboundCoordinator::retry`].
    pub fn retry(&self, temp: &ClientTempId) -> Result<PendingHandle, SendError> {
        self.outbound.retry(temp)
    }

    /// See [`OutboundCoordinator::upload_media`].
    ///
    /// # Errors
    ///
    /// As [`OutboundCoordinator::upload_media`].
    pub async fn upload_media(
        &self,
        chat_id: ChatId,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<PendingHandle, SendError> {
        self.outbound.upload_media(chat_id, file_name, bytes).await
    }

    /// Marks `chat_id` read locally and tells the server.
    pub fn mark_read(&self, chat_id: &ChatId) {
        if self.chats.clear_unread(chat_id, None) {
            self.events.emit(SyncEvent::UnreadChanged {
                chat_id: chat_id.clone(),
                unread: 0,
            });
        }
        self.connection.send(ClientFrame::Read {
            chat_id: chat_id.clone(),
            message_id: self.messages.last_confirmed_id(chat_id),
        });
    }

    /// Sends a typing indicator. Dropped while not connected.
    pub fn set_typing(&self, chat_id: &ChatId, is_typing: bool) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        self.connection.send(ClientFrame::Typing {
            chat_id: chat_id.clone(),
            is_typing,
        });
    }

    /// Closes the connection without ending the session.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Ends the session: cancels sends, closes the connection, clears state.
    pub async fn logout(&self) {
        self.outbound.shutdown();
        self.session.sign_out();
        self.connection.shutdown().await;
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.chats.clear();
        self.messages.clear();
        tracing::info!("logged out");
    }

    #[must_use]
    pub const fn session(&self) -> &SessionState {
        &self.session
    }

    #[must_use]
    pub const fn chats(&self) -> &ChatState {
        &self.chats
    }

    #[must_use]
    pub const fn messages(&self) -> &MessageState {
        &self.messages
    }

    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn pump_task(&self) -> Pump<C, B> {
        Pump {
            router: Arc::clone(&self.router),
            outbound: self.outbound.clone(),
            backend: Arc::clone(&self.backend),
            session: self.session.clone(),
            chats: self.chats.clone(),
            events: self.events.clone(),
            resyncs: JoinSet::new(),
        }
    }
}

/// Consumer of connection events.
struct Pump<C: Connector, B: Backend> {
    router: Arc<MessageRouter<C, B>>,
    outbound: OutboundCoordinator<C, B>,
    backend: Arc<B>,
    session: SessionState,
    chats: ChatState,
    events: EventSink,
    resyncs: JoinSet<()>,
}

impl<C: Connector, B: Backend> Pump<C, B> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let mut needs_resync = true;
        while let Some(event) = rx.recv().await {
            while self.resyncs.try_join_next().is_some() {}
            match event {
                ConnectionEvent::Frame(raw) => {
                    self.router.handle_frame(&raw);
                }
                ConnectionEvent::StateChanged { from, to } => {
                    self.events.emit(SyncEvent::ConnectionChanged { from, to });
                    match to {
                        ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                            needs_resync = true;
                        }
                        ConnectionState::Connected if needs_resync => {
                            needs_resync = false;
                            self.spawn_resync();
                        }
                        _ => {}
                    }
                }
                ConnectionEvent::BackpressureDrop { frame } => {
                    self.outbound.on_frame_dropped(&frame);
                    self.events.emit(SyncEvent::BackpressureDrop { frame });
                }
                ConnectionEvent::AuthExpired { reason } => {
                    self.events.emit(SyncEvent::AuthExpired { reason });
                }
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    self.events
                        .emit(SyncEvent::ReconnectScheduled { attempt, delay });
                }
                ConnectionEvent::RetriesExhausted { attempts } => {
                    self.events.emit(SyncEvent::ConnectionLost { attempts });
                }
            }
        }
        tracing::debug!("connection event stream closed");
    }

    fn spawn_resync(&mut self) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let chats = self.chats.clone();
        let events = self.events.clone();
        self.resyncs.spawn(async move {
            if let Err(e) = resync(&*backend, &session, &chats, &events).await {
                tracing::debug!(error = %e, "resync task ended");
            }
        });
    }
}

async fn resync<B: Backend>(
    backend: &B,
    session: &SessionState,
    chats: &ChatState,
    events: &EventSink,
) -> Result<usize, EngineError> {
    let token = session
        .current()
        .map(|s| s.token)
        .ok_or(EngineError::NotAuthenticated)?;
    match backend.get_chats(&token).await {
        Ok(list) => {
            let count = list.len();
            chats.replace_all(list);
            tracing::info!(count, "chat list resynced");
            events.emit(SyncEvent::ChatsReplaced { count });
            Ok(count)
        }
        Err(e) => {
            tracing::warn!(error = %e, "chat list resync failed");
            if e.is_auth() {
                session.expire(e.to_string());
            }
            events.emit(SyncEvent::ResyncFailed {
                reason: e.to_string(),
            });
            Err(e.into())
        }
    }
}
