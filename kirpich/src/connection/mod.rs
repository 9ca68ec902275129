//! Persistent realtime connection with automatic reconnection.
//!
//! [`ConnectionManager`] owns exactly one live [`Link`] at a time. A
//! background supervisor task opens the link, drains the outbox into it,
//! forwards inbound frames to subscribers, sends heartbeats, and on loss
//! schedules a reconnect with exponential backoff.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                        │   ▲               │
//!      │                  fail  │   │ delay         │ lost / idle
//!      │                        ▼   │               ▼
//!      └── disconnect() / ── Reconnecting ◄─────────┘
//!          session ended
//! ```
//!
//! Every outgoing frame goes through the outbox, so frames sent while the
//! link is down are delivered in order once it is back. The outbox is
//! bounded; overflow evicts the oldest frame and reports it as
//! [`ConnectionEvent::BackpressureDrop`].
//!
//! The supervisor watches [`SessionState`]. A sign-out stops it silently;
//! an expired session stops it and emits [`ConnectionEvent::AuthExpired`].
//! Nothing reconnects after either until `connect` is called again.

pub mod backoff;
pub mod outbox;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use kirpich_proto::codec;
use kirpich_proto::frame::ClientFrame;
use kirpich_proto::ids::Timestamp;

use crate::config::ConnectionConfig;
use crate::session::{Session, SessionState, SessionStatus};
use crate::transport::{Connector, Link, TransportError};

use self::backoff::Backoff;
use self::outbox::Outbox;

/// Lifecycle of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Events published to every subscriber of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The state changed. Never emitted for a self-transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A raw inbound text frame.
    Frame(String),
    /// The outbox overflowed and this frame was evicted unsent.
    BackpressureDrop { frame: ClientFrame },
    /// The session expired; the connection stopped and will not retry.
    AuthExpired { reason: String },
    /// A reconnect attempt will be made after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// `attempts` consecutive attempts failed. Reported once per outage;
    /// reconnection continues.
    RetriesExhausted { attempts: u32 },
}

/// Errors returned by [`ConnectionManager::connect`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The session carries no token.
    #[error("session has no token")]
    MissingToken,

    /// The token is already past its expiry.
    #[error("session token has expired")]
    SessionExpired,

    /// `SessionState` has no active session.
    #[error("no active session")]
    SessionInactive,
}

/// Handle to the realtime connection. Cheap to clone.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C> {
    connector: C,
    endpoint: String,
    config: ConnectionConfig,
    session: SessionState,
    state: watch::Sender<ConnectionState>,
    outbox: Mutex<Outbox>,
    outbox_ready: Notify,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    supervisor: Mutex<Option<Supervisor>>,
}

struct Supervisor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Why a live link stopped being serviced.
enum LinkEnd {
    Stopped,
    SessionEnded(SessionStatus),
    Lost(String),
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a disconnected manager for `endpoint`.
    #[must_use]
    pub fn new(
        connector: C,
        endpoint: impl Into<String>,
        session: SessionState,
        config: ConnectionConfig,
    ) -> Self {
        let outbox = Outbox::new(config.outbox_capacity);
        Self {
            shared: Arc::new(Shared {
                connector,
                endpoint: endpoint.into(),
                config,
                session,
                state: watch::Sender::new(ConnectionState::Disconnected),
                outbox: Mutex::new(outbox),
                outbox_ready: Notify::new(),
                subscribers: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Starts connecting and returns immediately.
    ///
    /// The state moves to `Connecting` before this returns; progress after
    /// that is reported through [`subscribe`](Self::subscribe). Calling
    /// this while a supervisor is already running is a no-op.
    ///
    /// # Errors
    ///
    /// Fails fast, without any network attempt, if the session has no
    /// token, has expired, or is not the active session.
    pub fn connect(&self, session: &Session) -> Result<(), ConnectError> {
        if !session.has_token() {
            return Err(ConnectError::MissingToken);
        }
        if session.is_expired_at(Timestamp::now()) {
            self.shared.session.expire("session token expired");
            return Err(ConnectError::SessionExpired);
        }
        if !self.shared.session.is_active() {
            return Err(ConnectError::SessionInactive);
        }

        let mut slot = self.shared.supervisor.lock();
        if slot.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            tracing::debug!("connect called while already running");
            return Ok(());
        }
        self.shared.transition(ConnectionState::Connecting);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), stop_rx));
        *slot = Some(Supervisor {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Queues a frame for transmission.
    ///
    /// Frames are written in order whenever a link is up. If the outbox is
    /// full the oldest queued frame is evicted and reported.
    pub fn send(&self, frame: ClientFrame) {
        let evicted = self.shared.outbox.lock().push(frame);
        if let Some(frame) = evicted {
            tracing::warn!(kind = frame.kind(), "outbox full, dropping oldest frame");
            self.shared
                .publish(ConnectionEvent::BackpressureDrop { frame });
        }
        self.shared.outbox_ready.notify_one();
    }

    /// Closes the link and stops reconnecting. Queued frames are kept.
    pub async fn disconnect(&self) {
        let supervisor = self.shared.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.stop.send(());
            if let Err(e) = supervisor.handle.await
                && !e.is_cancelled()
            {
                tracing::error!(err = %e, "connection supervisor panicked");
            }
        }
        self.shared.transition(ConnectionState::Disconnected);
    }

    /// Disconnects and discards every queued frame.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        let dropped = {
            let mut outbox = self.shared.outbox.lock();
            let len = outbox.len();
            outbox.clear();
            len
        };
        if dropped > 0 {
            tracing::info!(dropped, "discarded queued frames on shutdown");
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observes state changes without consuming other events.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Registers a new event subscriber.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Number of frames waiting in the outbox.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.outbox.lock().len()
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }
}

impl<C: Connector> Shared<C> {
    fn transition(&self, to: ConnectionState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            if *current == to {
                false
            } else {
                from = *current;
                *current = to;
                true
            }
        });
        if changed {
            tracing::info!(%from, %to, "connection state changed");
            self.publish(ConnectionEvent::StateChanged { from, to });
        }
    }

    fn publish(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Stops after the session ended, reporting expiry.
    fn halt(&self, status: &SessionStatus) {
        self.transition(ConnectionState::Disconnected);
        if let SessionStatus::Expired { reason } = status {
            self.publish(ConnectionEvent::AuthExpired {
                reason: reason.clone(),
            });
        }
    }

    /// Writes every queued frame to `link`, oldest first.
    async fn flush_outbox(&self, link: &Link) -> Result<usize, TransportError> {
        let mut written = 0;
        loop {
            let Some(frame) = self.outbox.lock().pop_front() else {
                return Ok(written);
            };
            let text = match codec::encode(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(kind = frame.kind(), err = %e, "unencodable frame dropped");
                    continue;
                }
            };
            if let Err(e) = link.send(text).await {
                self.outbox.lock().requeue(frame);
                return Err(e);
            }
            written += 1;
        }
    }

    /// Services one live link until it is lost, stopped, or the session ends.
    async fn run_link(
        &self,
        mut link: Link,
        stop: &mut oneshot::Receiver<()>,
        session_rx: &mut watch::Receiver<SessionStatus>,
    ) -> LinkEnd {
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            match self.flush_outbox(&link).await {
                Ok(0) => {}
                Ok(written) => tracing::debug!(written, "flushed outbox"),
                Err(e) => return LinkEnd::Lost(format!("write failed: {e}")),
            }

            tokio::select! {
                biased;
                _ = &mut *stop => return LinkEnd::Stopped,
                status = session_ended(session_rx) => return LinkEnd::SessionEnded(status),
                frame = link.recv() => match frame {
                    Some(text) => {
                        last_inbound = Instant::now();
                        self.publish(ConnectionEvent::Frame(text));
                    }
                    None => return LinkEnd::Lost("closed by server".into()),
                },
                () = self.outbox_ready.notified() => {}
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= self.config.idle_timeout {
                        link.abort();
                        return LinkEnd::Lost("idle timeout".into());
                    }
                    let ping = ClientFrame::Ping { timestamp: Timestamp::now() };
                    match codec::encode(&ping) {
                        Ok(text) => {
                            if let Err(e) = link.send(text).await {
                                return LinkEnd::Lost(format!("heartbeat failed: {e}"));
                            }
                        }
                        Err(e) => tracing::warn!(err = %e, "failed to encode heartbeat"),
                    }
                }
            }
        }
    }
}

/// Resolves once the session is no longer active.
async fn session_ended(rx: &mut watch::Receiver<SessionStatus>) -> SessionStatus {
    loop {
        {
            let status = rx.borrow_and_update();
            if !status.is_active() {
                return status.clone();
            }
        }
        if rx.changed().await.is_err() {
            return SessionStatus::SignedOut;
        }
    }
}

/// Connect, service, and reconnect until stopped or the session ends.
async fn supervise<C: Connector>(shared: Arc<Shared<C>>, mut stop: oneshot::Receiver<()>) {
    let mut session_rx = shared.session.subscribe();
    let mut backoff = Backoff::new(shared.config.reconnect.clone());
    let mut outage_attempts: u32 = 0;
    let mut exhausted_reported = false;

    loop {
        shared.transition(ConnectionState::Connecting);

        let token = match shared.session.status() {
            SessionStatus::Active(session) if session.is_expired_at(Timestamp::now()) => {
                shared.session.expire("session token expired");
                shared.halt(&shared.session.status());
                return;
            }
            SessionStatus::Active(session) => session.token,
            status => {
                shared.halt(&status);
                return;
            }
        };

        tracing::debug!(endpoint = %shared.endpoint, attempt = outage_attempts, "opening link");
        let attempt = tokio::time::timeout(
            shared.config.connect_timeout,
            shared.connector.connect(&shared.endpoint, &token),
        );
        let result = tokio::select! {
            biased;
            _ = &mut stop => {
                shared.transition(ConnectionState::Disconnected);
                return;
            }
            status = session_ended(&mut session_rx) => {
                shared.halt(&status);
                return;
            }
            result = attempt => result,
        };

        match result {
            Ok(Ok(link)) => {
                outage_attempts = 0;
                exhausted_reported = false;
                shared.transition(ConnectionState::Connected);
                let connected_at = Instant::now();
                match shared.run_link(link, &mut stop, &mut session_rx).await {
                    LinkEnd::Stopped => {
                        shared.transition(ConnectionState::Disconnected);
                        return;
                    }
                    LinkEnd::SessionEnded(status) => {
                        shared.halt(&status);
                        return;
                    }
                    LinkEnd::Lost(reason) => {
                        tracing::warn!(%reason, "connection lost");
                        if connected_at.elapsed() >= shared.config.reconnect.stability_threshold {
                            backoff.reset();
                        }
                    }
                }
            }
            Ok(Err(TransportError::Unauthorized(reason))) => {
                tracing::warn!(%reason, "endpoint rejected session token");
                shared.session.expire(reason);
                shared.halt(&shared.session.status());
                return;
            }
            Ok(Err(e)) => tracing::warn!(err = %e, "connect attempt failed"),
            Err(_) => tracing::warn!(
                timeout = ?shared.config.connect_timeout,
                "connect attempt timed out"
            ),
        }

        outage_attempts = outage_attempts.saturating_add(1);
        shared.transition(ConnectionState::Reconnecting);
        if let Some(max) = shared.config.reconnect.max_attempts
            && outage_attempts > max
            && !exhausted_reported
        {
            exhausted_reported = true;
            tracing::warn!(attempts = max, "reconnect attempts exhausted, still retrying");
            shared.publish(ConnectionEvent::RetriesExhausted { attempts: max });
        }
        let delay = backoff.next_delay();
        tracing::info!(attempt = outage_attempts, ?delay, "reconnect scheduled");
        shared.publish(ConnectionEvent::ReconnectScheduled {
            attempt: outage_attempts,
            delay,
        });

        tokio::select! {
            biased;
            _ = &mut stop => {
                shared.transition(ConnectionState::Disconnected);
                return;
            }
            status = session_ended(&mut session_rx) => {
                shared.halt(&status);
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
