//! Authentication state shared by every component that talks to the server.
//!
//! [`SessionState`] is a cloneable handle over a `watch` channel. The
//! connection supervisor subscribes to it so that a sign-out or an expired
//! token halts reconnection without polling.

use std::sync::Arc;

use tokio::sync::watch;

use kirpich_proto::ids::{Timestamp, UserId};

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    /// Bearer token. Empty means no token was issued.
    pub token: String,
    /// When the server stops accepting `token`, if known.
    pub expires_at: Option<Timestamp>,
}

impl Session {
    #[must_use]
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub const fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub const fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lifecycle of the local session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// No credentials. Initial state and the state after logout.
    #[default]
    SignedOut,
    /// Credentials are believed valid.
    Active(Session),
    /// The server rejected the token. A new login is required.
    Expired {
        /// Why the session ended.
        reason: String,
    },
}

impl SessionStatus {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Shared handle to the current session.
#[derive(Debug, Clone)]
pub struct SessionState {
    tx: Arc<watch::Sender<SessionStatus>>,
}

impl SessionState {
    /// Creates a signed-out session state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(SessionStatus::SignedOut)),
        }
    }

    /// Installs a freshly issued session.
    pub fn begin(&self, session: Session) {
        tracing::info!(user = %session.user_id, "session started");
        self.tx.send_replace(SessionStatus::Active(session));
    }

    /// Returns the active session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        match &*self.tx.borrow() {
            SessionStatus::Active(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Returns the local user's id while a session is active.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        match &*self.tx.borrow() {
            SessionStatus::Active(session) => Some(session.user_id.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tx.borrow().is_active()
    }

    /// Marks an active session as expired.
    ///
    /// Returns `false` if there was no active session, so repeated
    /// expiry signals collapse into one transition.
    pub fn expire(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let expired = self.tx.send_if_modified(|status| {
            if status.is_active() {
                *status = SessionStatus::Expired {
                    reason: reason.clone(),
                };
                true
            } else {
                false
            }
        });
        if expired {
            tracing::warn!(%reason, "session expired");
        }
        expired
    }

    /// Clears the session unconditionally.
    pub fn sign_out(&self) {
        let previous = self.tx.send_replace(SessionStatus::SignedOut);
        if previous != SessionStatus::SignedOut {
            tracing::info!("signed out");
        }
    }

    /// Subscribes to session changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
