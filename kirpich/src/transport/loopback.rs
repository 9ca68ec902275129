//! Loopback connector for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels in place of a socket.
//! Each successful connect hands the test a [`ServerEnd`] through
//! [`LoopbackServer::accept`]; the test then plays the server by pushing
//! frames and reading what the client sent. Dropping the `ServerEnd`
//! closes the link, which the client observes as a lost connection.
//!
//! Connect outcomes can be scripted per attempt with
//! [`LoopbackConnector::script`]; once the script runs out every attempt
//! is accepted.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use kirpich_proto::codec;
use kirpich_proto::frame::{ClientFrame, ServerFrame};

use super::{Connector, Link, TransportError};

/// Scripted result of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Open a link and hand its server side to the test.
    Accept,
    /// Fail as if the endpoint were unreachable.
    Fail,
    /// Reject the token.
    Reject(String),
    /// Never complete, so the caller's connect timeout fires.
    Hang,
}

#[derive(Debug)]
struct Shared {
    script: VecDeque<ConnectOutcome>,
    tokens: Vec<String>,
    buffer: usize,
}

/// In-process [`Connector`] backed by channels.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    shared: Arc<Mutex<Shared>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

/// Receives the server side of every accepted link.
#[derive(Debug)]
pub struct LoopbackServer {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl LoopbackConnector {
    /// Creates a connector and the server handle that receives its links.
    #[must_use]
    pub fn new() -> (Self, LoopbackServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Mutex::new(Shared {
                script: VecDeque::new(),
                tokens: Vec::new(),
                buffer: 64,
            })),
            accepted: accepted_tx,
        };
        (
            connector,
            LoopbackServer {
                accepted: accepted_rx,
            },
        )
    }

    /// Queues outcomes for the next connect attempts, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.shared.lock().script.extend(outcomes);
    }

    /// Number of connect attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.shared.lock().tokens.len()
    }

    /// Tokens presented on each attempt, oldest first.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.shared.lock().tokens.clone()
    }
}

impl Connector for LoopbackConnector {
    async fn connect(&self, endpoint: &str, token: &str) -> Result<Link, TransportError> {
        let (outcome, buffer) = {
            let mut shared = self.shared.lock();
            shared.tokens.push(token.to_owned());
            (
                shared.script.pop_front().unwrap_or(ConnectOutcome::Accept),
                shared.buffer,
            )
        };
        tracing::debug!(endpoint, ?outcome, "loopback connect");

        match outcome {
            ConnectOutcome::Accept => {}
            ConnectOutcome::Fail => return Err(TransportError::Unreachable(endpoint.to_owned())),
            ConnectOutcome::Reject(reason) => return Err(TransportError::Unauthorized(reason)),
            ConnectOutcome::Hang => {
                std::future::pending::<()>().await;
            }
        }

        let (to_server, from_client) = mpsc::channel(buffer);
        let (to_client, from_server) = mpsc::channel(buffer);
        let end = ServerEnd {
            token: token.to_owned(),
            to_client,
            from_client,
        };
        self.accepted
            .send(end)
            .map_err(|_| TransportError::Unreachable(endpoint.to_owned()))?;
        Ok(Link::new(to_server, from_server, None))
    }
}

impl LoopbackServer {
    /// Waits for the next accepted link.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }
}

/// The server side of one loopback link.
#[derive(Debug)]
pub struct ServerEnd {
    /// Token the client connected with.
    pub token: String,
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl ServerEnd {
    /// Pushes a frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client dropped the link.
    pub async fn push(&self, frame: &ServerFrame) -> Result<(), TransportError> {
        let text = codec::encode(frame).map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        self.push_raw(text).await
    }

    /// Pushes raw text, which need not be a valid frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client dropped the link.
    pub async fn push_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.to_client
            .send(text.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Waits for the next frame from the client, skipping undecodable text.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        loop {
            let text = self.from_client.recv().await?;
            match codec::decode(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(err = %e, "loopback server got malformed frame"),
            }
        }
    }

    /// Waits for the next frame that is not a heartbeat.
    pub async fn recv_non_ping(&mut self) -> Option<ClientFrame> {
        loop {
            match self.recv().await? {
                ClientFrame::Ping { .. } => {}
                frame => return Some(frame),
            }
        }
    }

    /// Returns a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        let text = self.from_client.try_recv().ok()?;
        codec::decode(&text).ok()
    }
}
