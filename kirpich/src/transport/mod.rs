//! Transport layer for the realtime connection.
//!
//! A [`Connector`] opens a [`Link`]: a pair of text-frame channels backed by
//! whatever carries the bytes. Concrete implementations:
//! - [`ws::WsConnector`]: WebSocket connection to the realtime endpoint
//! - [`loopback::LoopbackConnector`]: in-process channels for testing
//!
//! Links know nothing about sessions or reconnection; the
//! [`ConnectionManager`](crate::connection::ConnectionManager) owns that.

pub mod loopback;
pub mod ws;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint refused or could not be reached.
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    /// The endpoint rejected the session token.
    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens links to a realtime endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Open a link to `endpoint`, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unauthorized`] when the endpoint rejects
    /// the token; any other variant is treated as a transient failure.
    fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Link, TransportError>> + Send;
}

/// One open connection, carrying JSON text frames in both directions.
///
/// Dropping the link closes it: the outgoing channel is released, which
/// tells the background pump (if any) to close the underlying stream.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
    pump: Option<AbortHandle>,
}

impl Link {
    /// Assembles a link from its channel halves.
    ///
    /// `pump` is the task moving frames between the channels and the wire,
    /// if the transport needs one.
    #[must_use]
    pub const fn new(
        outgoing: mpsc::Sender<String>,
        incoming: mpsc::Receiver<String>,
        pump: Option<AbortHandle>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            pump,
        }
    }

    /// Hands a frame to the transport.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the far side is gone.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(text)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Waits for the next inbound frame. `None` means the link is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Tears the link down without a close handshake.
    pub fn abort(self) {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}
