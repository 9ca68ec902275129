//! WebSocket connector for the realtime endpoint.
//!
//! The session token travels as a `token` query parameter. A 401 or 403
//! handshake response becomes [`TransportError::Unauthorized`] so the
//! connection manager can stop retrying instead of backing off.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use kirpich_proto::api::TOKEN_QUERY_PARAM;

use super::{Connector, Link, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default capacity of each direction of a link.
const DEFAULT_LINK_BUFFER: usize = 256;

/// Opens WebSocket links.
#[derive(Debug, Clone)]
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: DEFAULT_LINK_BUFFER,
        }
    }

    /// Sets the per-direction channel capacity.
    #[must_use]
    pub const fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = if buffer == 0 { 1 } else { buffer };
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str, token: &str) -> Result<Link, TransportError> {
        let url = endpoint_with_token(endpoint, token)?;
        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(endpoint, err = %e, "WebSocket connect failed");
            map_ws_connect_error(e, endpoint)
        })?;
        tracing::debug!(endpoint, "WebSocket handshake complete");

        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        let pump = tokio::spawn(pump(stream, out_rx, in_tx));
        Ok(Link::new(out_tx, in_rx, Some(pump.abort_handle())))
    }
}

/// Appends the token query parameter to `endpoint`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidEndpoint`] if `endpoint` is not a URL.
pub fn endpoint_with_token(endpoint: &str, token: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);
    Ok(url)
}

/// Moves frames between the link channels and the socket.
///
/// Exits when the socket closes or errors, or when the link is dropped.
/// Exiting drops `in_tx`, which the link observes as closure.
async fn pump(stream: WsStream, mut out_rx: mpsc::Receiver<String>, in_tx: mpsc::Sender<String>) {
    let (mut sink, mut reader) = stream.split();
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::warn!(err = %e, "WebSocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => tracing::warn!(len = data.len(), "non-UTF-8 binary frame, skipping"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "WebSocket read error");
                    break;
                }
                None => break,
            },
        }
    }
    tracing::debug!("WebSocket pump exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error, endpoint: &str) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(endpoint.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::Unauthorized(format!("handshake rejected with status {status}"))
            } else {
                TransportError::Io(std::io::Error::other(format!(
                    "HTTP error during handshake: status {status}"
                )))
            }
        }
        WsError::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
