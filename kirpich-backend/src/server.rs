//! HTTP and WebSocket surface of the development backend.
//!
//! REST endpoints follow [`kirpich_proto::api`]. The realtime endpoint is
//! `GET /ws?token=...`; every connection belongs to one authenticated user
//! and receives the frames of [`kirpich_proto::frame::ServerFrame`].
//!
//! Every chat is visible to every user. New messages and read receipts are
//! broadcast to all connections; typing and presence go to other users only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use kirpich_proto::api::{
    self, ApiError, LoginRequest, LoginResponse, NotifyRequest, SendMessageRequest,
    SendMessageResponse, UploadMediaRequest, UploadMediaResponse,
};
use kirpich_proto::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use kirpich_proto::frame::{
    ClientFrame, PresenceUpdate, ReadReceipt, SendAck, ServerError, ServerFrame, TypingIndicator,
};
use kirpich_proto::ids::{ChatId, ClientTempId, Timestamp, UserId};
use kirpich_proto::message::{ChatSummary, Message as ChatMessage};

use crate::store::{Posted, Store, StoreError};

/// Upload bodies are JSON byte arrays, several times larger than the file.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

struct Conn {
    user_id: UserId,
    tx: mpsc::UnboundedSender<Message>,
}

/// Shared server state: the data store and the live realtime connections.
pub struct BackendState {
    pub store: Store,
    connections: RwLock<HashMap<u64, Conn>>,
    next_conn: AtomicU64,
    max_frame_size: usize,
    notifications: RwLock<Vec<(UserId, NotifyRequest)>>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_FRAME_SIZE, Store::default())
    }

    #[must_use]
    pub fn with_config(max_frame_size: usize, store: Store) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            max_frame_size,
            notifications: RwLock::new(Vec::new()),
        }
    }

    async fn register(&self, user_id: UserId, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .await
            .insert(conn_id, Conn { user_id, tx });
        conn_id
    }

    /// Removes a connection. Returns `true` if its user still has another
    /// connection open.
    async fn unregister(&self, conn_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        let Some(conn) = conns.remove(&conn_id) else {
            return false;
        };
        conns.values().any(|c| c.user_id == conn.user_id)
    }

    /// Number of open realtime connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn send_to(&self, conn_id: u64, frame: &ServerFrame) {
        let Some(msg) = text_message(frame) else {
            return;
        };
        if let Some(conn) = self.connections.read().await.get(&conn_id) {
            let _ = conn.tx.send(msg);
        }
    }

    async fn broadcast(&self, frame: &ServerFrame) {
        self.broadcast_filtered(frame, |_| true).await;
    }

    async fn broadcast_except(&self, user_id: &UserId, frame: &ServerFrame) {
        self.broadcast_filtered(frame, |conn| &conn.user_id != user_id)
            .await;
    }

    async fn broadcast_filtered(&self, frame: &ServerFrame, include: impl Fn(&Conn) -> bool) {
        let Some(msg) = text_message(frame) else {
            return;
        };
        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter().filter(|(_, c)| include(c)) {
            if conn.tx.send(msg.clone()).is_err() {
                tracing::debug!(conn_id, "connection writer gone, skipping");
            }
        }
    }

    async fn publish(&self, posted: &Posted) {
        if posted.duplicate {
            return;
        }
        self.broadcast(&ServerFrame::NewMessage {
            message: posted.message.clone(),
        })
        .await;
    }

    /// Invalidates every token and tells each connected client its session
    /// expired, then closes the connections.
    pub async fn revoke_all_sessions(&self, reason: &str) -> usize {
        let revoked = self.store.revoke_all().await;
        let frame = ServerFrame::AuthExpired {
            reason: reason.to_owned(),
        };
        let expired = text_message(&frame);
        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter() {
            tracing::info!(conn_id, user = %conn.user_id, "expiring session");
            if let Some(msg) = &expired {
                let _ = conn.tx.send(msg.clone());
            }
            let _ = conn.tx.send(Message::Close(None));
        }
        revoked
    }

    /// Send a WebSocket Close frame to every connection without touching
    /// tokens, so clients see a plain link loss.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter() {
            tracing::info!(conn_id, user = %conn.user_id, "sending close frame");
            let _ = conn.tx.send(Message::Close(None));
        }
    }

    /// Notifications posted through `POST /api/notify`, oldest first.
    pub async fn notifications(&self) -> Vec<(UserId, NotifyRequest)> {
        self.notifications.read().await.clone()
    }
}

fn text_message(frame: &ServerFrame) -> Option<Message> {
    match codec::encode(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, kind = %frame.kind(), "failed to encode frame");
            None
        }
    }
}

/// An error response with an [`ApiError`] body.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    reason: String,
}

impl ApiFailure {
    fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for ApiFailure {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::InvalidCredentials | StoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            StoreError::Invalid(_) | StoreError::EmptyUpload => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(ApiError::new(self.reason))).into_response()
    }
}

async fn authorize(state: &BackendState, headers: &HeaderMap) -> Result<UserId, ApiFailure> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiFailure::new(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    Ok(state.store.authorize(token).await?)
}

async fn login(
    State(state): State<Arc<BackendState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiFailure> {
    Ok(Json(state.store.login(&request.email, &request.password).await?))
}

async fn chats(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, ApiFailure> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.chats_for(&user).await))
}

async fn send_message(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiFailure> {
    let user = authorize(&state, &headers).await?;
    let posted = state
        .store
        .post_message(&user, &request.chat_id, &request.content, &request.client_temp_id)
        .await?;
    state.publish(&posted).await;
    Ok(Json(SendMessageResponse {
        message_id: posted.message.id,
        timestamp: posted.message.timestamp,
    }))
}

async fn upload_media(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(request): Json<UploadMediaRequest>,
) -> Result<Json<UploadMediaResponse>, ApiFailure> {
    let user = authorize(&state, &headers).await?;
    if request.file_name.is_empty() || request.file_name.contains('/') {
        return Err(ApiFailure::new(StatusCode::BAD_REQUEST, "invalid file name"));
    }
    let size = request.bytes.len();
    state
        .store
        .store_media(&request.chat_id, &request.file_name, request.bytes)
        .await?;
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    tracing::info!(user = %user, chat = %request.chat_id, size, "media uploaded");
    Ok(Json(UploadMediaResponse {
        media_url: format!(
            "http://{host}/media/{}/{}",
            request.chat_id, request.file_name
        ),
    }))
}

async fn media(
    State(state): State<Arc<BackendState>>,
    Path((chat_id, file_name)): Path<(String, String)>,
) -> Result<Vec<u8>, ApiFailure> {
    state
        .store
        .media(&ChatId::new(chat_id), &file_name)
        .await
        .ok_or_else(|| ApiFailure::new(StatusCode::NOT_FOUND, "no such file"))
}

async fn notify(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(request): Json<NotifyRequest>,
) -> Result<StatusCode, ApiFailure> {
    let user = authorize(&state, &headers).await?;
    tracing::info!(user = %user, title = %request.title, "notification");
    state.notifications.write().await.push((user, request));
    Ok(StatusCode::NO_CONTENT)
}

/// Upgrades to a WebSocket once the `token` query parameter checks out.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BackendState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = params
        .get(api::TOKEN_QUERY_PARAM)
        .map_or("", String::as_str);
    match state.store.authorize(token).await {
        Ok(user_id) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, user_id))
            .into_response(),
        Err(e) => {
            tracing::warn!("realtime connection refused: {e}");
            ApiFailure::from(e).into_response()
        }
    }
}

/// Runs one realtime connection until either side closes it.
pub async fn handle_socket(socket: WebSocket, state: Arc<BackendState>, user_id: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register(user_id.clone(), tx).await;
    tracing::info!(conn_id, user = %user_id, "client connected");

    state
        .broadcast_except(
            &user_id,
            &ServerFrame::OnlineStatus(PresenceUpdate {
                user_id: user_id.clone(),
                is_online: true,
                last_seen: None,
            }),
        )
        .await;

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user_id.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text(conn_id, &reader_user, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    let still_online = state.unregister(conn_id).await;
    tracing::info!(conn_id, user = %user_id, "client disconnected");
    if !still_online {
        state
            .broadcast_except(
                &user_id,
                &ServerFrame::OnlineStatus(PresenceUpdate {
                    user_id: user_id.clone(),
                    is_online: false,
                    last_seen: Some(Timestamp::now()),
                }),
            )
            .await;
    }
}

async fn handle_text(conn_id: u64, user_id: &UserId, text: &str, state: &BackendState) {
    let frame: ClientFrame = match codec::decode_bounded(text, state.max_frame_size) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "rejecting client frame");
            state
                .send_to(conn_id, &rejection(None, "bad_frame", e.to_string()))
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Message(outgoing) => {
            let result = state
                .store
                .post_message(
                    user_id,
                    &outgoing.chat_id,
                    &outgoing.content,
                    &outgoing.client_temp_id,
                )
                .await;
            match result {
                Ok(posted) => {
                    state
                        .send_to(conn_id, &ack(&posted.message, outgoing.client_temp_id))
                        .await;
                    state.publish(&posted).await;
                }
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "message rejected");
                    state
                        .send_to(
                            conn_id,
                            &rejection(Some(outgoing.client_temp_id), e.code(), e.to_string()),
                        )
                        .await;
                }
            }
        }
        ClientFrame::Read {
            chat_id,
            message_id,
        } => {
            let last = state
                .store
                .mark_read(user_id, &chat_id, message_id.as_ref())
                .await;
            state
                .broadcast(&ServerFrame::Read(ReadReceipt {
                    chat_id,
                    user_id: user_id.clone(),
                    message_id: last,
                    unread_count: Some(0),
                }))
                .await;
        }
        ClientFrame::Typing { chat_id, is_typing } => {
            state
                .broadcast_except(
                    user_id,
                    &ServerFrame::Typing(TypingIndicator {
                        chat_id,
                        user_id: user_id.clone(),
                        is_typing,
                    }),
                )
                .await;
        }
        ClientFrame::Ping { timestamp } => {
            state.send_to(conn_id, &ServerFrame::Pong { timestamp }).await;
        }
    }
}

fn ack(message: &ChatMessage, client_temp_id: ClientTempId) -> ServerFrame {
    ServerFrame::Ack(SendAck {
        client_temp_id,
        message_id: message.id.clone(),
        chat_id: message.chat_id.clone(),
        timestamp: message.timestamp,
    })
}

fn rejection(client_temp_id: Option<ClientTempId>, code: &str, reason: String) -> ServerFrame {
    ServerFrame::Error(ServerError {
        client_temp_id,
        code: code.to_owned(),
        reason,
    })
}

/// Builds the axum router over `state`.
pub fn router(state: Arc<BackendState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route(api::LOGIN_PATH, post(login))
        .route(api::CHATS_PATH, get(chats))
        .route(api::MESSAGES_PATH, post(send_message))
        .route(api::MEDIA_PATH, post(upload_media))
        .route(api::NOTIFY_PATH, post(notify))
        .route("/media/{chat_id}/{file_name}", get(media))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .with_state(state)
}

/// Starts the backend on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BackendState::new())).await
}

/// Starts the backend with a pre-configured [`BackendState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BackendState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "backend server error");
        }
    });

    Ok((bound_addr, handle))
}
