//! Request/response boundary to the REST backend.
//!
//! Defines the [`Backend`] trait used for login, chat list fetches, the
//! request-routed send path, media uploads and notifications. Concrete
//! implementations:
//! - [`http::HttpBackend`]: JSON over HTTP via `reqwest`
//! - [`memory::InMemoryBackend`]: scripted in-process backend for testing

pub mod http;
pub mod memory;

use kirpich_proto::api::{
    LoginResponse, SendMessageRequest, SendMessageResponse, UploadMediaRequest,
    UploadMediaResponse,
};
use kirpich_proto::message::ChatSummary;

/// Errors that can occur when calling the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The credentials or token were rejected (401/403).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request was understood and refused.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached or did not answer in time.
    #[error("backend unreachable: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether this error means the session is no longer valid.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Async REST backend.
///
/// Every call except [`login`](Backend::login) authenticates with the
/// session token.
pub trait Backend: Send + Sync + 'static {
    /// Exchange credentials for a session token.
    fn login(
        &self,
        email: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<LoginResponse, BackendError>> + Send;

    /// Fetch the full chat list.
    fn get_chats(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ChatSummary>, BackendError>> + Send;

    /// Post a message outside the realtime connection.
    fn send_message(
        &self,
        token: &str,
        request: &SendMessageRequest,
    ) -> impl std::future::Future<Output = Result<SendMessageResponse, BackendError>> + Send;

    /// Upload a file and get back its URL.
    fn upload_media(
        &self,
        token: &str,
        request: &UploadMediaRequest,
    ) -> impl std::future::Future<Output = Result<UploadMediaResponse, BackendError>> + Send;

    /// Ask the backend to raise a user-visible notification.
    fn notify(
        &self,
        token: &str,
        title: &str,
        body: &str,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}
