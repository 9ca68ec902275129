//! HTTP implementation of [`Backend`].

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use kirpich_proto::api::{
    self, ApiError, LoginRequest, LoginResponse, NotifyRequest, SendMessageRequest,
    SendMessageResponse, UploadMediaRequest, UploadMediaResponse,
};
use kirpich_proto::message::ChatSummary;

use super::{Backend, BackendError};

/// JSON-over-HTTP client for the REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    /// Creates a client for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Transport`] if `base_url` is not a valid URL
    /// or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base_url)
            .map_err(|e| BackendError::Transport(format!("invalid API URL {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Transport(format!("invalid path {path}: {e}")))
    }

    async fn post_raw<Req: Serialize + Sync>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &Req,
    ) -> Result<reqwest::Response, BackendError> {
        let mut request = self.client.post(self.url(path)?).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        check(path, response).await
    }

    async fn post<Req, Resp>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &Req,
    ) -> Result<Resp, BackendError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self.post_raw(path, token, body).await?;
        response.json().await.map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str, token: &str) -> Result<Resp, BackendError> {
        let response = self
            .client
            .get(self.url(path)?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check(path, response).await?;
        response.json().await.map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Passes a success response through, or turns the error body into a
/// [`BackendError`].
async fn check(path: &str, response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.error)
        .unwrap_or_else(|_| if body.is_empty() { status.to_string() } else { body });
    tracing::warn!(path, %status, %reason, "backend request failed");
    Err(map_status(status, reason))
}

/// Maps a non-success HTTP status to a [`BackendError`].
#[must_use]
pub fn map_status(status: StatusCode, reason: String) -> BackendError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(reason),
        s if s.is_client_error() => BackendError::Rejected(reason),
        _ => BackendError::Transport(format!("{status}: {reason}")),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

impl Backend for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, BackendError> {
        let request = LoginRequest {
            email: email.to_owned(),
            password: password.to_owned(),
        };
        self.post(api::LOGIN_PATH, None, &request).await
    }

    async fn get_chats(&self, token: &str) -> Result<Vec<ChatSummary>, BackendError> {
        self.get(api::CHATS_PATH, token).await
    }

    async fn send_message(
        &self,
        token: &str,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, BackendError> {
        self.post(api::MESSAGES_PATH, Some(token), request).await
    }

    async fn upload_media(
        &self,
        token: &str,
        request: &UploadMediaRequest,
    ) -> Result<UploadMediaResponse, BackendError> {
        self.post(api::MEDIA_PATH, Some(token), request).await
    }

    async fn notify(&self, token: &str, title: &str, body: &str) -> Result<(), BackendError> {
        let request = NotifyRequest {
            title: title.to_owned(),
            body: body.to_owned(),
        };
        self.post_raw(api::NOTIFY_PATH, Some(token), &request).await?;
        Ok(())
    }
}
