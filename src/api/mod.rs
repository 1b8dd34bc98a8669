//! Client of the time-tracking server: timeline listing, change-log submission and the
//! password login exchange. [TimelineApi] is the seam the daemon talks through; [HttpApiClient]
//! is the real implementation.

pub mod auth;
pub mod models;

use async_trait::async_trait;
use models::{ChangeRequest, ChangeResponse, TimelineInfo, TimelineList};
use reqwest::{header, Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::NetworkConfig;

pub const MEDIA_TYPE: &str = "application/vnd.manictime.v3+json";

/// Longest part of an error body kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// The server's change cursor or environment no longer matches what was sent.
    #[error("server rejected the expected change cursor (HTTP {status}): {body}")]
    Conflict { status: u16, body: String },
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("login reply carried no token")]
    MissingToken,
}

impl ApiError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout | ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::Conflict { .. }
            | ApiError::Encode(_)
            | ApiError::Decode(_)
            | ApiError::MissingToken => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Transport(value)
        }
    }
}

/// Remote operations the upload pipeline depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimelineApi: Send + Sync {
    async fn list_timelines(&self) -> Result<Vec<TimelineInfo>, ApiError>;

    async fn submit_changes(
        &self,
        timeline_key: &str,
        request: &ChangeRequest,
    ) -> Result<ChangeResponse, ApiError>;
}

/// Builds the http client shared by every request. Each call gets explicit connect and total
/// timeouts; a timed out call surfaces as [ApiError::Timeout].
pub fn http_client(network: &NetworkConfig) -> Result<Client, ApiError> {
    Ok(Client::builder()
        .connect_timeout(network.connect_timeout())
        .timeout(network.request_timeout())
        .build()?)
}

pub struct HttpApiClient {
    client: Client,
    server_url: String,
    access_token: String,
}

impl HttpApiClient {
    pub fn new(client: Client, server_url: &str, access_token: String) -> Self {
        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.server_url)
    }
}

/// Turns a non-success response into an error, keeping the start of the body for the logs.
pub(crate) async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    if matches!(
        status,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
    ) {
        Err(ApiError::Conflict {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TimelineApi for HttpApiClient {
    #[instrument(skip(self))]
    async fn list_timelines(&self) -> Result<Vec<TimelineInfo>, ApiError> {
        let response = self
            .client
            .get(self.url("timelines"))
            .header(header::ACCEPT, MEDIA_TYPE)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        let listing: TimelineList = serde_json::from_str(&body).map_err(ApiError::Decode)?;
        debug!("Server lists {} timelines", listing.timelines.len());
        Ok(listing.timelines)
    }

    #[instrument(skip(self, request), fields(changes = request.changes.len()))]
    async fn submit_changes(
        &self,
        timeline_key: &str,
        request: &ChangeRequest,
    ) -> Result<ChangeResponse, ApiError> {
        let body = serde_json::to_vec(request).map_err(ApiError::Encode)?;
        let response = self
            .client
            .post(self.url(&format!("timelines/{timeline_key}/changes")))
            .header(header::ACCEPT, MEDIA_TYPE)
            .header(header::CONTENT_TYPE, MEDIA_TYPE)
            .bearer_auth(&self.access_token)
            .body(body)
            .send()
            .await?;
        let body = check_status(response).await?.text().await?;
        if body.trim().is_empty() {
            return Ok(ChangeResponse::default());
        }
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            warn!("Ignoring unexpected change reply body: {e}");
            ChangeResponse::default()
        }))
    }
}
