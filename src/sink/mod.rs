//! Destination of screenshot bytes. The coordinator only relies on [ScreenshotSink]; the HTTP
//! receiver is the transport shipped with the agent.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Local, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    api::{check_status, ApiError},
    utils::time::sink_date,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScreenshotSink: Send + Sync {
    /// Stores one image variant. Called separately for the full image and the thumbnail.
    async fn upload(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        filename: &str,
        image: Vec<u8>,
    ) -> Result<(), ApiError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody<'a> {
    #[serde(rename = "deviceUUID")]
    device_uuid: &'a str,
    /// Milliseconds since the unix epoch.
    timestamp: i64,
    date: String,
    filename: &'a str,
    image_data: String,
}

/// Posts screenshots as JSON with base64 encoded image data.
pub struct HttpScreenshotSink {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpScreenshotSink {
    pub fn new(client: Client, url: String, token: Option<String>) -> Self {
        Self { client, url, token }
    }
}

#[async_trait]
impl ScreenshotSink for HttpScreenshotSink {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn upload(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        filename: &str,
        image: Vec<u8>,
    ) -> Result<(), ApiError> {
        let body = UploadBody {
            device_uuid: device_id,
            timestamp: timestamp.timestamp_millis(),
            date: sink_date(&timestamp, &Local),
            filename,
            image_data: STANDARD.encode(&image),
        };
        let mut request = self
            .client
            .post(&self.url)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        check_status(request.send().await?).await?;
        debug!("Sink accepted {filename}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    use super::{HttpScreenshotSink, ScreenshotSink};
    use crate::{
        api::{http_client, ApiError},
        config::NetworkConfig,
    };

    type Received = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn serve(status: StatusCode) -> Result<(String, Received)> {
        let received = Received::default();
        let router = Router::new()
            .route(
                "/upload",
                post(
                    move |State(received): State<Received>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        received.lock().unwrap().push((auth, body));
                        status
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });
        Ok((format!("http://{address}/upload"), received))
    }

    #[tokio::test]
    async fn upload_sends_base64_payload() -> Result<()> {
        let (url, received) = serve(StatusCode::OK).await?;
        let sink = HttpScreenshotSink::new(
            http_client(&NetworkConfig::default())?,
            url,
            Some("sink-token".into()),
        );
        let timestamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        sink.upload("device-1", timestamp, "shot.jpg", vec![1, 2, 3])
            .await?;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (auth, body) = &received[0];
        assert_eq!(auth.as_deref(), Some("Bearer sink-token"));
        assert_eq!(body["deviceUUID"], "device-1");
        assert_eq!(body["timestamp"], 1_700_000_000_123i64);
        assert_eq!(body["filename"], "shot.jpg");
        assert_eq!(
            STANDARD.decode(body["imageData"].as_str().unwrap())?,
            vec![1, 2, 3]
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_upload_is_an_error() -> Result<()> {
        let (url, _) = serve(StatusCode::INTERNAL_SERVER_ERROR).await?;
        let sink = HttpScreenshotSink::new(http_client(&NetworkConfig::default())?, url, None);

        let error = sink
            .upload("device-1", Utc::now(), "shot.jpg", vec![0])
            .await
            .unwrap_err();
        assert!(matches!(error, ApiError::Status { status: 500, .. }));
        Ok(())
    }
}
