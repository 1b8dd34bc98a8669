use reqwest::{header, Client};
use tracing::{info, instrument};

use super::{check_status, models::TokenReply, ApiError, MEDIA_TYPE};

/// Exchanges a username and password for a bearer token using the password grant.
#[instrument(skip(client, password))]
pub async fn request_token(
    client: &Client,
    server_url: &str,
    username: &str,
    password: &str,
) -> Result<String, ApiError> {
    let url = format!("{}/api/token", server_url.trim_end_matches('/'));
    let response = client
        .post(url)
        .header(header::ACCEPT, MEDIA_TYPE)
        .form(&[
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ])
        .send()
        .await?;
    let body = check_status(response).await?.text().await?;
    let reply: TokenReply = serde_json::from_str(&body).map_err(ApiError::Decode)?;

    let token = reply
        .access_token
        .or(reply.token)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingToken)?;
    info!("Received access token");
    Ok(token)
}
