use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::info;

use crate::{
    api::{auth::request_token, http_client},
    config::{AgentConfig, NetworkConfig, CONFIG_FILE, CREDENTIALS_FILE},
    fs::operations::write_atomically,
};

#[derive(Serialize)]
struct MinimalConfig<'a> {
    server_url: &'a str,
}

/// Server to log into: the one given on the command line, else the configured one.
fn login_server(dir: &Path, server: Option<String>) -> Result<(String, NetworkConfig)> {
    let config = AgentConfig::load(dir).ok();
    let network = config
        .as_ref()
        .map(|v| v.network.clone())
        .unwrap_or_default();
    match (server, config) {
        (Some(server), _) => Ok((server, network)),
        (None, Some(config)) => Ok((config.server_url().to_string(), network)),
        (None, None) => Err(anyhow!(
            "No server configured. Pass --server or create {CONFIG_FILE}"
        )),
    }
}

/// Logs in with a password read from stdin and stores the token for the daemon. Creates a
/// minimal configuration when there is none yet.
pub async fn login(dir: &Path, server: Option<String>, username: &str) -> Result<()> {
    let (server, network) = login_server(dir, server)?;

    println!("Password for {username} at {server}:");
    let mut password = String::new();
    BufReader::new(stdin()).read_line(&mut password).await?;
    let password = password.trim_end_matches(['\r', '\n']);

    let client = http_client(&network)?;
    let token = request_token(&client, &server, username, password)
        .await
        .context("Login failed")?;

    write_atomically(&dir.join(CREDENTIALS_FILE), token.as_bytes()).await?;
    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let contents = toml::to_string(&MinimalConfig {
            server_url: &server,
        })?;
        write_atomically(&config_path, contents.as_bytes()).await?;
        info!("Created {config_path:?}");
    }

    println!("Logged in. Restart the daemon with `activity-relay init` to use the new token");
    Ok(())
}
