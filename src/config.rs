//! Agent configuration, read from `<app_dir>/config.toml`.
//!
//! ```toml
//! server_url = "https://time.example.com"
//! device_name = "Work laptop"
//!
//! [intervals]
//! sample_secs = 30
//! screenshot_secs = 300
//! upload_secs = 60
//!
//! [screenshots]
//! enabled = true
//! sink_token = "..."
//! ```

use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use serde::Deserialize;
use tracing::info;

pub const CONFIG_FILE: &str = "config.toml";
pub const CREDENTIALS_FILE: &str = "credentials";
pub const DEVICE_ID_FILE: &str = "device_id";

/// Port the screenshot receiver listens on when no explicit sink url is configured.
const DEFAULT_SINK_PORT: u16 = 8888;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Base url of the time-tracking server, e.g. https://time.example.com
    pub server_url: String,
    /// Bearer token. When absent it is read from the credentials file written by `login`.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Name used to find this device's timeline. Defaults to the host name.
    #[serde(default)]
    pub device_name: Option<String>,
    /// Identifier reported to the screenshot sink. Generated once when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub screenshots: ScreenshotConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub sample_secs: u64,
    pub screenshot_secs: u64,
    pub upload_secs: u64,
    /// Longest interval the segmenter keeps open for one application before closing it, so that
    /// long sessions still reach the server.
    pub max_dwell_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            sample_secs: 30,
            screenshot_secs: 300,
            upload_secs: 60,
            max_dwell_secs: 600,
        }
    }
}

impl IntervalConfig {
    pub fn sample(&self) -> Duration {
        Duration::from_secs(self.sample_secs.max(1))
    }

    pub fn screenshot(&self) -> Duration {
        Duration::from_secs(self.screenshot_secs.max(1))
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs.max(1))
    }

    pub fn max_dwell(&self) -> Duration {
        Duration::from_secs(self.max_dwell_secs.max(self.sample_secs.max(1)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            request_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    /// Captures only start once this is set (or the session is authorised at runtime).
    pub enabled: bool,
    pub sink_url: Option<String>,
    pub sink_token: Option<String>,
    /// Screenshots uploaded per coordinator cycle.
    pub batch_size: usize,
    pub full_quality: u8,
    pub thumbnail_quality: u8,
    pub thumbnail_max_edge: u32,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sink_url: None,
            sink_token: None,
            batch_size: 3,
            full_quality: 90,
            thumbnail_quality: 75,
            thumbnail_max_edge: 200,
        }
    }
}

impl AgentConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration {path:?}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid configuration {path:?}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(contents)?;
        Url::parse(&config.server_url)
            .with_context(|| format!("server_url {:?} is not a valid url", config.server_url))?;
        Ok(config)
    }

    pub fn server_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Token from the configuration, or from the credentials file. Without one nothing can be
    /// uploaded, so its absence is an error.
    pub fn access_token(&self, dir: &Path) -> Result<String> {
        if let Some(token) = self.access_token.as_ref().filter(|v| !v.trim().is_empty()) {
            return Ok(token.trim().to_string());
        }
        let path = dir.join(CREDENTIALS_FILE);
        let token = std::fs::read_to_string(&path)
            .map_err(|_| anyhow!("No access token configured. Run `activity-relay login` first"))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(anyhow!("Credentials file {path:?} is empty"));
        }
        Ok(token.to_string())
    }

    pub fn device_name(&self) -> String {
        self.device_name
            .clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown-device".to_string())
    }

    /// Identifier reported to the screenshot sink. Generated and persisted on first use.
    pub fn device_id(&self, dir: &Path) -> Result<String> {
        if let Some(id) = self.device_id.as_ref().filter(|v| !v.trim().is_empty()) {
            return Ok(id.clone());
        }
        let path = dir.join(DEVICE_ID_FILE);
        match std::fs::read_to_string(&path) {
            Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                std::fs::write(&path, &id)?;
                info!("Generated device id {id}");
                Ok(id)
            }
        }
    }

    /// Screenshot receiver endpoint. Defaults to port 8888 on the server's host.
    pub fn sink_url(&self) -> Result<String> {
        if let Some(url) = &self.screenshots.sink_url {
            return Ok(url.clone());
        }
        let server = Url::parse(&self.server_url)?;
        let host = server
            .host_str()
            .ok_or_else(|| anyhow!("server_url {:?} has no host", self.server_url))?;
        Ok(format!("http://{host}:{DEFAULT_SINK_PORT}/upload"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::{AgentConfig, CREDENTIALS_FILE};

    #[test]
    fn minimal_config_uses_defaults() -> Result<()> {
        let config = AgentConfig::from_toml_str(r#"server_url = "https://time.example.com/""#)?;

        assert_eq!(config.server_url(), "https://time.example.com");
        assert_eq!(config.intervals.sample(), Duration::from_secs(30));
        assert_eq!(config.intervals.screenshot(), Duration::from_secs(300));
        assert_eq!(config.intervals.upload(), Duration::from_secs(60));
        assert_eq!(config.screenshots.batch_size, 3);
        assert!(!config.screenshots.enabled);
        assert_eq!(config.network.request_timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn sections_override_defaults() -> Result<()> {
        let config = AgentConfig::from_toml_str(
            r#"
            server_url = "http://10.0.0.2:8080"
            device_name = "MyPhone"

            [intervals]
            sample_secs = 5

            [screenshots]
            enabled = true
            batch_size = 1
            "#,
        )?;

        assert_eq!(config.intervals.sample(), Duration::from_secs(5));
        assert_eq!(config.intervals.upload(), Duration::from_secs(60));
        assert_eq!(config.device_name(), "MyPhone");
        assert!(config.screenshots.enabled);
        assert_eq!(config.screenshots.batch_size, 1);
        assert_eq!(config.sink_url()?, "http://10.0.0.2:8888/upload");
        Ok(())
    }

    #[test]
    fn invalid_server_url_is_rejected() {
        assert!(AgentConfig::from_toml_str(r#"server_url = "not a url""#).is_err());
    }

    #[test]
    fn access_token_falls_back_to_credentials_file() -> Result<()> {
        let dir = tempdir()?;
        let config = AgentConfig::from_toml_str(r#"server_url = "https://a.example""#)?;
        assert!(config.access_token(dir.path()).is_err());

        std::fs::write(dir.path().join(CREDENTIALS_FILE), "secret\n")?;
        assert_eq!(config.access_token(dir.path())?, "secret");
        Ok(())
    }

    #[test]
    fn device_id_is_generated_once() -> Result<()> {
        let dir = tempdir()?;
        let config = AgentConfig::from_toml_str(r#"server_url = "https://a.example""#)?;

        let first = config.device_id(dir.path())?;
        let second = config.device_id(dir.path())?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 36);
        Ok(())
    }
}
