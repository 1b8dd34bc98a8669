use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::fs::operations::write_atomically;

pub const STATUS_FILE: &str = "status.json";

/// Best-effort summary of the upload pipeline, shown by `activity-relay status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_activities: usize,
    pub pending_screenshots: usize,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub timeline_key: Option<String>,
}

impl SyncStatus {
    pub async fn load(application_dir: &Path) -> Result<Self> {
        let path = application_dir.join(STATUS_FILE);
        let contents = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {path:?}"))?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Holds the latest [SyncStatus] and mirrors every change to the status file.
pub struct StatusReporter {
    path: Option<PathBuf>,
    current: watch::Sender<SyncStatus>,
}

impl StatusReporter {
    pub fn new(application_dir: &Path) -> Self {
        Self {
            path: Some(application_dir.join(STATUS_FILE)),
            current: watch::Sender::new(SyncStatus::default()),
        }
    }

    /// Reporter that only keeps the status in memory.
    pub fn detached() -> Self {
        Self {
            path: None,
            current: watch::Sender::new(SyncStatus::default()),
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.current.borrow().clone()
    }

    pub async fn update(&self, modify: impl FnOnce(&mut SyncStatus)) {
        self.current.send_modify(modify);
        let Some(path) = &self.path else {
            return;
        };
        let status = self.snapshot();
        let written = match serde_json::to_vec_pretty(&status) {
            Ok(contents) => write_atomically(path, &contents).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            warn!("Could not write status file {path:?}: {e}");
        }
    }
}
