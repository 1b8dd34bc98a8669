use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One continuous period during which a single application was in the foreground. Created by
/// the segmenter and never modified afterwards.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ActivityRecord {
    pub application_id: Arc<str>,
    pub display_name: Arc<str>,
    pub start: DateTime<Utc>,
    /// Always at least 1.
    pub duration_seconds: u32,
}

impl ActivityRecord {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::seconds(self.duration_seconds as i64)
    }
}

/// Contents of a marker file. A marker exists only once both artifacts are fully written, and
/// it is the only thing that makes a capture count as pending.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct ScreenshotMarker {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub full: PathBuf,
    pub thumbnail: PathBuf,
}

/// A capture waiting for upload, as found on disk.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ScreenshotRecord {
    pub timestamp: DateTime<Utc>,
    pub full: PathBuf,
    pub thumbnail: PathBuf,
    pub marker: PathBuf,
}

impl ScreenshotRecord {
    pub fn from_marker(marker_path: PathBuf, marker: ScreenshotMarker) -> Self {
        Self {
            timestamp: marker.timestamp,
            full: marker.full,
            thumbnail: marker.thumbnail,
            marker: marker_path,
        }
    }

    /// File name the sink stores the given artifact under.
    pub fn file_name(path: &std::path::Path) -> String {
        path.file_name()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
