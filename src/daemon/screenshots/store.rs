//! Disk-backed screenshot queue. Artifacts live in `screenshots/`, one marker per pending
//! capture lives in `pending/`. The set of marker files is the queue.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use futures::TryStreamExt;
use tokio::fs::{self, DirEntry};
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, info, warn};

use crate::{
    daemon::entities::{ScreenshotMarker, ScreenshotRecord},
    fs::operations::{partial_path, remove_if_exists, write_atomically, PARTIAL_SUFFIX},
    utils::time::screenshot_file_stem,
};

use super::encode::EncodedCapture;

pub const ARTIFACT_DIR: &str = "screenshots";
pub const MARKER_DIR: &str = "pending";
const MARKER_EXTENSION: &str = "json";
const TOKEN_LENGTH: usize = 12;

pub struct ScreenshotStore {
    artifact_dir: PathBuf,
    marker_dir: PathBuf,
}

async fn list_dir(dir: &Path) -> Result<Vec<DirEntry>, std::io::Error> {
    ReadDirStream::new(fs::read_dir(dir).await?)
        .try_collect()
        .await
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|v| v == extension)
}

impl ScreenshotStore {
    pub fn new(application_dir: &Path) -> Result<Self, std::io::Error> {
        let artifact_dir = application_dir.join(ARTIFACT_DIR);
        let marker_dir = application_dir.join(MARKER_DIR);
        std::fs::create_dir_all(&artifact_dir)?;
        std::fs::create_dir_all(&marker_dir)?;

        Ok(Self {
            artifact_dir,
            marker_dir,
        })
    }

    /// Writes both artifacts, then the marker. Until the marker is renamed into place the
    /// capture does not exist as far as [ScreenshotStore::pending] is concerned. A failed write
    /// removes whatever was already written.
    pub async fn persist(
        &self,
        captured_at: DateTime<Utc>,
        capture: &EncodedCapture,
    ) -> Result<ScreenshotRecord> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let stem = screenshot_file_stem(
            &captured_at.with_timezone(&Local).fixed_offset(),
            capture.width,
            capture.height,
            &token[..TOKEN_LENGTH],
        );

        let full = self.artifact_dir.join(format!("{stem}.jpg"));
        let thumbnail = self.artifact_dir.join(format!("{stem}.thumbnail.jpg"));
        let marker_path = self
            .marker_dir
            .join(format!("{stem}.{MARKER_EXTENSION}"));
        let marker = ScreenshotMarker {
            timestamp: captured_at,
            full,
            thumbnail,
        };

        if let Err(e) = Self::write_capture(&marker, &marker_path, capture).await {
            self.discard(&marker, &marker_path).await;
            return Err(e);
        }

        debug!("Persisted screenshot {stem}");
        Ok(ScreenshotRecord::from_marker(marker_path, marker))
    }

    async fn write_capture(
        marker: &ScreenshotMarker,
        marker_path: &Path,
        capture: &EncodedCapture,
    ) -> Result<()> {
        write_atomically(&marker.full, &capture.full)
            .await
            .with_context(|| format!("Failed to write {:?}", marker.full))?;
        write_atomically(&marker.thumbnail, &capture.thumbnail)
            .await
            .with_context(|| format!("Failed to write {:?}", marker.thumbnail))?;
        write_atomically(marker_path, &serde_json::to_vec(marker)?)
            .await
            .with_context(|| format!("Failed to write marker {marker_path:?}"))?;
        Ok(())
    }

    /// Removes whatever a failed [ScreenshotStore::persist] left behind, partial files included.
    async fn discard(&self, marker: &ScreenshotMarker, marker_path: &Path) {
        for path in [marker.full.as_path(), marker.thumbnail.as_path(), marker_path] {
            for path in [path.to_path_buf(), partial_path(path)] {
                if let Err(e) = remove_if_exists(&path).await {
                    warn!("Could not clean up {path:?} after a failed capture: {e}");
                }
            }
        }
    }

    async fn read_markers(&self) -> Result<Vec<ScreenshotRecord>> {
        let mut records = Vec::new();
        for entry in list_dir(&self.marker_dir).await? {
            let path = entry.path();
            if !has_extension(&path, MARKER_EXTENSION) {
                continue;
            }
            let contents = match fs::read(&path).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Could not read marker {path:?}: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<ScreenshotMarker>(&contents) {
                Ok(marker) => records.push(ScreenshotRecord::from_marker(path, marker)),
                Err(e) => {
                    warn!("Removing unreadable marker {path:?}: {e}");
                    remove_if_exists(&path).await?;
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.marker.cmp(&b.marker)));
        Ok(records)
    }

    /// Up to `limit` pending captures, oldest first.
    pub async fn pending(&self, limit: usize) -> Result<Vec<ScreenshotRecord>> {
        let mut records = self.read_markers().await?;
        records.truncate(limit);
        Ok(records)
    }

    pub async fn count_pending(&self) -> Result<usize> {
        Ok(list_dir(&self.marker_dir)
            .await?
            .iter()
            .filter(|v| has_extension(&v.path(), MARKER_EXTENSION))
            .count())
    }

    /// Takes a capture out of the queue and deletes whatever is left of its artifacts. The
    /// marker goes first so that a crash midway leaves orphans for the sweep rather than a
    /// marker pointing at missing files.
    pub async fn remove(&self, record: &ScreenshotRecord) -> Result<()> {
        remove_if_exists(&record.marker).await?;
        remove_if_exists(&record.full).await?;
        remove_if_exists(&record.thumbnail).await?;
        Ok(())
    }

    /// Deletes crash debris: half-written files and artifacts that no marker references.
    /// Must run before the capture task starts.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in list_dir(&self.marker_dir).await? {
            if has_extension(&entry.path(), PARTIAL_SUFFIX) && remove_if_exists(&entry.path()).await? {
                removed += 1;
            }
        }

        let referenced: HashSet<PathBuf> = self
            .read_markers()
            .await?
            .into_iter()
            .flat_map(|v| [v.full, v.thumbnail])
            .collect();

        for entry in list_dir(&self.artifact_dir).await? {
            let path = entry.path();
            if !referenced.contains(&path) && remove_if_exists(&path).await? {
                debug!("Removed orphaned artifact {path:?}");
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {removed} orphaned screenshot files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::{ScreenshotStore, ARTIFACT_DIR, MARKER_DIR};
    use crate::daemon::screenshots::encode::EncodedCapture;

    fn capture() -> EncodedCapture {
        EncodedCapture {
            width: 4,
            height: 2,
            full: vec![1, 2, 3],
            thumbnail: vec![4],
        }
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|v| v.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn persisted_capture_is_pending() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let timestamp = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let record = store.persist(timestamp, &capture()).await?;

        assert_eq!(std::fs::read(&record.full)?, vec![1, 2, 3]);
        assert_eq!(std::fs::read(&record.thumbnail)?, vec![4]);
        let pending = store.pending(10).await?;
        assert_eq!(pending, vec![record]);
        assert_eq!(pending[0].timestamp, timestamp);
        assert_eq!(store.count_pending().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn captures_in_the_same_second_do_not_collide() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let a = store.persist(timestamp, &capture()).await?;
        let b = store.persist(timestamp, &capture()).await?;

        assert_ne!(a.full, b.full);
        assert_eq!(store.count_pending().await?, 2);
        assert_eq!(count_files(&dir.path().join(ARTIFACT_DIR)), 4);
        Ok(())
    }

    #[tokio::test]
    async fn pending_is_oldest_first_and_bounded() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        for seconds in [300, 100, 200] {
            store
                .persist(Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(), &capture())
                .await?;
        }

        let pending = store.pending(2).await?;
        let times: Vec<_> = pending.iter().map(|v| v.timestamp.timestamp()).collect();
        assert_eq!(times, vec![1_700_000_100, 1_700_000_200]);
        Ok(())
    }

    #[tokio::test]
    async fn artifacts_without_marker_are_not_queued() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let record = store
            .persist(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), &capture())
            .await?;
        // Crash after the artifacts were written but before the marker was renamed into place.
        std::fs::rename(
            &record.marker,
            record.marker.with_extension("json.tmp"),
        )?;

        assert!(store.pending(10).await?.is_empty());
        assert_eq!(store.count_pending().await?, 0);

        assert_eq!(store.sweep_orphans().await?, 3);
        assert_eq!(count_files(&dir.path().join(ARTIFACT_DIR)), 0);
        assert_eq!(count_files(&dir.path().join(MARKER_DIR)), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_persist_leaves_no_artifacts() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        std::fs::remove_dir(dir.path().join(MARKER_DIR))?;

        let result = store
            .persist(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), &capture())
            .await;

        assert!(result.is_err());
        assert_eq!(count_files(&dir.path().join(ARTIFACT_DIR)), 0);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_keeps_referenced_artifacts() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let record = store
            .persist(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), &capture())
            .await?;
        std::fs::write(dir.path().join(ARTIFACT_DIR).join("leftover.jpg.tmp"), b"x")?;

        assert_eq!(store.sweep_orphans().await?, 1);
        assert!(record.full.exists());
        assert!(record.thumbnail.exists());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_marker_is_dropped() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let marker = dir.path().join(MARKER_DIR).join("broken.json");
        std::fs::write(&marker, b"{ not json")?;

        assert!(store.pending(10).await?.is_empty());
        assert!(!marker.exists());
        Ok(())
    }

    #[tokio::test]
    async fn remove_deletes_marker_and_artifacts() -> Result<()> {
        let dir = tempdir()?;
        let store = ScreenshotStore::new(dir.path())?;
        let record = store
            .persist(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), &capture())
            .await?;
        std::fs::remove_file(&record.thumbnail)?;

        store.remove(&record).await?;

        assert!(!record.marker.exists());
        assert!(!record.full.exists());
        assert_eq!(store.count_pending().await?, 0);
        Ok(())
    }
}
