pub mod encode;
pub mod store;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use encode::{encode_capture, EncodeSettings};
use store::ScreenshotStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{source::FrameSource, utils::clock::Clock};

use super::entities::ScreenshotRecord;

/// Delay between authorisation and the first capture.
const FIRST_CAPTURE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Capturing hasn't been authorised yet.
    Disabled,
    Idle,
    Capturing,
}

/// Periodic task turning raw frames into persisted, pending screenshots.
pub struct ScreenshotPipeline {
    source: Box<dyn FrameSource>,
    store: Arc<ScreenshotStore>,
    settings: EncodeSettings,
    authorized: watch::Receiver<bool>,
    shutdown: CancellationToken,
    interval: Duration,
    clock: Box<dyn Clock>,
    state: PipelineState,
}

impl ScreenshotPipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        store: Arc<ScreenshotStore>,
        settings: EncodeSettings,
        authorized: watch::Receiver<bool>,
        shutdown: CancellationToken,
        interval: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            authorized,
            shutdown,
            interval,
            clock,
            state: PipelineState::Disabled,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Captures, encodes and persists one frame. `Ok(None)` means the source had no frame to
    /// give; nothing is written in that case, and nothing is left queued on error.
    #[instrument(skip(self))]
    pub async fn capture_once(&mut self) -> Result<Option<ScreenshotRecord>> {
        self.state = PipelineState::Capturing;
        let result = self.capture().await;
        self.state = PipelineState::Idle;
        result
    }

    async fn capture(&mut self) -> Result<Option<ScreenshotRecord>> {
        let captured_at = self.clock.time();
        let Some(frame) = self.source.capture_frame()? else {
            info!("No frame available, skipping capture");
            return Ok(None);
        };

        let settings = self.settings;
        let encoded = tokio::task::spawn_blocking(move || encode_capture(&frame, settings)).await??;
        let record = self.store.persist(captured_at, &encoded).await?;
        debug!("Queued screenshot {:?}", record.marker);
        Ok(Some(record))
    }

    /// Waits for authorisation, then captures on every tick until the session is cancelled.
    pub async fn run(mut self) -> Result<()> {
        let authorized = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = self.authorized.wait_for(|v| *v) => result.is_ok(),
        };
        if !authorized {
            // Nobody is left to authorise capturing.
            self.shutdown.cancelled().await;
            return Ok(());
        }

        info!("Screen capture authorised");
        self.state = PipelineState::Idle;
        let mut capture_point = self.clock.instant() + FIRST_CAPTURE_DELAY;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = self.clock.sleep_until(capture_point) => ()
            }
            capture_point += self.interval;

            if let Err(e) = self.capture_once().await {
                error!("Screenshot capture failed {e:?}");
            }
        }
    }
}
