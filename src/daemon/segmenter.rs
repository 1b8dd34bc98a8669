use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};

use crate::{
    source::{ForegroundApp, ForegroundSource},
    utils::clock::Clock,
};

use super::{entities::ActivityRecord, queue::ActivityQueue};

/// A sample arriving later than this multiple of the sampling interval means sampling was
/// suspended in between, so the open interval is closed instead of silently stretched.
const GAP_TOLERANCE: f64 = 1.5;

struct OpenInterval {
    app: ForegroundApp,
    since: DateTime<Utc>,
}

/// Turns periodic foreground samples into closed intervals. An interval is closed when the
/// foreground application changes, when a sampling gap is detected, or when it has been open
/// for longer than the maximum dwell time.
pub struct ActivitySegmenter {
    gap_threshold: chrono::Duration,
    max_dwell: chrono::Duration,
    open: Option<OpenInterval>,
    last_sample: Option<DateTime<Utc>>,
}

impl ActivitySegmenter {
    pub fn new(sample_interval: Duration, max_dwell: Duration) -> Self {
        let gap_threshold = sample_interval.mul_f64(GAP_TOLERANCE);
        Self {
            gap_threshold: chrono::Duration::from_std(gap_threshold)
                .unwrap_or(chrono::Duration::MAX),
            max_dwell: chrono::Duration::from_std(max_dwell).unwrap_or(chrono::Duration::MAX),
            open: None,
            last_sample: None,
        }
    }

    /// Feeds one sample. Returns the interval that this sample closed, if any.
    pub fn sample(&mut self, app: ForegroundApp, now: DateTime<Utc>) -> Option<ActivityRecord> {
        let last_sample = self.last_sample.replace(now);
        let Some(open) = self.open.as_mut() else {
            self.open = Some(OpenInterval { app, since: now });
            return None;
        };

        let changed = open.app.application_id != app.application_id;
        let gap = last_sample.is_some_and(|v| now - v > self.gap_threshold);
        let dwell = now - open.since >= self.max_dwell;

        if !(changed || gap || dwell) {
            if open.app.display_name.is_none() && app.display_name.is_some() {
                open.app = app;
            }
            return None;
        }

        if gap {
            debug!("Sampling gap detected before {now}");
        }

        let closed = std::mem::replace(open, OpenInterval { app, since: now });
        let duration = (now - closed.since).num_seconds();
        if duration <= 0 {
            trace!("Discarding empty interval of {}", closed.app.application_id);
            return None;
        }

        Some(ActivityRecord {
            display_name: closed.app.label(),
            application_id: closed.app.application_id,
            start: closed.since,
            duration_seconds: u32::try_from(duration).unwrap_or(u32::MAX),
        })
    }
}

/// Periodic task polling the foreground source and pushing closed intervals into the queue.
pub struct SamplingModule {
    queue: Arc<ActivityQueue>,
    source: Box<dyn ForegroundSource>,
    segmenter: ActivitySegmenter,
    shutdown: CancellationToken,
    interval: Duration,
    clock: Box<dyn Clock>,
}

impl SamplingModule {
    pub fn new(
        queue: Arc<ActivityQueue>,
        source: Box<dyn ForegroundSource>,
        segmenter: ActivitySegmenter,
        shutdown: CancellationToken,
        interval: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            source,
            segmenter,
            shutdown,
            interval,
            clock,
        }
    }

    #[instrument(skip(self))]
    fn sample_once(&mut self) {
        let app = match self.source.current_foreground_application() {
            Ok(Some(app)) => app,
            Ok(None) => {
                debug!("Foreground application unknown, skipping sample");
                return;
            }
            Err(e) => {
                error!("Encountered an error while sampling {e:?}");
                return;
            }
        };

        if let Some(record) = self.segmenter.sample(app, self.clock.time()) {
            debug!("Closed interval {:?}", record);
            self.queue.enqueue(record);
        }
    }

    /// Executes the sampling event loop until the session is cancelled.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sample_point = self.clock.instant();
        loop {
            sample_point += self.interval;

            self.sample_once();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = self.clock.sleep_until(sample_point) => ()
            }
        }
    }
}
