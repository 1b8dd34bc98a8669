pub mod batch;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use batch::{build_change_request, ActivityIds};
use chrono::Local;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    api::{ApiError, TimelineApi},
    fs::operations::file_exists,
    sink::ScreenshotSink,
    utils::clock::Clock,
};

use super::{
    entities::ScreenshotRecord,
    queue::{ActivityQueue, InFlightBatch},
    screenshots::store::ScreenshotStore,
    status::StatusReporter,
    timeline::{BindingState, SharedBinding, TimelineBinding},
};

/// What one coordinator cycle achieved.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// No binding was available, nothing was attempted.
    pub skipped: bool,
    pub activities_uploaded: usize,
    pub screenshots_uploaded: usize,
    pub screenshots_dropped: usize,
    pub errors: Vec<String>,
}

#[derive(Default)]
struct ScreenshotOutcome {
    uploaded: usize,
    dropped: usize,
    errors: Vec<String>,
}

/// Everything the coordinator reads from and writes to.
pub struct UploadContext {
    pub queue: Arc<ActivityQueue>,
    pub store: Arc<ScreenshotStore>,
    pub binding: Arc<SharedBinding>,
    pub api: Arc<dyn TimelineApi>,
    pub sink: Arc<dyn ScreenshotSink>,
    pub status: Arc<StatusReporter>,
    pub device_id: String,
    pub screenshot_batch: usize,
}

/// Periodic driver of both uploads. Each cycle runs the activity batch and the screenshot batch
/// side by side; a failure in one leaves the other alone.
pub struct UploadCoordinator {
    context: UploadContext,
    ids: ActivityIds,
    trigger: Arc<Notify>,
    shutdown: CancellationToken,
    interval: Duration,
    clock: Box<dyn Clock>,
}

impl UploadCoordinator {
    pub fn new(
        context: UploadContext,
        trigger: Arc<Notify>,
        shutdown: CancellationToken,
        interval: Duration,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            context,
            ids: ActivityIds::new(),
            trigger,
            shutdown,
            interval,
            clock,
        }
    }

    /// Sends everything queued as one change-log request. The batch returns to the front of
    /// the queue unless the server accepted it, including when this future is dropped.
    async fn upload_activities(&self, binding: &TimelineBinding) -> Result<usize> {
        let batch = InFlightBatch::take(&self.context.queue);
        if batch.is_empty() {
            return Ok(0);
        }

        let request = build_change_request(binding, batch.records(), &self.ids, &Local)?;
        match self
            .context
            .api
            .submit_changes(&binding.timeline_key, &request)
            .await
        {
            Ok(response) => {
                if let Some(last_change_id) = response.last_change_id {
                    self.context
                        .binding
                        .advance(&binding.timeline_key, last_change_id);
                }
                let uploaded = batch.commit();
                info!("Uploaded {uploaded} activities");
                Ok(uploaded)
            }
            Err(e) => {
                if matches!(e, ApiError::Conflict { .. }) {
                    warn!("Timeline moved on since it was resolved, resolving again");
                    self.context.binding.mark_stale();
                }
                Err(e).context("Activity upload failed")
            }
        }
    }

    async fn upload_screenshot(&self, record: &ScreenshotRecord) -> Result<()> {
        for path in [&record.full, &record.thumbnail] {
            let image = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {path:?}"))?;
            self.context
                .sink
                .upload(
                    &self.context.device_id,
                    record.timestamp,
                    &ScreenshotRecord::file_name(path),
                    image,
                )
                .await
                .with_context(|| format!("Failed to upload {path:?}"))?;
        }
        Ok(())
    }

    /// Uploads the oldest pending screenshots. A capture leaves the queue only once both of its
    /// variants are stored by the sink, or when its files are gone.
    async fn upload_screenshots(&self) -> ScreenshotOutcome {
        let mut outcome = ScreenshotOutcome::default();
        let records = match self
            .context
            .store
            .pending(self.context.screenshot_batch)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                outcome.errors.push(format!("Could not list screenshots: {e}"));
                return outcome;
            }
        };

        for record in records {
            let present = file_exists(&record.full).await.unwrap_or(false)
                && file_exists(&record.thumbnail).await.unwrap_or(false);
            if !present {
                info!("Dropping screenshot {:?}, its files are gone", record.marker);
                match self.context.store.remove(&record).await {
                    Ok(()) => outcome.dropped += 1,
                    Err(e) => outcome.errors.push(format!("{e:#}")),
                }
                continue;
            }

            let result = match self.upload_screenshot(&record).await {
                Ok(()) => self.context.store.remove(&record).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => outcome.uploaded += 1,
                Err(e) => {
                    warn!("Screenshot stays queued: {e:#}");
                    outcome.errors.push(format!("{e:#}"));
                }
            }
        }
        outcome
    }

    /// Runs one cycle. Nothing is attempted while no timeline binding is available.
    pub async fn run_cycle(&self) -> CycleReport {
        let state = self.context.binding.state();
        let mut report = CycleReport::default();

        match &state {
            BindingState::Resolved(binding) => {
                let (activities, screenshots) =
                    tokio::join!(self.upload_activities(binding), self.upload_screenshots());
                match activities {
                    Ok(uploaded) => report.activities_uploaded = uploaded,
                    Err(e) => {
                        error!("{e:#}");
                        report.errors.push(format!("{e:#}"));
                    }
                }
                report.screenshots_uploaded = screenshots.uploaded;
                report.screenshots_dropped = screenshots.dropped;
                report.errors.extend(screenshots.errors);
            }
            _ => {
                debug!("No timeline binding ({state:?}), skipping upload");
                report.skipped = true;
            }
        }

        self.report_status(&state, &report).await;
        report
    }

    async fn report_status(&self, state: &BindingState, report: &CycleReport) {
        let now = self.clock.time();
        let pending_activities = self.context.queue.len();
        let pending_screenshots = self.context.store.count_pending().await.unwrap_or_default();

        self.context
            .status
            .update(|status| {
                status.pending_activities = pending_activities;
                status.pending_screenshots = pending_screenshots;
                match state {
                    BindingState::Resolved(binding) => {
                        status.timeline_key = Some(binding.timeline_key.clone());
                        status.last_attempt = Some(now);
                        if report.errors.is_empty() {
                            status.last_success = Some(now);
                            status.last_error = None;
                        } else {
                            status.last_error = Some(report.errors.join("; "));
                        }
                    }
                    BindingState::Failed(reason) => {
                        status.timeline_key = None;
                        status.last_error = Some(format!("uploads disabled: {reason}"));
                    }
                    BindingState::Pending | BindingState::Stale => {}
                }
            })
            .await;
    }

    /// Executes the coordinator loop: a cycle every interval, or right away when an upload is
    /// requested through the trigger. A cycle that is still running when the session is
    /// cancelled is abandoned, which leaves its data queued.
    pub async fn run(self) -> Result<()> {
        let mut next_cycle = self.clock.instant() + self.interval;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = self.clock.sleep_until(next_cycle) => {
                    next_cycle += self.interval;
                    let now = self.clock.instant();
                    if next_cycle <= now {
                        next_cycle = now + self.interval;
                    }
                }
                _ = self.trigger.notified() => {
                    info!("Upload requested");
                }
            }

            let span = info_span!("Upload cycle");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                report = self.run_cycle().instrument(span) => {
                    debug!("Cycle finished {report:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use super::{UploadContext, UploadCoordinator};
    use crate::{
        api::{
            models::{ChangeRequest, ChangeResponse, SchemaDescriptor, TimelineInfo},
            ApiError, MockTimelineApi, TimelineApi,
        },
        daemon::{
            entities::ActivityRecord,
            queue::ActivityQueue,
            screenshots::{encode::EncodedCapture, store::ScreenshotStore},
            status::StatusReporter,
            timeline::{BindingState, SharedBinding, TimelineBinding},
        },
        sink::{MockScreenshotSink, ScreenshotSink},
        utils::{clock::TestClock, logging::TEST_LOGGING},
    };

    struct Fixture {
        _dir: TempDir,
        queue: Arc<ActivityQueue>,
        store: Arc<ScreenshotStore>,
        binding: Arc<SharedBinding>,
        status: Arc<StatusReporter>,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            *TEST_LOGGING;
            let dir = tempdir()?;
            let binding = Arc::new(SharedBinding::new());
            binding.set(BindingState::Resolved(TimelineBinding {
                timeline_key: "key".into(),
                schema: SchemaDescriptor {
                    name: "ManicTime/Applications".into(),
                    version: None,
                },
                last_change_id: Some("1".into()),
                environment_id: "env".into(),
            }));
            Ok(Self {
                store: Arc::new(ScreenshotStore::new(dir.path())?),
                _dir: dir,
                queue: Arc::new(ActivityQueue::new()),
                binding,
                status: Arc::new(StatusReporter::detached()),
            })
        }

        fn coordinator(
            &self,
            api: impl TimelineApi + 'static,
            sink: impl ScreenshotSink + 'static,
        ) -> UploadCoordinator {
            UploadCoordinator::new(
                UploadContext {
                    queue: self.queue.clone(),
                    store: self.store.clone(),
                    binding: self.binding.clone(),
                    api: Arc::new(api),
                    sink: Arc::new(sink),
                    status: self.status.clone(),
                    device_id: "device".into(),
                    screenshot_batch: 3,
                },
                Arc::new(Notify::new()),
                CancellationToken::new(),
                Duration::from_secs(60),
                Box::new(TestClock::starting_at(Utc::now())),
            )
        }

        fn enqueue(&self, apps: &[&str]) {
            for (i, app) in apps.iter().enumerate() {
                self.queue.enqueue(ActivityRecord {
                    application_id: (*app).into(),
                    display_name: (*app).into(),
                    start: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
                    duration_seconds: 60,
                });
            }
        }

        fn queued(&self) -> Vec<String> {
            let records = self.queue.take_all();
            let names = records.iter().map(|v| v.application_id.to_string()).collect();
            self.queue.requeue_front(records);
            names
        }

        async fn screenshot(&self, seconds: i64) -> Result<(PathBuf, PathBuf, PathBuf)> {
            let capture = EncodedCapture {
                width: 2,
                height: 2,
                full: vec![1],
                thumbnail: vec![2],
            };
            let record = self
                .store
                .persist(Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(), &capture)
                .await?;
            Ok((record.full, record.thumbnail, record.marker))
        }
    }

    fn no_screenshots() -> MockScreenshotSink {
        let mut sink = MockScreenshotSink::new();
        sink.expect_upload().never();
        sink
    }

    #[tokio::test]
    async fn failed_batch_goes_back_to_the_front() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.enqueue(&["a", "b"]);
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes()
            .times(1)
            .returning(|_, _| Err(ApiError::Timeout));

        let report = fixture
            .coordinator(api, no_screenshots())
            .run_cycle()
            .await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(fixture.queued(), vec!["a", "b"]);
        let status = fixture.status.snapshot();
        assert_eq!(status.pending_activities, 2);
        assert!(status.last_error.is_some());
        assert!(status.last_success.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn successful_batch_is_never_sent_again() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.enqueue(&["a", "b", "a"]);
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes()
            .times(1)
            .withf(|key, request| key == "key" && request.changes.len() == 5)
            .returning(|_, _| Ok(ChangeResponse::default()));

        let coordinator = fixture.coordinator(api, no_screenshots());
        assert_eq!(coordinator.run_cycle().await.activities_uploaded, 3);
        assert_eq!(coordinator.run_cycle().await.activities_uploaded, 0);

        assert!(fixture.queue.is_empty());
        let status = fixture.status.snapshot();
        assert!(status.last_success.is_some());
        assert_eq!(status.timeline_key.as_deref(), Some("key"));
        Ok(())
    }

    #[tokio::test]
    async fn reply_cursor_is_used_by_the_next_batch() -> Result<()> {
        let fixture = Fixture::new()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut api = MockTimelineApi::new();
        let recorded = seen.clone();
        let mut next = 1;
        api.expect_submit_changes()
            .times(2)
            .returning(move |_, request| {
                recorded
                    .lock()
                    .unwrap()
                    .push(request.expected_last_change_id.clone());
                next += 1;
                Ok(ChangeResponse {
                    last_change_id: Some(next.to_string()),
                })
            });

        let coordinator = fixture.coordinator(api, no_screenshots());
        fixture.enqueue(&["a"]);
        coordinator.run_cycle().await;
        fixture.enqueue(&["b"]);
        coordinator.run_cycle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("1".to_string()), Some("2".to_string())]
        );
        assert_eq!(
            fixture.binding.current().unwrap().last_change_id.as_deref(),
            Some("3")
        );
        Ok(())
    }

    #[tokio::test]
    async fn conflict_keeps_batch_and_invalidates_binding() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.enqueue(&["a"]);
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes().times(1).returning(|_, _| {
            Err(ApiError::Conflict {
                status: 409,
                body: "cursor".into(),
            })
        });

        fixture.coordinator(api, no_screenshots()).run_cycle().await;

        assert_eq!(fixture.binding.state(), BindingState::Stale);
        assert_eq!(fixture.queued(), vec!["a"]);
        Ok(())
    }

    #[tokio::test]
    async fn nothing_is_attempted_without_binding() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture
            .binding
            .set(BindingState::Failed("no timeline".into()));
        fixture.enqueue(&["a"]);
        let (full, _, marker) = fixture.screenshot(0).await?;
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes().never();

        let report = fixture
            .coordinator(api, no_screenshots())
            .run_cycle()
            .await;

        assert!(report.skipped);
        assert_eq!(fixture.queued(), vec!["a"]);
        assert!(full.exists() && marker.exists());
        let status = fixture.status.snapshot();
        assert_eq!(status.pending_screenshots, 1);
        assert!(status.last_error.unwrap().contains("no timeline"));
        Ok(())
    }

    #[tokio::test]
    async fn screenshot_is_removed_only_after_both_variants() -> Result<()> {
        let fixture = Fixture::new()?;
        let (full, thumbnail, marker) = fixture.screenshot(0).await?;
        let mut sink = MockScreenshotSink::new();
        let mut fail_thumbnail = true;
        sink.expect_upload()
            .times(4)
            .returning(move |device, _, filename, _| {
                assert_eq!(device, "device");
                if filename.ends_with(".thumbnail.jpg") && fail_thumbnail {
                    fail_thumbnail = false;
                    return Err(ApiError::Timeout);
                }
                Ok(())
            });
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes().never();
        let coordinator = fixture.coordinator(api, sink);

        let report = coordinator.run_cycle().await;
        assert_eq!(report.screenshots_uploaded, 0);
        assert!(full.exists() && thumbnail.exists() && marker.exists());

        let report = coordinator.run_cycle().await;
        assert_eq!(report.screenshots_uploaded, 1);
        assert!(!full.exists() && !thumbnail.exists() && !marker.exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_screenshot_is_dropped_and_others_bounded() -> Result<()> {
        let fixture = Fixture::new()?;
        let (full, _, stale_marker) = fixture.screenshot(0).await?;
        std::fs::remove_file(&full)?;
        for i in 1..=4 {
            fixture.screenshot(i).await?;
        }
        let mut sink = MockScreenshotSink::new();
        sink.expect_upload().times(4).returning(|_, _, _, _| Ok(()));

        let report = fixture
            .coordinator(MockTimelineApi::new(), sink)
            .run_cycle()
            .await;

        assert_eq!(report.screenshots_dropped, 1);
        assert_eq!(report.screenshots_uploaded, 2);
        assert!(report.errors.is_empty());
        assert!(!stale_marker.exists());
        assert_eq!(fixture.store.count_pending().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn activity_failure_does_not_block_screenshots() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.enqueue(&["a"]);
        fixture.screenshot(0).await?;
        let mut api = MockTimelineApi::new();
        api.expect_submit_changes().returning(|_, _| {
            Err(ApiError::Status {
                status: 500,
                body: String::new(),
            })
        });
        let mut sink = MockScreenshotSink::new();
        sink.expect_upload().times(2).returning(|_, _, _, _| Ok(()));

        let report = fixture.coordinator(api, sink).run_cycle().await;

        assert_eq!(report.screenshots_uploaded, 1);
        assert_eq!(fixture.queued(), vec!["a"]);
        Ok(())
    }

    struct HangingApi;

    #[async_trait]
    impl TimelineApi for HangingApi {
        async fn list_timelines(&self) -> Result<Vec<TimelineInfo>, ApiError> {
            std::future::pending().await
        }

        async fn submit_changes(
            &self,
            _: &str,
            _: &ChangeRequest,
        ) -> Result<ChangeResponse, ApiError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_batch_queued() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.enqueue(&["a", "b"]);
        let coordinator = fixture.coordinator(HangingApi, no_screenshots());

        tokio::select! {
            _ = coordinator.run_cycle() => panic!("upload can't finish"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => (),
        }

        assert_eq!(fixture.queued(), vec!["a", "b"]);
        Ok(())
    }
}
