use std::{io::ErrorKind, path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use fs4::tokio::AsyncFileExt;
use screenshots::{encode::EncodeSettings, store::ScreenshotStore, ScreenshotPipeline};
use segmenter::{ActivitySegmenter, SamplingModule};
use status::{StatusReporter, SyncStatus};
use timeline::{SharedBinding, TimelineResolver};
use tokio::{
    fs::File,
    sync::{watch, Notify},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use upload::{UploadContext, UploadCoordinator};

use crate::{
    api::{http_client, HttpApiClient, TimelineApi},
    config::AgentConfig,
    sink::{HttpScreenshotSink, ScreenshotSink},
    source::{platform_sources, ForegroundSource, FrameSource},
    utils::clock::{Clock, DefaultClock},
};

use queue::ActivityQueue;

pub mod args;
pub mod entities;
pub mod queue;
pub mod screenshots;
pub mod segmenter;
pub mod shutdown;
pub mod status;
pub mod timeline;
pub mod upload;

pub const LOCK_FILE: &str = "daemon.lock";

/// External parts a session talks to.
pub struct Collaborators {
    pub api: Arc<dyn TimelineApi>,
    pub sink: Arc<dyn ScreenshotSink>,
    pub foreground: Box<dyn ForegroundSource>,
    pub frames: Box<dyn FrameSource>,
}

/// Handed to whoever needs to steer a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shutdown: CancellationToken,
    capture: Arc<watch::Sender<bool>>,
    upload_trigger: Arc<Notify>,
    status: Arc<StatusReporter>,
}

impl SessionHandle {
    /// Lets the screenshot pipeline start capturing.
    pub fn authorize_capture(&self) {
        self.capture.send_replace(true);
    }

    /// Runs an upload cycle now instead of waiting for the next tick.
    pub fn request_upload(&self) {
        self.upload_trigger.notify_one();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// All periodic tasks of one monitoring session, ready to run.
pub struct Session {
    sampling: SamplingModule,
    pipeline: ScreenshotPipeline,
    resolver: TimelineResolver,
    coordinator: UploadCoordinator,
}

impl Session {
    /// Runs every task until the session is cancelled.
    pub async fn run(self) -> Result<()> {
        let (sampling, pipeline, resolver, coordinator) = tokio::join!(
            self.sampling.run(),
            self.pipeline.run(),
            self.resolver.run(),
            self.coordinator.run(),
        );

        for (name, result) in [
            ("Sampling", sampling),
            ("Screenshot", pipeline),
            ("Timeline", resolver),
            ("Upload", coordinator),
        ] {
            if let Err(e) = result {
                error!("{name} module got an error {e:?}");
            }
        }
        info!("Session stopped");
        Ok(())
    }
}

/// Builds a session in `application_dir`. Crash debris of an earlier session is swept before
/// any task exists.
pub async fn create_session(
    application_dir: &Path,
    config: &AgentConfig,
    collaborators: Collaborators,
    status: Arc<StatusReporter>,
    clock: impl Clock + Clone,
) -> Result<(Session, SessionHandle)> {
    let store = Arc::new(ScreenshotStore::new(application_dir)?);
    store.sweep_orphans().await?;

    let shutdown = CancellationToken::new();
    let (capture, authorized) = watch::channel(false);
    let upload_trigger = Arc::new(Notify::new());
    let queue = Arc::new(ActivityQueue::new());
    let binding = Arc::new(SharedBinding::new());
    let intervals = &config.intervals;

    let sampling = SamplingModule::new(
        queue.clone(),
        collaborators.foreground,
        ActivitySegmenter::new(intervals.sample(), intervals.max_dwell()),
        shutdown.clone(),
        intervals.sample(),
        Box::new(clock.clone()),
    );

    let pipeline = ScreenshotPipeline::new(
        collaborators.frames,
        store.clone(),
        EncodeSettings::from(&config.screenshots),
        authorized,
        shutdown.clone(),
        intervals.screenshot(),
        Box::new(clock.clone()),
    );

    let resolver = TimelineResolver::new(
        collaborators.api.clone(),
        config.device_name(),
        binding.clone(),
        shutdown.clone(),
        Box::new(clock.clone()),
    );

    let coordinator = UploadCoordinator::new(
        UploadContext {
            queue,
            store,
            binding,
            api: collaborators.api,
            sink: collaborators.sink,
            status: status.clone(),
            device_id: config.device_id(application_dir)?,
            screenshot_batch: config.screenshots.batch_size.max(1),
        },
        upload_trigger.clone(),
        shutdown.clone(),
        intervals.upload(),
        Box::new(clock),
    );

    let handle = SessionHandle {
        shutdown,
        capture: Arc::new(capture),
        upload_trigger,
        status,
    };
    if config.screenshots.enabled {
        handle.authorize_capture();
    }

    Ok((
        Session {
            sampling,
            pipeline,
            resolver,
            coordinator,
        },
        handle,
    ))
}

fn create_collaborators(application_dir: &Path, config: &AgentConfig) -> Result<Collaborators> {
    let client = http_client(&config.network)?;
    let api = HttpApiClient::new(
        client.clone(),
        config.server_url(),
        config.access_token(application_dir)?,
    );
    let sink = HttpScreenshotSink::new(
        client,
        config.sink_url()?,
        config.screenshots.sink_token.clone(),
    );
    let (foreground, frames) = platform_sources()?;

    Ok(Collaborators {
        api: Arc::new(api),
        sink: Arc::new(sink),
        foreground,
        frames,
    })
}

/// Takes the lock that keeps a second daemon away from the same application directory.
/// Fails right away when another instance holds it.
pub async fn acquire_instance_lock(dir: &Path) -> Result<File> {
    let lock_path = dir.join(LOCK_FILE);
    let lock = File::create(&lock_path)
        .await
        .with_context(|| format!("Failed to open {lock_path:?}"))?;
    debug!("Acquiring {lock_path:?}");
    match lock.try_lock_exclusive() {
        Ok(true) => Ok(lock),
        Ok(false) => Err(anyhow!("Daemon already running for {dir:?}")),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            Err(anyhow!("Daemon already running for {dir:?}"))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to lock {lock_path:?}")),
    }
}

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: &Path) -> Result<()> {
    let config = AgentConfig::load(dir)?;

    let lock = acquire_instance_lock(dir).await?;

    let collaborators = create_collaborators(dir, &config)?;
    let status = Arc::new(StatusReporter::new(dir));
    let (session, handle) =
        create_session(dir, &config, collaborators, status, DefaultClock).await?;
    info!(
        "Relaying activity of {} to {}",
        config.device_name(),
        config.server_url()
    );

    let (_, result) = tokio::join!(
        shutdown::detect_shutdown(handle.shutdown_token()),
        session.run(),
    );

    lock.unlock_async().await?;
    result
}
