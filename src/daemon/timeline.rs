//! Discovery of the remote timeline that activities are appended to.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    api::{
        models::{SchemaDescriptor, TimelineInfo},
        ApiError, TimelineApi,
    },
    utils::clock::Clock,
};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Routing and concurrency context of the timeline uploads go to. Lives for one session only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineBinding {
    pub timeline_key: String,
    pub schema: SchemaDescriptor,
    pub last_change_id: Option<String>,
    pub environment_id: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("the server has no timeline to upload to")]
    NoTimelineAvailable,
    #[error("malformed timeline listing: {0}")]
    Malformed(String),
    #[error(transparent)]
    Api(ApiError),
}

impl From<ApiError> for ResolveError {
    fn from(value: ApiError) -> Self {
        match value {
            ApiError::Decode(e) => ResolveError::Malformed(e.to_string()),
            other => ResolveError::Api(other),
        }
    }
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Api(e) if e.is_transient())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaKind {
    Applications,
    ComputerUsage,
    Tags,
    Other,
}

impl SchemaKind {
    fn of(timeline: &TimelineInfo) -> Self {
        let name: String = timeline
            .schema
            .name
            .chars()
            .filter(|v| !v.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        if name.ends_with("manictime/applications") {
            SchemaKind::Applications
        } else if name.contains("computerusage") {
            SchemaKind::ComputerUsage
        } else if name.ends_with("manictime/tags") {
            SchemaKind::Tags
        } else {
            SchemaKind::Other
        }
    }
}

/// Case-insensitive substring match in either direction, so truncated device names still
/// match. Empty names never match anything.
pub fn device_matches(remote: &str, local: &str) -> bool {
    let remote = remote.trim().to_lowercase();
    let local = local.trim().to_lowercase();
    if remote.is_empty() || local.is_empty() {
        return false;
    }
    remote.contains(&local) || local.contains(&remote)
}

/// Picks the timeline to upload to, first match wins:
/// applications on this device, any applications, computer usage on this device, any computer
/// usage, tags, and finally whatever the server listed first.
pub fn select_timeline<'a>(
    timelines: &'a [TimelineInfo],
    device_name: &str,
) -> Option<&'a TimelineInfo> {
    let find = |kind: SchemaKind, on_device: bool| {
        timelines.iter().find(|v| {
            SchemaKind::of(v) == kind
                && (!on_device
                    || v.device_name()
                        .is_some_and(|d| device_matches(d, device_name)))
        })
    };

    find(SchemaKind::Applications, true)
        .or_else(|| find(SchemaKind::Applications, false))
        .or_else(|| find(SchemaKind::ComputerUsage, true))
        .or_else(|| find(SchemaKind::ComputerUsage, false))
        .or_else(|| find(SchemaKind::Tags, false))
        .or_else(|| timelines.first())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Pending,
    Resolved(TimelineBinding),
    /// The server rejected our cursor; the binding must be resolved again before uploading.
    Stale,
    /// Resolution failed for good. Uploads stay off for the rest of the session.
    Failed(String),
}

/// Binding cell shared by the resolver, which fills it, and the coordinator, which reads it and
/// advances or invalidates it after submissions.
pub struct SharedBinding {
    state: watch::Sender<BindingState>,
}

impl Default for SharedBinding {
    fn default() -> Self {
        Self {
            state: watch::Sender::new(BindingState::Pending),
        }
    }
}

impl SharedBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BindingState {
        self.state.borrow().clone()
    }

    pub fn current(&self) -> Option<TimelineBinding> {
        match &*self.state.borrow() {
            BindingState::Resolved(binding) => Some(binding.clone()),
            _ => None,
        }
    }

    pub fn set(&self, state: BindingState) {
        self.state.send_replace(state);
    }

    /// Moves the cursor after a successful submission to `timeline_key`.
    pub fn advance(&self, timeline_key: &str, last_change_id: String) {
        self.state.send_if_modified(|state| match state {
            BindingState::Resolved(binding) if binding.timeline_key == timeline_key => {
                binding.last_change_id = Some(last_change_id);
                true
            }
            _ => false,
        });
    }

    pub fn mark_stale(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, BindingState::Resolved(_)) {
                *state = BindingState::Stale;
                true
            } else {
                false
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.state.subscribe()
    }
}

/// One-shot task resolving the binding at session start, retrying transient failures, and
/// resolving again whenever the coordinator marks the binding stale.
pub struct TimelineResolver {
    api: Arc<dyn TimelineApi>,
    device_name: String,
    binding: Arc<SharedBinding>,
    shutdown: CancellationToken,
    clock: Box<dyn Clock>,
}

impl TimelineResolver {
    pub fn new(
        api: Arc<dyn TimelineApi>,
        device_name: String,
        binding: Arc<SharedBinding>,
        shutdown: CancellationToken,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            api,
            device_name,
            binding,
            shutdown,
            clock,
        }
    }

    #[instrument(skip(self), fields(device = %self.device_name))]
    pub async fn resolve(&self) -> Result<TimelineBinding, ResolveError> {
        let timelines = self.api.list_timelines().await?;
        let chosen = select_timeline(&timelines, &self.device_name)
            .ok_or(ResolveError::NoTimelineAvailable)?;
        let environment = chosen.environment.as_ref().ok_or_else(|| {
            ResolveError::Malformed(format!("timeline {} has no environment", chosen.timeline_key))
        })?;

        Ok(TimelineBinding {
            timeline_key: chosen.timeline_key.clone(),
            schema: chosen.schema.clone(),
            last_change_id: chosen.last_change_id.clone(),
            environment_id: environment.environment_id.clone(),
        })
    }

    /// Resolves until it succeeds or fails for good. Returns false when cancelled or failed.
    async fn resolve_with_retry(&self) -> bool {
        let mut delay = INITIAL_RETRY_DELAY;
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                result = self.resolve() => result,
            };
            match result {
                Ok(binding) => {
                    info!(
                        "Uploading to timeline {} ({})",
                        binding.timeline_key, binding.schema.name
                    );
                    self.binding.set(BindingState::Resolved(binding));
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Timeline resolution failed, retrying in {delay:?}: {e}");
                }
                Err(e) => {
                    error!("Timeline resolution failed, uploads are disabled: {e}");
                    self.binding.set(BindingState::Failed(e.to_string()));
                    return false;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = self.clock.sleep(delay) => ()
            }
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut changes = self.binding.subscribe();
        while self.resolve_with_retry().await {
            let stale = tokio::select! {
                _ = self.shutdown.cancelled() => false,
                result = changes.wait_for(|v| *v == BindingState::Stale) => result.is_ok(),
            };
            if !stale {
                break;
            }
            info!("Timeline binding went stale, resolving again");
        }
        Ok(())
    }
}
