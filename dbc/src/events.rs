//! Event broadcast for build lifecycle and console notifications.

use chrono::{DateTime, Utc};
use dbc_common::{DistributedExitCode, ExitCode, MinionId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_BUFFER: usize = 256;

/// Lifecycle notification posted by the orchestrator and its components.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BuildEvent {
    BuildStarted { build_id: String },
    BuildFinished { build_id: String, exit_code: Option<ExitCode> },
    /// The UI should forget progress so far; a new local phase starts.
    BuildReset,
    LocalBuildStatus { status: String },
    RemoteBuildStarted { session_id: String },
    RemoteBuildFinished { exit_code: DistributedExitCode },
    MinionDead { minion_id: MinionId, silence_ms: u64 },
    ConsoleWarning { message: String },
    ConsoleError { message: String },
}

impl BuildEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build_started",
            Self::BuildFinished { .. } => "build_finished",
            Self::BuildReset => "build_reset",
            Self::LocalBuildStatus { .. } => "local_build_status",
            Self::RemoteBuildStarted { .. } => "remote_build_started",
            Self::RemoteBuildFinished { .. } => "remote_build_finished",
            Self::MinionDead { .. } => "minion_dead",
            Self::ConsoleWarning { .. } => "console_warning",
            Self::ConsoleError { .. } => "console_error",
        }
    }

    pub fn local_status(status: impl Into<String>) -> Self {
        Self::LocalBuildStatus {
            status: status.into(),
        }
    }
}

/// An event stamped with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    #[serde(flatten)]
    pub event: BuildEvent,
    pub timestamp: DateTime<Utc>,
}

impl TimedEvent {
    /// Render as a JSON line.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(line) => Some(line),
            Err(err) => {
                warn!("Failed to serialize event {}: {}", self.event.name(), err);
                None
            }
        }
    }
}

/// Fire-and-forget broadcast bus.
///
/// Posting never blocks and never fails; subscribers that fall behind lose
/// the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TimedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimedEvent> {
        self.sender.subscribe()
    }

    pub fn post(&self, event: BuildEvent) {
        debug!(event = event.name(), "posting build event");
        let timed = TimedEvent {
            event,
            timestamp: Utc::now(),
        };
        // No receivers is fine.
        let _ = self.sender.send(timed);
    }
}
