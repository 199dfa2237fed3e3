//! Lifecycle of one remote build attempt.
//!
//! ```text
//!  Pending ──run_async──► Running ──► Succeeded
//!                            │  └──► Failed(error)
//!                            └─cancel_as_local_build_finished─► LocalFinishedFirst
//! ```
//!
//! The terminal code is recorded through an [`ExitCodeCell`]: first writer
//! wins, except `Successful`, which overrides any earlier failure.

use crate::events::{BuildEvent, EventBus};
use crate::latch::BuildPhaseLatches;
use async_trait::async_trait;
use dbc_common::config::RemoteConfig;
use dbc_common::{
    BuildSessionId, DistBuildError, DistributedExitCode, ExitCode, ExitCodeCell, RemoteBuildMode,
    SessionIdCell,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ── Collaborators ───────────────────────────────────────────────────────────

/// What the remote side needs from its workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MinionRequirements {
    pub minion_type: Option<String>,
    pub minion_count: Option<u32>,
}

/// One submission to the remote build service.
#[derive(Debug, Clone)]
pub struct RemoteBuildRequest {
    pub invocation_id: Uuid,
    pub mode: RemoteBuildMode,
    pub targets: Vec<String>,
    pub minion_requirements: MinionRequirements,
}

impl RemoteBuildRequest {
    pub fn new(mode: RemoteBuildMode, targets: Vec<String>) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            mode,
            targets,
            minion_requirements: MinionRequirements::default(),
        }
    }
}

/// Outcome of a remote build attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: DistributedExitCode,
    pub exception: Option<Arc<DistBuildError>>,
    pub failure_stage: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            exit_code: DistributedExitCode::Successful,
            exception: None,
            failure_stage: None,
        }
    }

    pub fn failed(
        exit_code: DistributedExitCode,
        stage: impl Into<String>,
        error: DistBuildError,
    ) -> Self {
        Self {
            exit_code,
            exception: Some(Arc::new(error)),
            failure_stage: Some(stage.into()),
        }
    }

    /// Classify an error that escaped the attempt itself.
    fn from_error(error: DistBuildError) -> Self {
        let (code, stage) = match &error {
            DistBuildError::Upload(_) => (DistributedExitCode::PreparationStepFailed, "preparation"),
            err if err.is_local() => (DistributedExitCode::BuildStepLocalException, "local client"),
            _ => (DistributedExitCode::RemoteBuildFailed, "remote build"),
        };
        Self::failed(code, stage, error)
    }
}

/// Remote build service.
#[async_trait]
pub trait RemoteBuildController: Send + Sync {
    /// Run the remote build to completion. Assigns the session id into
    /// `session` once the service hands one out.
    async fn execute(
        &self,
        request: RemoteBuildRequest,
        session: Arc<SessionIdCell>,
    ) -> Result<ExecutionResult, DistBuildError>;

    /// Ask the service to wind down `session` with `status`.
    async fn terminate(
        &self,
        session: &BuildSessionId,
        status: DistributedExitCode,
        reason: &str,
    ) -> Result<(), DistBuildError>;

    /// Forward any per-rule failures the service collected.
    fn print_failures(&self, _events: &EventBus) {}
}

/// Unblocks local build steps waiting on remotely produced outputs.
pub trait RuleCompletionSynchronizer: Send + Sync {
    fn signal_completion_of_remote_build(&self, succeeded: bool);
}

/// Synchronizer for builds with no local step waiting on remote rules.
#[derive(Debug, Default)]
pub struct NoopSynchronizer;

impl RuleCompletionSynchronizer for NoopSynchronizer {
    fn signal_completion_of_remote_build(&self, _succeeded: bool) {}
}

// ── Monitor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemoteBuildMonitorConfig {
    /// Wait for the remote side to drain instead of killing it.
    pub graceful_shutdown: bool,
    pub kill_timeout: Duration,
}

impl Default for RemoteBuildMonitorConfig {
    fn default() -> Self {
        Self::from(&RemoteConfig::default())
    }
}

impl From<&RemoteConfig> for RemoteBuildMonitorConfig {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            graceful_shutdown: config.graceful_shutdown,
            kill_timeout: config.kill_timeout(),
        }
    }
}

/// Owns exactly one remote build attempt.
pub struct RemoteBuildMonitor {
    state: Arc<MonitorState>,
}

struct MonitorState {
    controller: Arc<dyn RemoteBuildController>,
    synchronizer: Arc<dyn RuleCompletionSynchronizer>,
    events: EventBus,
    config: RemoteBuildMonitorConfig,
    session: Arc<SessionIdCell>,
    exit_code: ExitCodeCell,
    latches: BuildPhaseLatches,
    cancel: CancellationToken,
    started: AtomicBool,
    terminated: AtomicBool,
    synchronizer_notified: AtomicBool,
    local_finished_first: AtomicBool,
    result: Mutex<Option<ExecutionResult>>,
}

impl RemoteBuildMonitor {
    pub fn new(
        controller: Arc<dyn RemoteBuildController>,
        synchronizer: Arc<dyn RuleCompletionSynchronizer>,
        events: EventBus,
        config: RemoteBuildMonitorConfig,
    ) -> Self {
        Self {
            state: Arc::new(MonitorState {
                controller,
                synchronizer,
                events,
                config,
                session: Arc::new(SessionIdCell::new()),
                exit_code: ExitCodeCell::new(),
                latches: BuildPhaseLatches::new(),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                synchronizer_notified: AtomicBool::new(false),
                local_finished_first: AtomicBool::new(false),
                result: Mutex::new(None),
            }),
        }
    }

    /// Submit the attempt to a background task.
    ///
    /// Returns `false` if an attempt was already submitted.
    pub fn run_async(&self, request: RemoteBuildRequest) -> bool {
        if self.state.started.swap(true, Ordering::SeqCst) {
            warn!("Remote build already started, ignoring second submission");
            return false;
        }
        info!(
            "Starting remote build {} in {} mode",
            request.invocation_id, request.mode
        );
        self.state.events.post(BuildEvent::RemoteBuildStarted {
            session_id: self.state.session.get().to_string(),
        });

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let session = Arc::clone(&state.session);
            let controller = Arc::clone(&state.controller);
            // Own task so a panicking controller still reaches `finish`.
            let mut attempt =
                tokio::spawn(async move { controller.execute(request, session).await });
            let outcome = tokio::select! {
                joined = &mut attempt => joined.unwrap_or_else(|err| {
                    error!("Remote build task failed: {}", err);
                    Err(DistBuildError::Interrupted(format!(
                        "running the remote build ({err})"
                    )))
                }),
                _ = state.cancel.cancelled() => {
                    attempt.abort();
                    Err(DistBuildError::Interrupted("running the remote build".to_string()))
                }
            };
            state.finish(outcome).await;
        });
        true
    }

    /// Run the attempt and wait for it. Failures are logged, not returned.
    pub async fn run_sync(&self, request: RemoteBuildRequest) -> DistributedExitCode {
        self.run_async(request);
        self.state.latches.remote_build_finished.wait().await;
        if let Some(ExecutionResult {
            exception: Some(err),
            failure_stage,
            ..
        }) = self.result()
        {
            warn!(
                "Remote build failed during {}: {}",
                failure_stage.as_deref().unwrap_or("unknown stage"),
                err
            );
        }
        self.exit_code()
    }

    /// Wind the remote attempt down because a local phase already finished.
    ///
    /// Leaves the monitor out of `Pending` before returning.
    pub async fn cancel_as_local_build_finished(
        &self,
        local_succeeded: bool,
        local_exit_code: ExitCode,
    ) {
        let state = &self.state;
        state.local_finished_first.store(true, Ordering::SeqCst);
        let current = state.exit_code.get();

        if current.is_success() {
            if !state.config.graceful_shutdown {
                debug!("Remote build already succeeded, cancelling remaining work");
                state.cancel.cancel();
            }
            return;
        }
        if !state
            .exit_code
            .set_if_pending(DistributedExitCode::LocalBuildFinishedFirst)
        {
            debug!("Remote build already finished with {}", current);
            return;
        }

        info!(
            "Local build finished first ({}), stopping remote build",
            local_exit_code
        );
        let reason = format!(
            "Local build finished first with exit code {} (succeeded: {})",
            local_exit_code.code(),
            local_succeeded
        );
        self.terminate_remote(DistributedExitCode::LocalBuildFinishedFirst, &reason)
            .await;

        if !state.started.load(Ordering::SeqCst) {
            return;
        }
        let finished = &state.latches.remote_build_finished;
        if state.config.graceful_shutdown {
            finished.wait().await;
            return;
        }
        if tokio::time::timeout(state.config.kill_timeout, finished.wait())
            .await
            .is_err()
        {
            warn!(
                "Remote build did not stop within {:?}, cancelling",
                state.config.kill_timeout
            );
            // The session id may have arrived while we waited.
            self.terminate_remote(DistributedExitCode::LocalBuildFinishedFirst, &reason)
                .await;
            state.cancel.cancel();
            finished.wait().await;
        }
    }

    /// Send the termination request. At most once per session.
    pub async fn terminate_remote(&self, status: DistributedExitCode, reason: &str) {
        self.state.terminate_remote(status, reason).await;
    }

    /// Render any failure captured by the attempt.
    pub fn print_any_failures(&self) {
        let Some(result) = self.result() else {
            return;
        };
        let Some(err) = result.exception.as_ref() else {
            return;
        };
        let stage = result.failure_stage.as_deref().unwrap_or("unknown stage");
        let message = format!("Remote build failed during {stage}: {err}");

        let local_won = self.state.local_finished_first.load(Ordering::SeqCst)
            || self.exit_code() == DistributedExitCode::LocalBuildFinishedFirst;
        // Cancelled by us, either after a success or once the kill timeout hit.
        let handled = self.state.cancel.is_cancelled();
        if local_won || handled {
            let note = if local_won {
                "local build already finished"
            } else {
                "handled by cancellation"
            };
            warn!("{} ({})", message, note);
            self.state.events.post(BuildEvent::ConsoleWarning {
                message: format!("{message} ({note})"),
            });
            return;
        }
        error!("{}", message);
        self.state
            .events
            .post(BuildEvent::ConsoleError { message });
        self.state.controller.print_failures(&self.state.events);
    }

    pub fn exit_code(&self) -> DistributedExitCode {
        self.state.exit_code.get()
    }

    pub fn session_id(&self) -> Arc<BuildSessionId> {
        self.state.session.get()
    }

    pub fn session(&self) -> Arc<SessionIdCell> {
        Arc::clone(&self.state.session)
    }

    pub fn result(&self) -> Option<ExecutionResult> {
        self.state
            .result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latches(&self) -> &BuildPhaseLatches {
        &self.state.latches
    }

    pub fn has_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state.latches.remote_build_finished.is_released()
    }
}

impl MonitorState {
    async fn finish(&self, outcome: Result<ExecutionResult, DistBuildError>) {
        let mut result = outcome.unwrap_or_else(ExecutionResult::from_error);
        if result.exit_code.is_pending() {
            warn!("Remote build returned without an outcome");
            result.exit_code = DistributedExitCode::RemoteBuildFailed;
        }

        let code = self.exit_code.record(result.exit_code);
        info!("Remote build finished: {} (recorded {})", result.exit_code, code);
        {
            let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(result);
        }

        if !self.synchronizer_notified.swap(true, Ordering::SeqCst) {
            self.synchronizer
                .signal_completion_of_remote_build(code.is_success());
        }
        self.events
            .post(BuildEvent::RemoteBuildFinished { exit_code: code });

        if code == DistributedExitCode::BuildStepLocalException {
            self.terminate_remote(code, "Local client failed while driving the remote build")
                .await;
        } else if code == DistributedExitCode::LocalBuildFinishedFirst {
            // Covers a session id that was still pending when the local build won.
            self.terminate_remote(code, "Local build finished first").await;
        }
        self.latches.release_all();
    }

    async fn terminate_remote(&self, status: DistributedExitCode, reason: &str) {
        let session = self.session.get();
        if session.is_pending() {
            debug!("No session id assigned yet, nothing to terminate");
            return;
        }
        if self
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Session {} already terminated", session);
            return;
        }
        match self.controller.terminate(&session, status, reason).await {
            Ok(()) => info!("Requested termination of session {}: {}", session, reason),
            Err(err) => warn!("Failed to terminate session {}: {}", session, err),
        }
    }
}
