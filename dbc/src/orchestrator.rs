//! Drives one build invocation against a remote build.
//!
//! | Mode                        | Remote          | Local                              |
//! |-----------------------------|-----------------|------------------------------------|
//! | `fire_and_forget`           | sync (enqueue)  | none, reports success              |
//! | `rule_key_divergence_check` | sync            | primes rule-key caches only        |
//! | `no_wait_for_remote`        | async           | racing, then synchronized if lost  |
//! | `wait_for_remote`           | async           | synchronized                       |
//!
//! The returned exit code comes from whichever local phase finished. `None`
//! means no local phase produced one and the caller should fall back to the
//! remote result.

use crate::events::{BuildEvent, EventBus};
use crate::remote::{RemoteBuildMonitor, RemoteBuildRequest};
use async_trait::async_trait;
use dbc_common::{DistBuildError, DistributedExitCode, ExitCode, RemoteBuildMode};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A local build phase.
#[async_trait]
pub trait LocalBuildRunner: Send + Sync {
    async fn run(&self) -> Result<ExitCode, DistBuildError>;

    async fn prime_rule_key_caches(&self) -> Result<(), DistBuildError> {
        Ok(())
    }
}

pub struct BuildOrchestrator {
    monitor: Arc<RemoteBuildMonitor>,
    racing: Arc<dyn LocalBuildRunner>,
    synchronized: Arc<dyn LocalBuildRunner>,
    events: EventBus,
    request: RemoteBuildRequest,
}

impl BuildOrchestrator {
    pub fn new(
        monitor: Arc<RemoteBuildMonitor>,
        racing: Arc<dyn LocalBuildRunner>,
        synchronized: Arc<dyn LocalBuildRunner>,
        events: EventBus,
        request: RemoteBuildRequest,
    ) -> Self {
        Self {
            monitor,
            racing,
            synchronized,
            events,
            request,
        }
    }

    pub async fn build(&self, mode: RemoteBuildMode, allow_local_fallback: bool) -> Option<ExitCode> {
        let build_id = self.request.invocation_id.to_string();
        info!("Build {} starting in {} mode", build_id, mode);
        self.events.post(BuildEvent::BuildStarted {
            build_id: build_id.clone(),
        });

        let exit_code = match mode {
            RemoteBuildMode::FireAndForget => self.fire_and_forget().await,
            RemoteBuildMode::RuleKeyDivergenceCheck => self.rule_key_divergence_check().await,
            RemoteBuildMode::NoWaitForRemote => {
                self.monitor.run_async(self.request.clone());
                match self.racing_phase().await {
                    Some(code) => Some(code),
                    None => self.synchronized_phase(allow_local_fallback).await,
                }
            }
            RemoteBuildMode::WaitForRemote => {
                self.monitor.run_async(self.request.clone());
                self.synchronized_phase(allow_local_fallback).await
            }
        };

        if matches!(
            mode,
            RemoteBuildMode::NoWaitForRemote | RemoteBuildMode::WaitForRemote
        ) {
            self.monitor.print_any_failures();
        }
        info!(
            "Build {} finished: local {:?}, remote {}",
            build_id,
            exit_code,
            self.remote_exit_code()
        );
        self.events.post(BuildEvent::BuildFinished {
            build_id,
            exit_code,
        });
        exit_code
    }

    pub fn remote_exit_code(&self) -> DistributedExitCode {
        self.monitor.exit_code()
    }

    pub fn monitor(&self) -> &Arc<RemoteBuildMonitor> {
        &self.monitor
    }

    async fn fire_and_forget(&self) -> Option<ExitCode> {
        let code = self.monitor.run_sync(self.request.clone()).await;
        debug!("Remote build enqueued ({})", code);
        Some(ExitCode::Success)
    }

    async fn rule_key_divergence_check(&self) -> Option<ExitCode> {
        self.events.post(BuildEvent::local_status("priming rule key caches"));
        if let Err(err) = self.racing.prime_rule_key_caches().await {
            warn!("Failed to prime rule key caches: {}", err);
        }
        let code = self.monitor.run_sync(self.request.clone()).await;
        Some(code.to_exit_code())
    }

    /// Race a local build against the remote one. `None` if the remote side
    /// finished first or the local build could not complete.
    async fn racing_phase(&self) -> Option<ExitCode> {
        self.events.post(BuildEvent::local_status("racing"));
        let racing_done = &self.monitor.latches().racing_phase_done;

        let outcome = tokio::select! {
            result = self.racing.run() => Some(result),
            _ = racing_done.wait() => None,
        };

        match outcome {
            Some(Ok(code)) => {
                info!("Racing build finished first with {}", code);
                self.events
                    .post(BuildEvent::local_status(format!("racing build finished: {code}")));
                self.monitor
                    .cancel_as_local_build_finished(code.is_success(), code)
                    .await;
                Some(code)
            }
            Some(Err(err)) => {
                warn!("Racing build failed, continuing with synchronized build: {}", err);
                None
            }
            None => {
                info!(
                    "Remote build finished ({}) before racing build",
                    self.remote_exit_code()
                );
                None
            }
        }
    }

    async fn synchronized_phase(&self, allow_local_fallback: bool) -> Option<ExitCode> {
        let remote = self.remote_exit_code();
        if self.monitor.is_finished() && !remote.is_success() && !allow_local_fallback {
            warn!(
                "Remote build failed with {} and local fallback is disabled",
                remote
            );
            return None;
        }

        self.events.post(BuildEvent::BuildReset);
        self.events.post(BuildEvent::local_status("synchronized build"));

        match self.synchronized.run().await {
            Ok(code) => {
                info!("Synchronized build finished with {}", code);
                self.monitor
                    .cancel_as_local_build_finished(code.is_success(), code)
                    .await;
                self.monitor.latches().synchronized_phase_ready.wait().await;
                Some(code)
            }
            Err(err) => {
                error!("Synchronized build failed: {}", err);
                self.monitor.latches().remote_build_finished.wait().await;
                None
            }
        }
    }
}
