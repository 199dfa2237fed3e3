//! Scripted collaborators for unit tests.

use crate::events::EventBus;
use crate::latch::Latch;
use crate::orchestrator::LocalBuildRunner;
use crate::remote::{
    ExecutionResult, RemoteBuildController, RemoteBuildRequest, RuleCompletionSynchronizer,
};
use async_trait::async_trait;
use dbc_common::{BuildSessionId, DistBuildError, DistributedExitCode, ExitCode, SessionIdCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ControllerScript {
    Succeed,
    RemoteFailure,
    LocalFailure,
    /// Never returns until the attempt is cancelled.
    Hang,
    /// Hands out the session id only after the given delay, then hangs.
    LateSessionThenHang(Duration),
    Panic,
}

pub(crate) struct MockController {
    script: ControllerScript,
    delay: Option<Duration>,
    executing: Latch,
    executions: AtomicUsize,
    printed: AtomicUsize,
    terminations: Mutex<Vec<(String, DistributedExitCode, String)>>,
}

impl MockController {
    pub(crate) fn new(script: ControllerScript) -> Self {
        Self {
            script,
            delay: None,
            executing: Latch::new(),
            executions: AtomicUsize::new(0),
            printed: AtomicUsize::new(0),
            terminations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) async fn wait_until_executing(&self) {
        self.executing.wait().await;
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub(crate) fn printed_failures(&self) -> usize {
        self.printed.load(Ordering::SeqCst)
    }

    pub(crate) fn terminations(&self) -> Vec<(String, DistributedExitCode, String)> {
        self.terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteBuildController for MockController {
    async fn execute(
        &self,
        _request: RemoteBuildRequest,
        session: Arc<SessionIdCell>,
    ) -> Result<ExecutionResult, DistBuildError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let ControllerScript::LateSessionThenHang(after) = self.script {
            tokio::time::sleep(after).await;
        }
        session.assign(BuildSessionId::new("session-1"));
        self.executing.release();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.script {
            ControllerScript::Succeed => Ok(ExecutionResult::success()),
            ControllerScript::RemoteFailure => Ok(ExecutionResult::failed(
                DistributedExitCode::RemoteBuildFailed,
                "remote step",
                DistBuildError::Remote("rule //app:lib failed".into()),
            )),
            ControllerScript::LocalFailure => Err(DistBuildError::Io(std::io::Error::other(
                "connection to frontend lost",
            ))),
            ControllerScript::Hang | ControllerScript::LateSessionThenHang(_) => {
                futures::future::pending().await
            }
            ControllerScript::Panic => panic!("controller lost its connection state"),
        }
    }

    async fn terminate(
        &self,
        session: &BuildSessionId,
        status: DistributedExitCode,
        reason: &str,
    ) -> Result<(), DistBuildError> {
        self.terminations
            .lock()
            .unwrap()
            .push((session.to_string(), status, reason.to_string()));
        Ok(())
    }

    fn print_failures(&self, _events: &EventBus) {
        self.printed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingSynchronizer {
    signals: Mutex<Vec<bool>>,
}

impl RecordingSynchronizer {
    pub(crate) fn signals(&self) -> Vec<bool> {
        self.signals.lock().unwrap().clone()
    }
}

impl RuleCompletionSynchronizer for RecordingSynchronizer {
    fn signal_completion_of_remote_build(&self, succeeded: bool) {
        self.signals.lock().unwrap().push(succeeded);
    }
}

/// Local build that returns a fixed outcome after an optional delay.
pub(crate) struct ScriptedRunner {
    outcome: Result<ExitCode, String>,
    delay: Option<Duration>,
    runs: AtomicUsize,
    primes: AtomicUsize,
}

impl ScriptedRunner {
    pub(crate) fn finishing(code: ExitCode) -> Self {
        Self {
            outcome: Ok(code),
            delay: None,
            runs: AtomicUsize::new(0),
            primes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            ..Self::finishing(ExitCode::Success)
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn primes(&self) -> usize {
        self.primes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalBuildRunner for ScriptedRunner {
    async fn run(&self) -> Result<ExitCode, DistBuildError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome
            .clone()
            .map_err(DistBuildError::InvalidState)
    }

    async fn prime_rule_key_caches(&self) -> Result<(), DistBuildError> {
        self.primes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
