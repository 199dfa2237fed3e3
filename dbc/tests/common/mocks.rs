//! In-memory collaborators for driving the library end to end.

use async_trait::async_trait;
use dbc::remote::{ExecutionResult, RemoteBuildController, RemoteBuildRequest};
use dbc::uploader::{CasClient, UploadData, UploadResult};
use dbc::{LocalBuildRunner, RuleCompletionSynchronizer};
use dbc_common::{BuildSessionId, DistBuildError, Digest, DistributedExitCode, ExitCode, SessionIdCell};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Remote service that finishes after `delay` with `outcome`.
pub struct FakeRemoteService {
    pub session_id: String,
    pub delay: Duration,
    pub outcome: DistributedExitCode,
    pub terminations: Mutex<Vec<(String, DistributedExitCode)>>,
}

impl FakeRemoteService {
    pub fn new(delay: Duration, outcome: DistributedExitCode) -> Self {
        Self {
            session_id: "it-session".to_string(),
            delay,
            outcome,
            terminations: Mutex::new(Vec::new()),
        }
    }

    pub fn terminations(&self) -> Vec<(String, DistributedExitCode)> {
        self.terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteBuildController for FakeRemoteService {
    async fn execute(
        &self,
        _request: RemoteBuildRequest,
        session: Arc<SessionIdCell>,
    ) -> Result<ExecutionResult, DistBuildError> {
        session.assign(BuildSessionId::new(self.session_id.clone()));
        tokio::time::sleep(self.delay).await;
        if self.outcome.is_success() {
            Ok(ExecutionResult::success())
        } else {
            Ok(ExecutionResult::failed(
                self.outcome,
                "remote execution",
                DistBuildError::Remote(format!("remote build ended with {}", self.outcome)),
            ))
        }
    }

    async fn terminate(
        &self,
        session: &BuildSessionId,
        status: DistributedExitCode,
        _reason: &str,
    ) -> Result<(), DistBuildError> {
        self.terminations
            .lock()
            .unwrap()
            .push((session.to_string(), status));
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingSynchronizer {
    pub calls: AtomicUsize,
}

impl RuleCompletionSynchronizer for CountingSynchronizer {
    fn signal_completion_of_remote_build(&self, _succeeded: bool) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Local build that takes `delay` and then returns `code`.
pub struct TimedLocalBuild {
    pub delay: Duration,
    pub code: ExitCode,
    pub runs: AtomicUsize,
}

impl TimedLocalBuild {
    pub fn new(delay: Duration, code: ExitCode) -> Self {
        Self {
            delay,
            code,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalBuildRunner for TimedLocalBuild {
    async fn run(&self) -> Result<ExitCode, DistBuildError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.code)
    }
}

/// CAS that stores blobs in memory and can reject chosen hashes.
#[derive(Default)]
pub struct InMemoryCas {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub rejected: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

impl InMemoryCas {
    pub fn reject(&self, hash: &str, message: &str) {
        self.rejected
            .lock()
            .unwrap()
            .insert(hash.to_string(), message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stored(&self, hash: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(hash).cloned()
    }
}

#[async_trait]
impl CasClient for InMemoryCas {
    async fn find_missing(&self, digests: &[Digest]) -> Result<HashSet<String>, DistBuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .iter()
            .filter(|d| !blobs.contains_key(&d.hash))
            .map(|d| d.hash.clone())
            .collect())
    }

    async fn batch_update(&self, uploads: Vec<UploadData>) -> Result<Vec<UploadResult>, DistBuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rejected = self.rejected.lock().unwrap();
        let mut blobs = self.blobs.lock().unwrap();
        Ok(uploads
            .into_iter()
            .map(|upload| match rejected.get(&upload.digest.hash) {
                Some(message) => UploadResult::failed(upload.digest, 8, message.clone()),
                None => {
                    blobs.insert(upload.digest.hash.clone(), upload.data);
                    UploadResult::ok(upload.digest)
                }
            })
            .collect())
    }
}
