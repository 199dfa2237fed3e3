//! Common types used across DBC components.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Unique identifier for a minion (remote worker process) in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinionId(pub String);

impl MinionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MinionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one run of a minion process. A restarted minion keeps its
/// id but reports a new run id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one distributed build session, assigned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildSessionId(pub String);

impl BuildSessionId {
    /// Sentinel used until the remote service hands out the real id.
    pub const PENDING: &'static str = "PENDING_SESSION_ID";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn pending() -> Self {
        Self(Self::PENDING.to_string())
    }

    pub fn is_pending(&self) -> bool {
        self.0 == Self::PENDING
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BuildSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared slot holding the session id.
///
/// Starts out pending and is replaced exactly once. Readers always observe
/// either the sentinel or the final id, never a partial update.
#[derive(Debug)]
pub struct SessionIdCell {
    inner: Mutex<Arc<BuildSessionId>>,
}

impl Default for SessionIdCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Arc::new(BuildSessionId::pending())),
        }
    }

    /// Current value (may still be the pending sentinel).
    pub fn get(&self) -> Arc<BuildSessionId> {
        Arc::clone(&self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the pending sentinel with `id`.
    ///
    /// Returns `false` (and leaves the cell untouched) if an id was already
    /// assigned.
    pub fn assign(&self, id: BuildSessionId) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.is_pending() {
            return false;
        }
        *guard = Arc::new(id);
        true
    }

    pub fn is_assigned(&self) -> bool {
        !self.get().is_pending()
    }
}

/// Outcome of a distributed (remote) build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DistributedExitCode {
    /// No outcome recorded yet.
    Pending = 0,
    /// Remote build finished and every rule succeeded.
    Successful = 1,
    /// A local build phase won the race and the remote build was wound down.
    LocalBuildFinishedFirst = 2,
    /// The client process failed while driving the remote build (IO, interruption).
    BuildStepLocalException = 3,
    /// The remote side reported a failed build step.
    RemoteBuildFailed = 4,
    /// Preparing the remote build (snapshot, uploads) failed.
    PreparationStepFailed = 5,
    /// The coordinator reported that no minion could be allocated.
    MinionAllocationFailed = 6,
    /// The remote build was cancelled before completion.
    Cancelled = 7,
}

impl DistributedExitCode {
    const ALL: [DistributedExitCode; 8] = [
        Self::Pending,
        Self::Successful,
        Self::LocalBuildFinishedFirst,
        Self::BuildStepLocalException,
        Self::RemoteBuildFailed,
        Self::PreparationStepFailed,
        Self::MinionAllocationFailed,
        Self::Cancelled,
    ];

    fn from_tag(tag: u8) -> Self {
        Self::ALL
            .get(usize::from(tag))
            .copied()
            .unwrap_or(Self::Pending)
    }

    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }

    pub fn is_success(self) -> bool {
        self == Self::Successful
    }

    /// Numeric code reported to callers and logs.
    pub fn code(self) -> i32 {
        match self {
            Self::Pending => 1000,
            Self::Successful => 0,
            Self::LocalBuildFinishedFirst => 1001,
            Self::BuildStepLocalException => 1002,
            Self::RemoteBuildFailed => 1003,
            Self::PreparationStepFailed => 1004,
            Self::MinionAllocationFailed => 1005,
            Self::Cancelled => 1006,
        }
    }

    /// Map a remote outcome onto the exit code a local invocation reports.
    pub fn to_exit_code(self) -> ExitCode {
        match self {
            Self::Successful => ExitCode::Success,
            Self::LocalBuildFinishedFirst | Self::Cancelled => ExitCode::Interrupted,
            Self::BuildStepLocalException | Self::PreparationStepFailed => ExitCode::Fatal,
            Self::Pending | Self::RemoteBuildFailed | Self::MinionAllocationFailed => {
                ExitCode::BuildError
            }
        }
    }
}

impl std::fmt::Display for DistributedExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Successful => write!(f, "successful"),
            Self::LocalBuildFinishedFirst => write!(f, "local_build_finished_first"),
            Self::BuildStepLocalException => write!(f, "build_step_local_exception"),
            Self::RemoteBuildFailed => write!(f, "remote_build_failed"),
            Self::PreparationStepFailed => write!(f, "preparation_step_failed"),
            Self::MinionAllocationFailed => write!(f, "minion_allocation_failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// First-writer-wins cell for the terminal [`DistributedExitCode`].
///
/// Leaves `Pending` exactly once. The single exception: `Successful` replaces
/// any recorded failure, and nothing replaces `Successful`.
#[derive(Debug)]
pub struct ExitCodeCell {
    tag: AtomicU8,
}

impl Default for ExitCodeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitCodeCell {
    pub fn new() -> Self {
        Self {
            tag: AtomicU8::new(DistributedExitCode::Pending as u8),
        }
    }

    pub fn get(&self) -> DistributedExitCode {
        DistributedExitCode::from_tag(self.tag.load(Ordering::SeqCst))
    }

    /// Set `code` only if nothing has been recorded yet.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn set_if_pending(&self, code: DistributedExitCode) -> bool {
        if code.is_pending() {
            return false;
        }
        self.tag
            .compare_exchange(
                DistributedExitCode::Pending as u8,
                code as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Record success, overriding any previously recorded failure.
    ///
    /// Returns `true` if the stored value changed.
    pub fn set_successful(&self) -> bool {
        let prev = self
            .tag
            .swap(DistributedExitCode::Successful as u8, Ordering::SeqCst);
        prev != DistributedExitCode::Successful as u8
    }

    /// Route `code` through the right transition.
    pub fn record(&self, code: DistributedExitCode) -> DistributedExitCode {
        if code.is_success() {
            self.set_successful();
        } else {
            self.set_if_pending(code);
        }
        self.get()
    }
}

/// Exit code of a local build (or of the whole invocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    BuildError,
    Interrupted,
    Fatal,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::BuildError => 1,
            Self::Interrupted => 130,
            Self::Fatal => 10,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::BuildError => write!(f, "build_error"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Content digest addressing a blob in the CAS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}
