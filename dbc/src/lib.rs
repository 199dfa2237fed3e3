//! Distributed Build Client core.
//!
//! Races local builds against a remote build on a fleet of minions, tracks
//! minion liveness, publishes artifacts to a CAS, and analyzes the finished
//! build's critical path.

pub mod critical_path;
pub mod events;
pub mod health;
pub mod latch;
pub mod orchestrator;
pub mod remote;
pub mod uploader;

#[cfg(test)]
mod test_support;

pub use critical_path::{CriticalPathReport, RuleGraph, TraceFile, analyze};
pub use events::{BuildEvent, EventBus, TimedEvent};
pub use health::{HealthSnapshot, HealthTrackerConfig, MinionHealthTracker};
pub use latch::{BuildPhaseLatches, Latch};
pub use orchestrator::{BuildOrchestrator, LocalBuildRunner};
pub use remote::{
    ExecutionResult, RemoteBuildController, RemoteBuildMonitor, RemoteBuildMonitorConfig,
    RemoteBuildRequest, RuleCompletionSynchronizer,
};
pub use uploader::{
    BlobSource, CasClient, MultiThreadedBlobUploader, UploadRequest, UploadStats,
    UploaderSettings,
};
