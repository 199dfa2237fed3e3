//! Shared types, errors and configuration for the Distributed Build Client.

pub mod clock;
pub mod config;
pub mod errors;
pub mod types;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{DistBuildConfig, RemoteBuildMode};
pub use errors::{DistBuildError, UploadError};
pub use types::{
    BuildSessionId, Digest, DistributedExitCode, ExitCode, ExitCodeCell, MinionId, RunId,
    SessionIdCell,
};
