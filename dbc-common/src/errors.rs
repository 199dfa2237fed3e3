//! Error taxonomy for the distributed build client.
//!
//! | Variant family        | Raised by                 | Policy                        |
//! |-----------------------|---------------------------|-------------------------------|
//! | `Io`, `Interrupted`   | remote build attempt      | mapped to a local-exception code |
//! | `Remote*`             | remote build controller   | passed through as-is          |
//! | `Termination`         | termination request       | logged, never rethrown        |
//! | [`UploadError`]       | blob uploader             | propagated to every caller    |

use crate::types::Digest;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while driving a distributed build.
#[derive(Debug, Error)]
pub enum DistBuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted while {0}")]
    Interrupted(String),

    #[error("remote build failed: {0}")]
    Remote(String),

    #[error("failed to terminate remote session {session}: {message}")]
    Termination { session: String, message: String },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl DistBuildError {
    /// Whether this failure originated in the local process rather than on
    /// the remote side.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Interrupted(_) | Self::Timeout { .. } | Self::InvalidState(_)
        )
    }
}

/// Failure publishing a blob to the CAS.
///
/// Cloneable so one failure can be handed to every caller waiting on the
/// same digest.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("missing-check call failed for {count} digests: {message}")]
    MissingCheck { count: usize, message: Arc<str> },

    #[error("batch upload of {count} blobs failed: {message}")]
    BatchUpload { count: usize, message: Arc<str> },

    #[error("upload of {digest} failed with status {status}: {message}")]
    Blob {
        digest: Digest,
        status: i32,
        message: Arc<str>,
    },

    #[error("failed to read source for {digest}: {message}")]
    Source { digest: Digest, message: Arc<str> },

    #[error("uploader shut down before {digest} was resolved")]
    Abandoned { digest: Digest },
}

impl UploadError {
    pub fn message(&self) -> &str {
        match self {
            Self::MissingCheck { message, .. }
            | Self::BatchUpload { message, .. }
            | Self::Blob { message, .. }
            | Self::Source { message, .. } => message,
            Self::Abandoned { .. } => "abandoned",
        }
    }
}
