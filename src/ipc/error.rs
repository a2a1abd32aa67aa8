//! Error types for the file-based worker protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while talking to a worker through its IPC directory.
#[derive(Debug, thiserror::Error)]
pub(crate) enum IpcError {
    /// The readiness marker did not appear in time.
    #[error(
        "Persistent worker not available after {waited_ms} ms. Please wait for sandbox to fully initialize or try again."
    )]
    WorkerUnavailable { waited_ms: u64 },

    /// A request is still pending or its output has not finished.
    #[error("Worker is busy with another request")]
    RequestConflict,

    /// No new output arrived within the inactivity bound.
    #[error("Worker request timed out after {timeout_secs} seconds without output")]
    RequestTimeout { timeout_secs: u64 },

    /// The output log was restarted for another request while this one was
    /// still being read.
    #[error("Output of request {request_id} was replaced by a newer request")]
    OutputReplaced { request_id: String },

    /// Filesystem operation on an IPC file failed.
    #[error("IPC file operation failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A request or event could not be serialized.
    #[error("Failed to encode worker message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IpcError {
    /// Creates a `WorkerUnavailable` error from the time spent waiting.
    pub(crate) fn worker_unavailable(waited: Duration) -> Self {
        Self::WorkerUnavailable {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `RequestTimeout` error from the inactivity bound.
    pub(crate) fn request_timeout(timeout: Duration) -> Self {
        Self::RequestTimeout {
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Wraps an IO error with the path it concerns.
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns true if the worker never became ready.
    pub(crate) fn is_worker_unavailable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. })
    }

    /// Returns true if another request still owns the worker.
    pub(crate) fn is_request_conflict(&self) -> bool {
        matches!(self, Self::RequestConflict)
    }

    /// Returns true if the output stream went quiet for too long.
    pub(crate) fn is_request_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}
