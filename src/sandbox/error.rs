//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use crate::ipc::IpcError;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SandboxError {
    /// The platform could not be reached or refused the operation.
    #[error("Sandbox {name} is unreachable: {message}")]
    Unreachable { name: String, message: String },

    /// Another caller registered the same sandbox name first.
    #[error("Sandbox {name} already exists")]
    AlreadyExists { name: String },

    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container operation failed (create, start, remove, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// A command inside the sandbox exited unsuccessfully.
    #[error("Command in sandbox {name} failed with exit code {exit_code}: {stderr}")]
    ExecFailed {
        name: String,
        exit_code: i64,
        stderr: String,
    },

    /// Host filesystem operation failed.
    #[error("Sandbox filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// The worker's IPC directory could not be used.
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl SandboxError {
    /// Creates an `Unreachable` error.
    pub(crate) fn unreachable(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an `AlreadyExists` error.
    pub(crate) fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Creates a `DockerUnavailable` error.
    pub(crate) fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub(crate) fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailed` error.
    pub(crate) fn exec_failed(
        name: impl Into<String>,
        exit_code: i64,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ExecFailed {
            name: name.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Returns true if this is a lost creation race.
    pub(crate) fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub(crate) fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }
}
