//! Isolated execution environments, one per chat session.
//!
//! A [`SandboxPlatform`] owns the name registry and the primitives the
//! controller composes: lookup, create, terminate, exec, file upload and
//! starting the worker. Docker containers are the production backend; the
//! local backend runs the worker as a plain host process.

mod docker;
mod error;
mod local;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerPlatform;
pub(crate) use error::SandboxError;
pub(crate) use local::LocalPlatform;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Backend, Config};

/// Lifecycle state of a sandbox as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SandboxState {
    Absent,
    Creating,
    Running,
    Terminated,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Reference to one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxHandle {
    pub name: String,
    /// Platform-specific identifier
    pub id: String,
    /// Host path of the IPC directory
    pub ipc_dir: PathBuf,
    pub state: SandboxState,
}

/// Well-known locations, as seen from inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxPaths {
    pub ipc: PathBuf,
    /// Root of all per-account, per-session data
    pub workspace: PathBuf,
    /// Link to this session's data directory
    pub data: PathBuf,
    /// Worker binary and configuration
    pub tools: PathBuf,
    /// Worker state kept across sandbox restarts
    pub state: PathBuf,
    /// Executable started as the worker
    pub worker_program: PathBuf,
}

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How to start the worker inside a sandbox.
#[derive(Debug, Clone)]
pub(crate) struct WorkerLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: PathBuf,
}

/// Trait for sandbox backends.
#[async_trait]
pub(crate) trait SandboxPlatform: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Find a sandbox by name. `None` when no sandbox is registered.
    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>, SandboxError>;

    /// Register and start a sandbox. Fails with `AlreadyExists` if the name is
    /// taken, including by a concurrent caller.
    async fn create(&self, name: &str) -> Result<SandboxHandle, SandboxError>;

    /// Stop and unregister a sandbox. Absent sandboxes are not an error.
    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Run a command to completion.
    async fn exec(&self, handle: &SandboxHandle, argv: &[String]) -> Result<ExecOutput, SandboxError>;

    /// Write a file, creating parent directories.
    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &Path,
        contents: Bytes,
        mode: u32,
    ) -> Result<(), SandboxError>;

    /// Start the worker in the background.
    async fn spawn_worker(&self, handle: &SandboxHandle, launch: &WorkerLaunch) -> Result<(), SandboxError>;

    /// Locations inside the sandbox called `name`.
    fn paths(&self, name: &str) -> SandboxPaths;

    /// Whether the worker binary must be copied in before starting it.
    fn needs_worker_binary(&self) -> bool;
}

/// Connect to the backend selected in `config`.
pub(crate) fn connect(config: &Config) -> Result<Arc<dyn SandboxPlatform>> {
    Ok(match config.sandbox.backend {
        Backend::Docker => Arc::new(DockerPlatform::connect(config.sandbox.clone())?),
        Backend::Local => Arc::new(LocalPlatform::new(
            config.sandbox.state_dir(),
            config.sandbox.data_root(),
        )),
    })
}
