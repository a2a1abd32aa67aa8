//! Local backend: sandboxes are host directories and the worker is a plain
//! host process.
//!
//! Useful for:
//! - Development without Docker
//! - Hosts that are already isolated (a VM per tenant)
//! - CLI tests that exercise the real worker binary
//!
//! `create_dir` on the sandbox directory is the name registry, so two
//! concurrent creators cannot both win.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tracing::{debug, info};

use super::{
    ExecOutput, SandboxError, SandboxHandle, SandboxPaths, SandboxPlatform, SandboxState,
    WorkerLaunch,
};

const RECORD_FILE: &str = "sandbox.toml";
const PID_FILE: &str = "worker.pid";

#[derive(Debug, Serialize, Deserialize)]
struct SandboxRecord {
    id: String,
    created_at: DateTime<Utc>,
}

/// Runs sandboxes as host directories.
#[derive(Debug, Clone)]
pub(crate) struct LocalPlatform {
    root: PathBuf,
    state_dir: PathBuf,
    data_root: PathBuf,
}

impl LocalPlatform {
    pub(crate) fn new(state_dir: PathBuf, data_root: PathBuf) -> Self {
        Self {
            root: state_dir.join("sandboxes"),
            state_dir,
            data_root,
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn record_id(&self, name: &str) -> Option<String> {
        let raw = fs::read_to_string(self.dir(name).join(RECORD_FILE)).await.ok()?;
        toml::from_str::<SandboxRecord>(&raw).ok().map(|r| r.id)
    }

    async fn worker_pid(&self, name: &str) -> Option<u32> {
        let raw = fs::read_to_string(self.dir(name).join(PID_FILE)).await.ok()?;
        raw.trim().parse().ok()
    }
}

async fn process_alive(pid: u32) -> bool {
    tokio::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

#[async_trait]
impl SandboxPlatform for LocalPlatform {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>, SandboxError> {
        let dir = self.dir(name);
        let record = match fs::read_to_string(dir.join(RECORD_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Registered but not yet recorded: a creator is mid-way
                return Ok(fs::try_exists(&dir)
                    .await?
                    .then(|| SandboxHandle {
                        name: name.to_string(),
                        id: String::new(),
                        ipc_dir: dir.join("ipc"),
                        state: SandboxState::Creating,
                    }));
            }
            Err(e) => return Err(e.into()),
        };
        let record: SandboxRecord = toml::from_str(&record)
            .map_err(|e| SandboxError::unreachable(name, format!("corrupt sandbox record: {e}")))?;

        let state = match self.worker_pid(name).await {
            Some(pid) if !process_alive(pid).await => SandboxState::Terminated,
            _ => SandboxState::Running,
        };

        Ok(Some(SandboxHandle {
            name: name.to_string(),
            id: record.id,
            ipc_dir: dir.join("ipc"),
            state,
        }))
    }

    async fn create(&self, name: &str) -> Result<SandboxHandle, SandboxError> {
        fs::create_dir_all(&self.root).await?;
        let dir = self.dir(name);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SandboxError::already_exists(name));
            }
            Err(e) => return Err(e.into()),
        }

        let ipc_dir = dir.join("ipc");
        fs::create_dir_all(&ipc_dir).await?;
        fs::create_dir_all(&self.data_root).await?;

        let record = SandboxRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        };
        let body = toml::to_string_pretty(&record)
            .map_err(|e| SandboxError::container_failed(e.to_string()))?;
        fs::write(dir.join(RECORD_FILE), body).await?;

        info!(name, id = %record.id, "local sandbox created");
        Ok(SandboxHandle {
            name: name.to_string(),
            id: record.id,
            ipc_dir,
            state: SandboxState::Running,
        })
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        if !handle.id.is_empty() {
            if let Some(current) = self.record_id(&handle.name).await {
                if current != handle.id {
                    debug!(name = %handle.name, stale = %handle.id, current = %current, "sandbox already replaced");
                    return Ok(());
                }
            }
        }
        if let Some(pid) = self.worker_pid(&handle.name).await {
            debug!(pid, "stopping local worker");
            let _ = tokio::process::Command::new("kill")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
        match fs::remove_dir_all(self.dir(&handle.name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, handle: &SandboxHandle, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::exec_failed(&handle.name, -1, "empty command"));
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(self.dir(&handle.name))
            .output()
            .await?;
        Ok(ExecOutput {
            exit_code: output.status.code().map_or(-1, i64::from),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(
        &self,
        _handle: &SandboxHandle,
        path: &Path,
        contents: Bytes,
        mode: u32,
    ) -> Result<(), SandboxError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, &contents).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    async fn spawn_worker(&self, handle: &SandboxHandle, launch: &WorkerLaunch) -> Result<(), SandboxError> {
        if let Some(parent) = launch.log_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&launch.log_file)?;
        let child = tokio::process::Command::new(&launch.program)
            .args(&launch.args)
            .current_dir(self.dir(&handle.name))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| SandboxError::container_failed("worker exited immediately"))?;
        fs::write(self.dir(&handle.name).join(PID_FILE), pid.to_string()).await?;
        info!(name = %handle.name, pid, "local worker started");
        Ok(())
    }

    fn paths(&self, name: &str) -> SandboxPaths {
        let dir = self.dir(name);
        SandboxPaths {
            ipc: dir.join("ipc"),
            workspace: self.data_root.clone(),
            data: dir.join("data"),
            tools: dir.join("opt"),
            state: self.state_dir.join("agent-state"),
            worker_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("agentbox")),
        }
    }

    fn needs_worker_binary(&self) -> bool {
        false
    }
}
