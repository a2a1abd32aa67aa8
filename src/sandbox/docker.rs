//! Docker backend: one long-lived container per sandbox name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{
    ExecOutput, SandboxError, SandboxHandle, SandboxPaths, SandboxPlatform, SandboxState,
    WorkerLaunch,
};
use crate::config::{expand_path, NetworkPolicy, SandboxConfig};

const IPC_DIR_LABEL: &str = "agentbox.ipc-dir";
const MANAGED_LABEL: &str = "agentbox.managed";

const CONTAINER_IPC: &str = "/ipc";
const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_DATA: &str = "/data";
const CONTAINER_TOOLS: &str = "/opt/agentbox";
const CONTAINER_STATE: &str = "/var/lib/agentbox";

/// Runs sandboxes as Docker containers
pub(crate) struct DockerPlatform {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerPlatform {
    pub(crate) fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::docker_unavailable(format!("{e}. Is Docker running?"))
        })?;
        Ok(Self { docker, config })
    }

    fn build_container_config(&self, ipc_dir: &Path) -> Result<ContainerConfig<String>> {
        let sandbox = &self.config;
        let state_dir = sandbox.state_dir();

        // Build volume bindings
        let mut binds = vec![
            format!("{}:{CONTAINER_IPC}:rw", ipc_dir.display()),
            format!("{}:{CONTAINER_WORKSPACE}:rw", sandbox.data_root().display()),
            format!(
                "{}:{CONTAINER_STATE}:rw",
                state_dir.join("agent-state").display()
            ),
            // Agent conversation history, so resumed sessions survive recycling
            format!("{}:/root/.claude:rw", state_dir.join("claude").display()),
        ];

        // Add configured mounts
        for mount in &sandbox.mounts {
            let host_path = expand_path(&mount.host);
            let mode = if mount.readonly { "ro" } else { "rw" };
            binds.push(format!(
                "{}:{}:{}",
                host_path.display(),
                mount.container,
                mode
            ));
        }

        // Parse resource limits
        let memory = parse_memory_limit(&sandbox.resources.memory)?;
        let cpus = sandbox.resources.cpus.parse::<f64>().unwrap_or(2.0);
        let lifetime_secs = u64::from(sandbox.resources.max_lifetime_minutes) * 60;

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (IPC_DIR_LABEL.to_string(), ipc_dir.display().to_string()),
        ]);

        let mut config = ContainerConfig {
            image: Some(sandbox.image.clone()),
            // The container lives until it is terminated or its lifetime ends
            cmd: Some(vec!["sleep".to_string(), lifetime_secs.to_string()]),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: Some(memory),
                nano_cpus: Some((cpus * 1_000_000_000.0) as i64),
                dns: Some(sandbox.network.dns.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        // Apply network policy
        if sandbox.network.policy == NetworkPolicy::Deny {
            if let Some(ref mut host_config) = config.host_config {
                host_config.network_mode = Some("none".to_string());
            }
        }

        Ok(config)
    }

    fn handle_from(name: &str, inspected: ContainerInspectResponse) -> SandboxHandle {
        let status = inspected.state.and_then(|s| s.status);
        let state = match status {
            Some(ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::RESTARTING) => {
                SandboxState::Creating
            }
            Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::PAUSED) => {
                SandboxState::Running
            }
            _ => SandboxState::Terminated,
        };
        let ipc_dir = inspected
            .config
            .and_then(|c| c.labels)
            .and_then(|mut labels| labels.remove(IPC_DIR_LABEL))
            .map(PathBuf::from)
            .unwrap_or_default();
        SandboxHandle {
            name: name.to_string(),
            id: inspected.id.unwrap_or_default(),
            ipc_dir,
            state,
        }
    }

    /// Best-effort removal of a container that never came up.
    async fn discard(&self, container: &str, ipc_dir: &Path) {
        let removed = self
            .docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = removed {
            warn!(container, error = %e, "failed to remove unstarted container");
        }
        if let Err(e) = tokio::fs::remove_dir_all(ipc_dir).await {
            debug!(error = %e, "IPC directory already gone");
        }
    }
}

/// The container a handle refers to. The id pins the exact container, so a
/// stale handle cannot remove a newer container registered under its name.
fn container_ref(handle: &SandboxHandle) -> &str {
    if handle.id.is_empty() {
        &handle.name
    } else {
        &handle.id
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn classify(name: &str, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 409, ..
        } => SandboxError::already_exists(name),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::container_failed(format!("{name}: {message} (HTTP {status_code})")),
        other => SandboxError::unreachable(name, other.to_string()),
    }
}

#[async_trait]
impl SandboxPlatform for DockerPlatform {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>, SandboxError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspected) => Ok(Some(Self::handle_from(name, inspected))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(classify(name, e)),
        }
    }

    async fn create(&self, name: &str) -> Result<SandboxHandle, SandboxError> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let ipc_dir = self
            .config
            .state_dir()
            .join("ipc")
            .join(format!("{name}-{}", &nonce[..8]));
        tokio::fs::create_dir_all(&ipc_dir).await?;
        for dir in [
            self.config.data_root(),
            self.config.state_dir().join("agent-state"),
            self.config.state_dir().join("claude"),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let container_config = self
            .build_container_config(&ipc_dir)
            .map_err(|e| SandboxError::container_failed(format!("{e:#}")))?;

        debug!("Creating container: {}", name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                container_config,
            )
            .await;
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&ipc_dir).await;
                return Err(classify(name, e));
            }
        };

        debug!("Starting container");
        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            // A container left in CREATED would read as still being created.
            self.discard(&created.id, &ipc_dir).await;
            return Err(classify(name, e));
        }

        info!(name, id = %created.id, "container started");
        Ok(SandboxHandle {
            name: name.to_string(),
            id: created.id,
            ipc_dir,
            state: SandboxState::Running,
        })
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let container = container_ref(handle);
        debug!("Removing container {}", container);
        match self
            .docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(classify(&handle.name, e)),
        }

        if !handle.ipc_dir.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::remove_dir_all(&handle.ipc_dir).await {
                debug!(error = %e, "IPC directory already gone");
            }
        }
        Ok(())
    }

    async fn exec(&self, handle: &SandboxHandle, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &handle.name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(&handle.name, e))?;

        let mut output = ExecOutput::default();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(&handle.name, e))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(&handle.name, e))?;
        output.exit_code = inspected.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &Path,
        contents: Bytes,
        mode: u32,
    ) -> Result<(), SandboxError> {
        let archive = single_file_tar(path, &contents, mode)?;
        self.docker
            .upload_to_container(
                &handle.name,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| classify(&handle.name, e))
    }

    async fn spawn_worker(&self, handle: &SandboxHandle, launch: &WorkerLaunch) -> Result<(), SandboxError> {
        let mut command = vec![launch.program.display().to_string()];
        command.extend(launch.args.iter().cloned());
        let script = format!(
            "exec {} >> {} 2>&1",
            shell_words::join(&command),
            shell_words::quote(&launch.log_file.display().to_string())
        );

        let exec = self
            .docker
            .create_exec(
                &handle.name,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(&handle.name, e))?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(&handle.name, e))?;
        info!(name = %handle.name, "worker started");
        Ok(())
    }

    fn paths(&self, _name: &str) -> SandboxPaths {
        let tools = PathBuf::from(CONTAINER_TOOLS);
        SandboxPaths {
            ipc: PathBuf::from(CONTAINER_IPC),
            workspace: PathBuf::from(CONTAINER_WORKSPACE),
            data: PathBuf::from(CONTAINER_DATA),
            worker_program: tools.join("agentbox"),
            tools,
            state: PathBuf::from(CONTAINER_STATE),
        }
    }

    fn needs_worker_binary(&self) -> bool {
        self.config.provision_binary
    }
}

/// Build a tar archive holding one regular file at `path` (relative to `/`).
fn single_file_tar(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let relative = path.strip_prefix("/").unwrap_or(path);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()),
    );

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, relative, contents)?;
    builder.into_inner()
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}
