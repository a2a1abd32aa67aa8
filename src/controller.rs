//! Sandbox lifecycle: one sandbox and one worker per chat session.
//!
//! The controller finds or creates the session's sandbox, bootstraps a new
//! one exactly once (data directory link, worker files, worker start) and
//! observes sandboxes the platform has recycled. Concurrent creators are
//! reconciled through the platform's name registry: the loser of a
//! creation race looks the winner's sandbox up instead.

use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{expand_path, Config};
use crate::interrupt::{InterruptSignal, RaiseOutcome};
use crate::ipc::{IpcPaths, WorkerIpc};
use crate::sandbox::{SandboxError, SandboxHandle, SandboxPlatform, SandboxState, WorkerLaunch};
use crate::session::Session;
use crate::timing::TimingTrace;
use crate::worker::WorkerConfig;

/// How long to wait for a sandbox another caller is still creating
const CREATING_WAIT: Duration = Duration::from_secs(30);
const CREATING_POLL: Duration = Duration::from_millis(200);

/// A live sandbox and whether this call created it.
#[derive(Debug)]
pub(crate) struct Provisioned {
    pub handle: SandboxHandle,
    pub is_new: bool,
    pub trace: TimingTrace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct InvalidateReport {
    pub invalidated: bool,
    pub sandbox_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct InterruptReport {
    pub interrupted: bool,
    pub sandbox_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SandboxStatus {
    pub state: SandboxState,
    pub sandbox_name: String,
}

/// Finds, creates and tears down session sandboxes.
pub(crate) struct SandboxController {
    platform: Arc<dyn SandboxPlatform>,
    config: Arc<Config>,
}

impl SandboxController {
    pub(crate) fn new(platform: Arc<dyn SandboxPlatform>, config: Arc<Config>) -> Self {
        Self { platform, config }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// The live sandbox called `name`, if any.
    ///
    /// Waits out a sandbox that is still being created. A terminated one is
    /// removed so the name can be registered again.
    async fn lookup_live(&self, name: &str) -> Result<Option<SandboxHandle>, SandboxError> {
        let started = Instant::now();
        loop {
            match self.platform.lookup(name).await? {
                Some(handle) if handle.state == SandboxState::Running => return Ok(Some(handle)),
                Some(handle) if handle.state == SandboxState::Terminated => {
                    info!(sandbox = name, "sandbox was recycled, removing");
                    self.platform.terminate(&handle).await?;
                    return Ok(None);
                }
                Some(handle) if handle.state == SandboxState::Creating => {
                    if started.elapsed() >= CREATING_WAIT {
                        return Err(SandboxError::unreachable(
                            name,
                            format!("still being created after {CREATING_WAIT:?}"),
                        ));
                    }
                    debug!(sandbox = name, "sandbox is being created, waiting");
                    sleep(CREATING_POLL).await;
                }
                _ => return Ok(None),
            }
        }
    }

    /// Find the session's sandbox, creating and bootstrapping it on a miss.
    pub(crate) async fn lookup_or_create(&self, session: &Session) -> Result<Provisioned, SandboxError> {
        let name = session.sandbox_name();
        let mut trace = TimingTrace::new();

        let started = Instant::now();
        let found = self.lookup_live(&name).await?;
        trace.record("sandbox_lookup", started);
        if let Some(handle) = found {
            debug!(sandbox = %name, "reusing sandbox");
            return Ok(Provisioned {
                handle,
                is_new: false,
                trace,
            });
        }

        let started = Instant::now();
        let handle = match self.platform.create(&name).await {
            Ok(handle) => handle,
            Err(e) if e.is_already_exists() => {
                debug!(sandbox = %name, "lost creation race, using existing sandbox");
                let handle = self.lookup_live(&name).await?.ok_or_else(|| {
                    SandboxError::unreachable(&name, "disappeared after concurrent creation")
                })?;
                return Ok(Provisioned {
                    handle,
                    is_new: false,
                    trace,
                });
            }
            Err(e) => return Err(e),
        };
        trace.record("sandbox_create", started);

        if let Err(e) = self.bootstrap(session, &handle, &mut trace).await {
            warn!(sandbox = %name, error = %e, "bootstrap failed, terminating sandbox");
            if let Err(cleanup) = self.platform.terminate(&handle).await {
                warn!(sandbox = %name, error = %cleanup, "failed to terminate sandbox");
            }
            return Err(e);
        }

        info!(sandbox = %name, timings = %trace.summary(), "sandbox provisioned");
        Ok(Provisioned {
            handle,
            is_new: true,
            trace,
        })
    }

    /// One-time setup of a freshly created sandbox.
    async fn bootstrap(
        &self,
        session: &Session,
        handle: &SandboxHandle,
        trace: &mut TimingTrace,
    ) -> Result<(), SandboxError> {
        let paths = self.platform.paths(&handle.name);

        let started = Instant::now();
        let session_dir = paths
            .workspace
            .join(&session.account_id)
            .join(&session.id);
        let quote = |p: &std::path::Path| shell_words::quote(&p.to_string_lossy()).into_owned();
        let script = format!(
            "mkdir -p {dir} && rm -rf {data} && ln -s {dir} {data} && mkdir -p {tools} {state}",
            dir = quote(&session_dir),
            data = quote(&paths.data),
            tools = quote(&paths.tools),
            state = quote(&paths.state),
        );
        let argv = vec!["sh".to_string(), "-c".to_string(), script];
        let output = self.platform.exec(handle, &argv).await?;
        if !output.success() {
            return Err(SandboxError::exec_failed(
                &handle.name,
                output.exit_code,
                output.stderr.trim(),
            ));
        }
        trace.record("mkdir_symlink", started);

        let started = Instant::now();
        let worker_config = WorkerConfig {
            ipc_dir: paths.ipc.clone(),
            data_dir: paths.data.clone(),
            state_dir: paths.state.clone(),
            timings: self.config.worker.clone(),
            agent: self.config.agent.clone(),
        };
        let body = worker_config
            .to_toml()
            .map_err(|e| SandboxError::container_failed(format!("{e:#}")))?;
        let config_path = paths.tools.join("worker.toml");
        self.platform
            .write_file(handle, &config_path, Bytes::from(body), 0o644)
            .await?;

        if self.platform.needs_worker_binary() && self.config.sandbox.provision_binary {
            let binary = self.worker_binary()?;
            let contents = tokio::fs::read(&binary).await?;
            debug!(binary = %binary.display(), bytes = contents.len(), "provisioning worker binary");
            self.platform
                .write_file(handle, &paths.worker_program, Bytes::from(contents), 0o755)
                .await?;
        }
        trace.record("write_worker_files", started);

        let started = Instant::now();
        let launch = WorkerLaunch {
            program: paths.worker_program.clone(),
            args: vec![
                "worker".to_string(),
                "--config".to_string(),
                config_path.to_string_lossy().into_owned(),
            ],
            log_file: paths.ipc.join("worker.stdout.log"),
        };
        self.platform.spawn_worker(handle, &launch).await?;
        trace.record("start_worker", started);

        Ok(())
    }

    fn worker_binary(&self) -> Result<PathBuf, SandboxError> {
        match &self.config.sandbox.worker_binary {
            Some(path) => Ok(expand_path(path)),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Terminate the session's sandbox so the next turn gets a fresh one.
    pub(crate) async fn invalidate(&self, session: &Session) -> Result<InvalidateReport, SandboxError> {
        let sandbox_name = session.sandbox_name();
        let (invalidated, message) = match self.platform.lookup(&sandbox_name).await? {
            None => (false, "No sandbox found"),
            Some(handle) if handle.state == SandboxState::Terminated => {
                self.platform.terminate(&handle).await?;
                (false, "Sandbox already terminated")
            }
            Some(handle) => {
                self.platform.terminate(&handle).await?;
                info!(sandbox = %sandbox_name, "sandbox invalidated");
                (true, "Sandbox terminated - will be recreated on next chat message")
            }
        };
        Ok(InvalidateReport {
            invalidated,
            sandbox_name,
            message: message.to_string(),
        })
    }

    /// The session's sandbox as the platform reports it. Never creates one.
    pub(crate) async fn find(&self, session: &Session) -> Result<Option<SandboxHandle>, SandboxError> {
        self.platform.lookup(&session.sandbox_name()).await
    }

    pub(crate) async fn status(&self, session: &Session) -> Result<SandboxStatus, SandboxError> {
        let state = self
            .find(session)
            .await?
            .map_or(SandboxState::Absent, |h| h.state);
        Ok(SandboxStatus {
            state,
            sandbox_name: session.sandbox_name(),
        })
    }

    /// Ask the session's worker to stop the turn in flight. Never creates a
    /// sandbox.
    pub(crate) async fn interrupt(&self, session: &Session) -> Result<InterruptReport, SandboxError> {
        let sandbox_name = session.sandbox_name();
        let (interrupted, message) = match self.platform.lookup(&sandbox_name).await? {
            None => (false, "No sandbox found"),
            Some(handle) if handle.state != SandboxState::Running => (false, "Sandbox not running"),
            Some(handle) => {
                let signal = InterruptSignal::new(IpcPaths::new(&handle.ipc_dir));
                match signal.raise().await? {
                    RaiseOutcome::Raised => {
                        info!(sandbox = %sandbox_name, "interrupt raised");
                        (true, "Interrupt signal sent to agent")
                    }
                    RaiseOutcome::NoTurnInFlight => (false, "No turn in flight"),
                }
            }
        };
        Ok(InterruptReport {
            interrupted,
            sandbox_name,
            message: message.to_string(),
        })
    }

    /// IPC client for the worker in `handle`.
    pub(crate) fn worker(&self, handle: &SandboxHandle) -> WorkerIpc {
        WorkerIpc::new(handle.ipc_dir.clone(), self.config.worker.request_poll_interval())
    }

    /// The session's data directory as the agent sees it.
    pub(crate) fn data_dir(&self, session: &Session) -> PathBuf {
        self.platform.paths(&session.sandbox_name()).data
    }
}
