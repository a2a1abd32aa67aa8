//! The long-lived process inside a sandbox.
//!
//! The worker marks itself ready, then polls its IPC directory for requests
//! and answers them one at a time. Each turn is framed by
//! `worker_processing` and `request_done`; an interrupt monitor runs beside
//! the agent for the duration of the turn.

mod config;
mod sessions;

pub(crate) use config::WorkerConfig;
pub(crate) use sessions::SessionStore;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentDriver, AgentTurn};
use crate::config::WorkerSettings;
use crate::interrupt::InterruptSignal;
use crate::ipc::{EventWriter, WorkerEndpoint, WorkerEvent, WorkerRequest};

/// Serves the IPC protocol for one sandbox.
pub(crate) struct Worker {
    endpoint: WorkerEndpoint,
    agent: Arc<dyn AgentDriver>,
    sessions: SessionStore,
    data_dir: PathBuf,
    poll_interval: Duration,
    interrupt_interval: Duration,
}

impl Worker {
    pub(crate) fn new(
        endpoint: WorkerEndpoint,
        agent: Arc<dyn AgentDriver>,
        sessions: SessionStore,
        data_dir: PathBuf,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            endpoint,
            agent,
            sessions,
            data_dir,
            poll_interval: settings.poll_interval(),
            interrupt_interval: settings.interrupt_poll_interval(),
        }
    }

    /// Build a worker from its provisioned configuration.
    pub(crate) fn from_config(config: &WorkerConfig) -> Result<Self> {
        Ok(Self::new(
            WorkerEndpoint::new(config.ipc_dir.clone()),
            crate::agent::build(&config.agent)?,
            SessionStore::new(&config.state_dir),
            config.data_dir.clone(),
            &config.timings,
        ))
    }

    /// Mark ready and answer requests until `shutdown` fires.
    pub(crate) async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        // A marker left by a previous worker process belongs to no turn.
        self.signal().clear_stale().await;
        self.endpoint.mark_ready().await?;
        info!(
            dir = %self.endpoint.paths().dir().display(),
            agent = self.agent.name(),
            "worker ready"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                () = sleep(self.poll_interval) => {}
            }

            match self.endpoint.take_request().await {
                Ok(Some(request)) => {
                    let request_id = request.request_id.clone();
                    tokio::select! {
                        () = shutdown.cancelled() => {
                            info!(request_id = %request_id, "worker shutting down mid-turn");
                            return Ok(());
                        }
                        () = self.handle(request) => {}
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to read request"),
            }
        }
    }

    async fn handle(&self, request: WorkerRequest) {
        info!(request_id = %request.request_id, session = %request.session_id, "processing request");
        let writer = match self.endpoint.begin_turn(&request).await {
            Ok(writer) => writer,
            Err(e) => {
                error!(error = %e, "failed to start turn");
                return;
            }
        };

        if let Err(e) = self.process(&request, &writer).await {
            error!(request_id = %request.request_id, "turn failed: {e:#}");
            if let Err(e) = writer.emit(&WorkerEvent::error(format!("{e:#}"))).await {
                error!(error = %e, "failed to record turn error");
            }
        }

        // Leftovers are dropped before `request_done`, never at pickup: a stop
        // raised between submit and pickup is meant for the turn picked up.
        self.signal().clear_stale().await;

        if let Err(e) = writer.emit(&WorkerEvent::RequestDone {}).await {
            error!(error = %e, "failed to record request completion");
        }
        debug!(request_id = %request.request_id, "request done");
    }

    fn signal(&self) -> InterruptSignal {
        InterruptSignal::new(self.endpoint.paths().clone())
    }

    async fn process(&self, request: &WorkerRequest, writer: &EventWriter) -> Result<()> {
        let signal = self.signal();
        let resume = self.sessions.load(&request.session_id).await?;
        let agent_cancel = CancellationToken::new();
        let turn_done = CancellationToken::new();
        let monitor = tokio::spawn(signal.monitor(
            writer.clone(),
            self.interrupt_interval,
            agent_cancel.clone(),
            turn_done.clone(),
        ));

        let turn = AgentTurn {
            app_session_id: &request.session_id,
            message: &request.user_message,
            resume: resume.as_deref(),
            cwd: &self.data_dir,
        };
        let outcome = self.agent.run_turn(turn, writer, agent_cancel).await;

        turn_done.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "interrupt monitor failed");
        }
        let summary = outcome?;

        if let Some(agent_session) = summary.agent_session_id.as_deref() {
            if resume.as_deref() != Some(agent_session) {
                self.sessions.save(&request.session_id, agent_session).await?;
            }
        }

        let interrupted = writer.is_interrupted().await;
        writer
            .emit(&WorkerEvent::Done {
                interrupted: interrupted.then_some(true),
            })
            .await?;
        Ok(())
    }
}
