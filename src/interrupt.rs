//! Cooperative cancellation of a running turn.
//!
//! The controller raises an interrupt by creating a marker file in the
//! worker's IPC directory. Inside the worker a monitor task polls for the
//! marker, removes it, records an `interrupted` event and cancels the agent.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::fs;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::{turn_in_flight, EventWriter, IpcError, IpcPaths, USER_REQUESTED};

/// Upper bound on the monitor poll interval.
pub(crate) const MAX_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Result of raising an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaiseOutcome {
    Raised,
    NoTurnInFlight,
}

/// The interrupt flag of one worker.
#[derive(Debug, Clone)]
pub(crate) struct InterruptSignal {
    paths: IpcPaths,
}

impl InterruptSignal {
    pub(crate) fn new(paths: IpcPaths) -> Self {
        Self { paths }
    }

    /// Mark a pending interrupt for the turn in flight.
    ///
    /// Raising twice leaves a single marker. With no turn in flight nothing
    /// is written, so a late stop cannot leak into the next turn.
    pub(crate) async fn raise(&self) -> Result<RaiseOutcome, IpcError> {
        if !turn_in_flight(&self.paths).await? {
            debug!(dir = %self.paths.dir().display(), "no turn in flight, interrupt ignored");
            return Ok(RaiseOutcome::NoTurnInFlight);
        }
        let marker = self.paths.interrupt();
        fs::write(&marker, b"")
            .await
            .map_err(|e| IpcError::io(&marker, e))?;
        Ok(RaiseOutcome::Raised)
    }

    /// Check for a pending interrupt and consume it.
    pub(crate) async fn observe_and_clear(&self) -> bool {
        let marker = self.paths.interrupt();
        match fs::remove_file(&marker).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(error = %e, path = %marker.display(), "failed to clear interrupt marker");
                false
            }
        }
    }

    /// Discard an interrupt left over from an earlier turn.
    pub(crate) async fn clear_stale(&self) {
        if self.observe_and_clear().await {
            debug!("cleared stale interrupt");
        }
    }

    /// Poll for an interrupt until `done` is cancelled.
    ///
    /// On observation the interrupt is recorded through `writer` and `agent`
    /// is cancelled. Returns whether an interrupt was observed.
    pub(crate) async fn monitor(
        self,
        writer: EventWriter,
        interval: Duration,
        agent: CancellationToken,
        done: CancellationToken,
    ) -> bool {
        let interval = interval.min(MAX_MONITOR_INTERVAL);
        loop {
            if self.observe_and_clear().await {
                info!("interrupt received, stopping agent");
                if let Err(e) = writer.interrupt(USER_REQUESTED).await {
                    warn!(error = %e, "failed to record interrupt");
                }
                agent.cancel();
                return true;
            }
            tokio::select! {
                () = done.cancelled() => return false,
                () = sleep(interval) => {}
            }
        }
    }
}
