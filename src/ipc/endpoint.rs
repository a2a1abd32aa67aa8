//! Worker side of the IPC directory.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{IpcError, IpcPaths, WorkerEvent, WorkerRequest};

/// The worker's view of its IPC directory.
#[derive(Debug, Clone)]
pub(crate) struct WorkerEndpoint {
    paths: IpcPaths,
}

impl WorkerEndpoint {
    pub(crate) fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            paths: IpcPaths::new(dir),
        }
    }

    pub(crate) fn paths(&self) -> &IpcPaths {
        &self.paths
    }

    /// Create the directory and the readiness marker. The marker is never
    /// removed for the lifetime of the sandbox.
    pub(crate) async fn mark_ready(&self) -> Result<(), IpcError> {
        let dir = self.paths.dir();
        fs::create_dir_all(dir)
            .await
            .map_err(|e| IpcError::io(dir, e))?;
        let ready = self.paths.ready();
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&ready)
            .await
            .map_err(|e| IpcError::io(&ready, e))?;
        Ok(())
    }

    /// Read the pending request document, if any, without removing it.
    ///
    /// The document is removed by [`begin_turn`](Self::begin_turn) once the
    /// output log shows the request as taken.
    pub(crate) async fn take_request(&self) -> Result<Option<WorkerRequest>, IpcError> {
        let path = self.paths.request();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IpcError::io(&path, e)),
        };

        match serde_json::from_slice::<WorkerRequest>(&raw) {
            Ok(request) => Ok(Some(request)),
            Err(e) => {
                warn!(error = %e, "rejecting unreadable request document");
                self.reject(&raw, &e).await?;
                Ok(None)
            }
        }
    }

    /// Answer an unreadable request with an error turn so its submitter
    /// stops waiting. The id is recovered when the document has one.
    async fn reject(&self, raw: &[u8], error: &serde_json::Error) -> Result<(), IpcError> {
        let request_id = serde_json::from_slice::<serde_json::Value>(raw)
            .ok()
            .and_then(|doc| doc.get("request_id")?.as_str().map(String::from))
            .unwrap_or_default();

        let writer = self.reset_output().await?;
        writer
            .emit(&WorkerEvent::WorkerProcessing {
                request_id: request_id.clone(),
            })
            .await?;
        writer
            .emit(&WorkerEvent::error(format!("Invalid request: {error}")))
            .await?;
        writer.emit(&WorkerEvent::RequestDone {}).await?;
        remove_if_present(&self.paths.request()).await?;
        debug!(request_id = %request_id, "request rejected");
        Ok(())
    }

    /// Start answering `request`: truncate the output log, announce the
    /// request id, then clear the request slot.
    pub(crate) async fn begin_turn(&self, request: &WorkerRequest) -> Result<EventWriter, IpcError> {
        let writer = self.reset_output().await?;
        writer
            .emit(&WorkerEvent::WorkerProcessing {
                request_id: request.request_id.clone(),
            })
            .await?;
        remove_if_present(&self.paths.request()).await?;
        debug!(request_id = %request.request_id, "request taken");
        Ok(writer)
    }

    /// Truncate the output log and return a writer appending to it.
    pub(crate) async fn reset_output(&self) -> Result<EventWriter, IpcError> {
        let path = self.paths.output();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| IpcError::io(&path, e))?;
        Ok(EventWriter::new(file, path))
    }
}

async fn remove_if_present(path: &Path) -> Result<(), IpcError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IpcError::io(path, e)),
    }
}

struct WriterState {
    file: File,
    interrupted: bool,
}

/// Appends events to the output log, one flushed JSON line per event.
///
/// Clones share the same file handle, so the agent driver and the interrupt
/// monitor can write concurrently without interleaving partial lines.
#[derive(Clone)]
pub(crate) struct EventWriter {
    state: Arc<Mutex<WriterState>>,
    path: Arc<std::path::PathBuf>,
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EventWriter {
    fn new(file: File, path: std::path::PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                file,
                interrupted: false,
            })),
            path: Arc::new(path),
        }
    }

    /// Append one event. After an interrupt, agent output is dropped.
    pub(crate) async fn emit(&self, event: &WorkerEvent) -> Result<(), IpcError> {
        let mut state = self.state.lock().await;
        if state.interrupted && event.is_agent_output() {
            return Ok(());
        }
        write_line(&mut state.file, &self.path, event).await
    }

    /// Record an interrupt and stop accepting agent output for this turn.
    pub(crate) async fn interrupt(&self, reason: &str) -> Result<(), IpcError> {
        let mut state = self.state.lock().await;
        state.interrupted = true;
        let event = WorkerEvent::Interrupted {
            reason: reason.to_string(),
        };
        write_line(&mut state.file, &self.path, &event).await
    }

    pub(crate) async fn is_interrupted(&self) -> bool {
        self.state.lock().await.interrupted
    }
}

async fn write_line(file: &mut File, path: &Path, event: &WorkerEvent) -> Result<(), IpcError> {
    let mut line = event.to_line()?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| IpcError::io(path, e))?;
    file.flush().await.map_err(|e| IpcError::io(path, e))
}
