//! File-based request/response protocol between the controller and a worker.
//!
//! Each sandbox owns one directory, visible to the host and mounted into the
//! sandbox. The controller publishes a single request document; the worker
//! answers by appending NDJSON events to an output log that ends with a
//! `request_done` sentinel. Readiness and interrupts are zero-content marker
//! files in the same directory.

mod client;
mod endpoint;
mod error;
mod event;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

pub(crate) use client::WorkerIpc;
pub(crate) use endpoint::{EventWriter, WorkerEndpoint};
pub(crate) use error::IpcError;
pub(crate) use event::{decode_line, WorkerEvent, USER_REQUESTED};

const REQUEST_FILE: &str = "request.json";
const OUTPUT_FILE: &str = "output.jsonl";
const READY_FILE: &str = "ready";
const INTERRUPT_FILE: &str = "interrupt";
const SUBMIT_LOCK_FILE: &str = "submit.lock";

/// Well-known file locations inside one IPC directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IpcPaths {
    dir: PathBuf,
}

impl IpcPaths {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn request(&self) -> PathBuf {
        self.dir.join(REQUEST_FILE)
    }

    pub(crate) fn output(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub(crate) fn ready(&self) -> PathBuf {
        self.dir.join(READY_FILE)
    }

    pub(crate) fn interrupt(&self) -> PathBuf {
        self.dir.join(INTERRUPT_FILE)
    }

    /// Held by a submitter between its busy check and publication.
    fn submit_lock(&self) -> PathBuf {
        self.dir.join(SUBMIT_LOCK_FILE)
    }

    /// Private staging file a request is written to before publication.
    fn request_staging(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!(".request-{request_id}.tmp"))
    }
}

/// A chat turn handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WorkerRequest {
    pub request_id: String,
    pub session_id: String,
    pub user_message: String,
}

impl WorkerRequest {
    /// Creates a request with a fresh v4 request id.
    pub(crate) fn new(session_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_message: user_message.into(),
        }
    }
}

/// Whether the worker still owns a request.
///
/// A turn is in flight while the request document exists, or while the
/// output log has content whose last line is not `request_done`. A worker
/// that died mid-turn therefore stays busy until its sandbox is replaced.
pub(crate) async fn turn_in_flight(paths: &IpcPaths) -> Result<bool, IpcError> {
    let request = paths.request();
    match fs::try_exists(&request).await {
        Ok(true) => return Ok(true),
        Ok(false) => {}
        Err(e) => return Err(IpcError::io(&request, e)),
    }

    let output = paths.output();
    let contents = match fs::read_to_string(&output).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(IpcError::io(&output, e)),
    };

    let last = contents.lines().rev().map(str::trim).find(|l| !l.is_empty());
    Ok(match last {
        None => false,
        Some(line) => decode_line(line) != WorkerEvent::RequestDone {},
    })
}
