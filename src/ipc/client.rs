//! Controller side of the IPC directory.

use std::collections::VecDeque;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use futures_util::stream::{self, Stream};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use super::{decode_line, turn_in_flight, IpcError, IpcPaths, WorkerEvent, WorkerRequest};

/// Upper bound on the output poll interval.
pub(crate) const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Age after which a submit lock is taken to be left by a crashed submitter.
const STALE_SUBMIT_LOCK: Duration = Duration::from_secs(10);

/// Handle for submitting requests to one worker and reading its answers.
#[derive(Debug, Clone)]
pub(crate) struct WorkerIpc {
    paths: IpcPaths,
    poll_interval: Duration,
}

impl WorkerIpc {
    pub(crate) fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            paths: IpcPaths::new(dir),
            poll_interval: poll_interval.min(MAX_POLL_INTERVAL),
        }
    }

    pub(crate) fn paths(&self) -> &IpcPaths {
        &self.paths
    }

    /// Single check of the readiness marker.
    pub(crate) async fn is_ready(&self) -> bool {
        fs::try_exists(self.paths.ready()).await.unwrap_or(false)
    }

    /// Single check for a request that has not reached `request_done`.
    pub(crate) async fn is_busy(&self) -> Result<bool, IpcError> {
        turn_in_flight(&self.paths).await
    }

    /// Wait for the readiness marker, giving up after `timeout`.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), IpcError> {
        let started = Instant::now();
        loop {
            if self.is_ready().await {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                debug!(dir = %self.paths.dir().display(), ?waited, "worker never signalled ready");
                return Err(IpcError::worker_unavailable(waited));
            }
            sleep(READY_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Publish a request.
    ///
    /// Submitters serialize on a lock file around the busy check, and the
    /// document is staged under a private name and hard-linked into the
    /// request slot, which fails if the slot is taken. Two concurrent
    /// submitters can therefore never both succeed.
    pub(crate) async fn submit(&self, request: &WorkerRequest) -> Result<(), IpcError> {
        let lock = SubmitLock::acquire(&self.paths).await?;
        let published = self.publish(request).await;
        lock.release().await;
        published
    }

    async fn publish(&self, request: &WorkerRequest) -> Result<(), IpcError> {
        if self.is_busy().await? {
            return Err(IpcError::RequestConflict);
        }

        let staging = self.paths.request_staging(&request.request_id);
        let body = serde_json::to_vec(request)?;
        fs::write(&staging, body)
            .await
            .map_err(|e| IpcError::io(&staging, e))?;

        let slot = self.paths.request();
        let published = fs::hard_link(&staging, &slot).await;
        if let Err(e) = fs::remove_file(&staging).await {
            debug!(error = %e, "failed to remove staged request");
        }

        match published {
            Ok(()) => {
                debug!(request_id = %request.request_id, "request published");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(IpcError::RequestConflict),
            Err(e) => Err(IpcError::io(&slot, e)),
        }
    }

    /// Stream the events answering `request_id`.
    ///
    /// The stream waits for the worker to take the request, skips anything
    /// before the matching `worker_processing` line, hides protocol
    /// delimiters and ends at `request_done`. If `timeout` passes without new
    /// output it yields one `RequestTimeout` error and ends.
    pub(crate) fn poll_stream(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> impl Stream<Item = Result<WorkerEvent, IpcError>> + Send + 'static {
        let state = PollState {
            paths: self.paths.clone(),
            request_id: request_id.to_string(),
            poll_interval: self.poll_interval,
            timeout,
            picked_up: false,
            matched: false,
            finished: false,
            failure: None,
            cursor: ReadCursor::default(),
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.finished {
                    return state.failure.take().map(|e| (Err(e), state));
                }
                match state.poll_once().await {
                    Ok(true) => {}
                    Ok(false) => {
                        if state.last_activity.elapsed() >= state.timeout {
                            state.finished = true;
                            return Some((Err(IpcError::request_timeout(state.timeout)), state));
                        }
                        sleep(state.poll_interval).await;
                    }
                    // Events read before the failure still go out first.
                    Err(e) => {
                        state.finished = true;
                        state.failure = Some(e);
                    }
                }
            }
        })
    }
}

/// Exclusive right to publish into one IPC directory.
struct SubmitLock {
    path: PathBuf,
}

impl SubmitLock {
    /// Take the lock, or fail with `RequestConflict` while another submitter
    /// holds it. A lock older than `STALE_SUBMIT_LOCK` is broken once.
    async fn acquire(paths: &IpcPaths) -> Result<Self, IpcError> {
        let path = paths.submit_lock();
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt > 0 || !Self::is_stale(&path).await {
                        return Err(IpcError::RequestConflict);
                    }
                    warn!(path = %path.display(), "breaking stale submit lock");
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(IpcError::io(&path, e)),
                    }
                }
                Err(e) => return Err(IpcError::io(&path, e)),
            }
        }
        Err(IpcError::RequestConflict)
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(modified) = fs::metadata(path).await.and_then(|m| m.modified()) else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age >= STALE_SUBMIT_LOCK)
    }

    async fn release(self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!(error = %e, path = %self.path.display(), "failed to release submit lock");
        }
    }
}

struct PollState {
    paths: IpcPaths,
    request_id: String,
    poll_interval: Duration,
    timeout: Duration,
    picked_up: bool,
    matched: bool,
    finished: bool,
    failure: Option<IpcError>,
    cursor: ReadCursor,
    pending: VecDeque<WorkerEvent>,
    last_activity: Instant,
}

impl PollState {
    /// One poll. Returns true if anything changed.
    async fn poll_once(&mut self) -> Result<bool, IpcError> {
        if !self.picked_up {
            let request = self.paths.request();
            let pending = fs::try_exists(&request)
                .await
                .map_err(|e| IpcError::io(&request, e))?;
            if pending {
                return Ok(false);
            }
            self.picked_up = true;
            self.last_activity = Instant::now();
        }

        let NewLines { lines, rewound } = self.cursor.read_new_lines(&self.paths.output()).await?;
        if rewound && self.matched {
            return Err(self.replaced());
        }
        if lines.is_empty() {
            return Ok(false);
        }
        self.last_activity = Instant::now();

        for line in lines {
            let event = decode_line(&line);
            if !self.matched {
                if let WorkerEvent::WorkerProcessing { request_id } = &event {
                    self.matched = *request_id == self.request_id;
                }
                if !self.matched {
                    trace!(line = %line, "skipping output of another request");
                }
                continue;
            }
            match event {
                WorkerEvent::RequestDone {} => {
                    self.finished = true;
                    break;
                }
                WorkerEvent::WorkerProcessing { request_id } if request_id != self.request_id => {
                    return Err(self.replaced());
                }
                WorkerEvent::WorkerProcessing { .. } => {}
                event => self.pending.push_back(event),
            }
        }
        Ok(true)
    }

    fn replaced(&self) -> IpcError {
        debug!(request_id = %self.request_id, "output log taken over by another request");
        IpcError::OutputReplaced {
            request_id: self.request_id.clone(),
        }
    }
}

/// Lines read by one `ReadCursor` call.
struct NewLines {
    lines: Vec<String>,
    /// The log was truncated since the previous call and read from the start.
    rewound: bool,
}

/// Read position in the output log.
#[derive(Debug, Default)]
struct ReadCursor {
    offset: u64,
    lines: usize,
    /// First line of the log, used to notice a truncate-and-refill that
    /// leaves the log longer than the cursor.
    head: Vec<u8>,
}

impl ReadCursor {
    /// Return complete lines appended since the last call. A trailing
    /// partial line is left for the next call. A log shorter than the cursor,
    /// or one whose first line changed, has been restarted and is read from
    /// the start.
    async fn read_new_lines(&mut self, path: &Path) -> Result<NewLines, IpcError> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(NewLines {
                    lines: Vec::new(),
                    rewound: false,
                })
            }
            Err(e) => return Err(IpcError::io(path, e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| IpcError::io(path, e))?
            .len();
        let rewound = len < self.offset || !self.head_unchanged(&mut file, path).await?;
        if rewound {
            debug!(
                offset = self.offset,
                lines = self.lines,
                len,
                "output log restarted, rewinding"
            );
            self.offset = 0;
            self.lines = 0;
            self.head.clear();
        }
        let mut batch = NewLines {
            lines: Vec::new(),
            rewound,
        };
        if len == self.offset {
            return Ok(batch);
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| IpcError::io(path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| IpcError::io(path, e))?;

        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(batch);
        };
        let complete = &buf[..=end];
        if self.offset == 0 {
            if let Some(first) = complete.iter().position(|b| *b == b'\n') {
                self.head = complete[..=first].to_vec();
            }
        }
        self.offset += complete.len() as u64;

        batch.lines = String::from_utf8_lossy(complete)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        self.lines += batch.lines.len();
        Ok(batch)
    }

    async fn head_unchanged(&self, file: &mut File, path: &Path) -> Result<bool, IpcError> {
        if self.head.is_empty() {
            return Ok(true);
        }
        let mut current = vec![0; self.head.len()];
        match file.read_exact(&mut current).await {
            Ok(_) => Ok(current == self.head),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(IpcError::io(path, e)),
        }
    }
}
