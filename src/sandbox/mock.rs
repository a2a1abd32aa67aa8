//! In-process platform for tests.
//!
//! Filesystem work is delegated to [`LocalPlatform`] inside a temporary
//! directory, but the worker runs as a tokio task in this process, so a
//! whole turn can be driven end to end without Docker or a child process.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{
    ExecOutput, LocalPlatform, SandboxError, SandboxHandle, SandboxPaths, SandboxPlatform,
    SandboxState, WorkerLaunch,
};
use crate::worker::{Worker, WorkerConfig};

pub(crate) struct MockPlatform {
    inner: LocalPlatform,
    workers: Mutex<HashMap<String, CancellationToken>>,
    expired: Mutex<HashSet<String>>,
    creates: AtomicUsize,
    spawns: AtomicUsize,
    fail_create: AtomicBool,
    worker_delay: Duration,
    root: TempDir,
}

impl MockPlatform {
    pub(crate) fn new() -> Self {
        Self::with_worker_delay(Duration::ZERO)
    }

    /// Workers wait `delay` before marking themselves ready.
    pub(crate) fn with_worker_delay(delay: Duration) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        Self {
            inner: LocalPlatform::new(root.path().join("state"), root.path().join("workspace")),
            workers: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
            creates: AtomicUsize::new(0),
            spawns: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            worker_delay: delay,
            root,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.path()
    }

    /// Number of successful creations.
    pub(crate) fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of workers started.
    pub(crate) fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Simulate the platform recycling an idle sandbox.
    pub(crate) fn expire(&self, name: &str) {
        if let Some(token) = self.workers.lock().unwrap().remove(name) {
            token.cancel();
        }
        self.expired.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl SandboxPlatform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn lookup(&self, name: &str) -> Result<Option<SandboxHandle>, SandboxError> {
        let mut found = self.inner.lookup(name).await?;
        if let Some(handle) = found.as_mut() {
            if self.expired.lock().unwrap().contains(name) {
                handle.state = SandboxState::Terminated;
            }
        }
        Ok(found)
    }

    async fn create(&self, name: &str) -> Result<SandboxHandle, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::container_failed("quota exceeded"));
        }
        let handle = self.inner.create(name).await?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let current = self.inner.lookup(&handle.name).await?;
        if current.is_some_and(|c| !handle.id.is_empty() && c.id != handle.id) {
            return Ok(());
        }
        if let Some(token) = self.workers.lock().unwrap().remove(&handle.name) {
            token.cancel();
        }
        self.expired.lock().unwrap().remove(&handle.name);
        self.inner.terminate(handle).await
    }

    async fn exec(&self, handle: &SandboxHandle, argv: &[String]) -> Result<ExecOutput, SandboxError> {
        self.inner.exec(handle, argv).await
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &Path,
        contents: Bytes,
        mode: u32,
    ) -> Result<(), SandboxError> {
        self.inner.write_file(handle, path, contents, mode).await
    }

    async fn spawn_worker(&self, handle: &SandboxHandle, launch: &WorkerLaunch) -> Result<(), SandboxError> {
        let config_path = launch
            .args
            .iter()
            .skip_while(|arg| *arg != "--config")
            .nth(1)
            .ok_or_else(|| SandboxError::container_failed("worker launched without --config"))?;
        let config = WorkerConfig::load(Path::new(config_path))
            .map_err(|e| SandboxError::container_failed(format!("{e:#}")))?;
        let worker = Worker::from_config(&config)
            .map_err(|e| SandboxError::container_failed(format!("{e:#}")))?;

        let token = CancellationToken::new();
        self.workers
            .lock()
            .unwrap()
            .insert(handle.name.clone(), token.clone());
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let delay = self.worker_delay;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let _ = worker.serve(token).await;
        });
        Ok(())
    }

    fn paths(&self, name: &str) -> SandboxPaths {
        self.inner.paths(name)
    }

    fn needs_worker_binary(&self) -> bool {
        false
    }
}
