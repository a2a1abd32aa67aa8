use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::worker::{Worker, WorkerConfig};

/// Runs the in-sandbox worker until it receives a shutdown signal.
pub(crate) async fn run(config: WorkerConfig) -> Result<()> {
    let worker = Worker::from_config(&config)?;
    info!(
        ipc = %config.ipc_dir.display(),
        data = %config.data_dir.display(),
        provider = %config.agent.provider,
        "starting worker"
    );

    let shutdown = CancellationToken::new();
    super::cancel_on_signal(shutdown.clone());
    worker.serve(shutdown).await
}
