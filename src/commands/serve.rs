use anyhow::Result;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::server::{self, AppState};

/// Runs the chat relay and control endpoints until interrupted.
pub(crate) async fn run(config: Config, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let catalog = Catalog::new(config.server.catalog.clone());
    let backend = format!("{:?}", config.sandbox.backend).to_lowercase();

    let controller = super::controller(config)?;
    print!("{}", format_banner(&bind, &backend, &catalog));

    let shutdown = CancellationToken::new();
    super::cancel_on_signal(shutdown.clone());
    server::serve(AppState::new(controller, catalog), &bind, shutdown).await
}

fn format_banner(bind: &str, backend: &str, catalog: &Catalog) -> String {
    format!(
        "\n{}\n  Listening:  {}\n  Backend:    {}\n  Catalog:    {}\n  Chat:       {}\n\n",
        "agentbox relay".yellow().bold(),
        bind.cyan(),
        backend.cyan(),
        catalog.path().display().to_string().cyan(),
        format!("ws://{bind}/api/sessions/<session_id>/chat").dimmed(),
    )
}
