//! CLI command implementations.
//!
//! Each submodule implements an agentbox CLI command with output formatting
//! kept in pure functions for testability.

pub mod interrupt;
pub mod invalidate;
pub mod serve;
pub mod status;
pub mod warm;
pub mod worker;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::controller::SandboxController;
use crate::sandbox;
use crate::session::Session;

/// The session a command acts on.
#[derive(Debug, Clone, clap::Args)]
pub struct Target {
    /// Session id
    pub session: String,

    /// Owning account (default: from the catalog, then `server.default_account`)
    #[arg(short, long)]
    pub account: Option<String>,
}

impl Target {
    /// Resolve the account that owns the session.
    pub(crate) async fn resolve(&self, config: &Config) -> Result<Session> {
        if let Some(account) = &self.account {
            return Ok(Session::new(account, &self.session));
        }
        let catalog = Catalog::new(config.server.catalog.clone());
        if let Some(session) = catalog.session(&self.session).await? {
            debug!(account = %session.account_id, "account resolved from catalog");
            return Ok(session);
        }
        Ok(Session::new(&config.server.default_account, &self.session))
    }
}

/// Connect to the configured backend and build a controller.
pub(crate) fn controller(config: Config) -> Result<Arc<SandboxController>> {
    let platform = sandbox::connect(&config)?;
    debug!(backend = platform.name(), "sandbox backend connected");
    Ok(Arc::new(SandboxController::new(platform, Arc::new(config))))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
pub(crate) fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown requested");
        token.cancel();
    });
}
