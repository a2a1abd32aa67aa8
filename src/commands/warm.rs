//! Warm a session's sandbox ahead of the first chat turn.

use anyhow::{bail, Result};
use colored::Colorize;
use std::time::Duration;

use super::Target;
use crate::config::Config;
use crate::warmup::{WarmOutcome, WarmReport, WarmupCoordinator};

pub(crate) async fn run(config: Config, target: &Target, timeout_secs: Option<u64>) -> Result<()> {
    let session = target.resolve(&config).await?;
    let timeout = timeout_secs.map_or_else(|| config.worker.ready_timeout(), Duration::from_secs);

    let warmup = WarmupCoordinator::new(super::controller(config)?);
    let report = warmup.warm(&session, timeout).await;
    print!("{}", format_report(&report));

    if let Some(error) = report.error() {
        bail!("Warmup failed: {error}");
    }
    Ok(())
}

fn format_report(report: &WarmReport) -> String {
    let name = report.sandbox_name.cyan();
    match (&report.outcome, report.is_new) {
        (WarmOutcome::Ready, true) => format!("{} Sandbox {name} created and ready.\n", "✓".green()),
        (WarmOutcome::Ready, false) => format!("{} Sandbox {name} already warm.\n", "✓".green()),
        (WarmOutcome::CreatedNotReady, _) => format!(
            "{} Sandbox {name} exists but its worker is not ready yet.\n",
            "⚠".yellow()
        ),
        (WarmOutcome::Failed(message), _) => {
            format!("{} Could not warm {name}: {message}\n", "✗".red())
        }
    }
}
