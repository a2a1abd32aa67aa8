use anyhow::Result;
use colored::Colorize;

use super::Target;
use crate::config::Config;
use crate::controller::InterruptReport;

/// Asks the session's worker to stop its current turn.
pub(crate) async fn run(config: Config, target: &Target) -> Result<()> {
    let session = target.resolve(&config).await?;
    let report = super::controller(config)?.interrupt(&session).await?;
    print!("{}", format_result(&report));
    Ok(())
}

fn format_result(report: &InterruptReport) -> String {
    let mark = if report.interrupted {
        "✓".green()
    } else {
        "ℹ".blue()
    };
    format!(
        "{mark} {} ({})\n",
        report.message,
        report.sandbox_name.cyan()
    )
}
