//! Terminate a session's sandbox so the next turn starts fresh.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::Target;
use crate::config::Config;
use crate::controller::InvalidateReport;
use crate::warmup::{WarmOutcome, WarmupCoordinator};

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the invalidate command, optionally waiting for a replacement.
pub(crate) async fn run(config: Config, target: &Target, rewarm: bool) -> Result<()> {
    let session = target.resolve(&config).await?;
    let controller = super::controller(config)?;

    if !rewarm {
        let report = controller.invalidate(&session).await?;
        print!("{}", format_result(&report));
        return Ok(());
    }

    let (report, warming) = WarmupCoordinator::new(controller)
        .invalidate_and_warm(&session)
        .await?;
    print!("{}", format_result(&report));
    if let Some(warming) = warming {
        let warmed = warming.await?;
        print!("{}", format_rewarm(&warmed.outcome));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn format_result(report: &InvalidateReport) -> String {
    let mut out = String::new();
    let mark = if report.invalidated {
        "✓".green()
    } else {
        "ℹ".blue()
    };
    let _ = writeln!(out, "{mark} {}", report.message);
    let _ = writeln!(out, "  Sandbox:    {}", report.sandbox_name.cyan());
    out
}

fn format_rewarm(outcome: &WarmOutcome) -> String {
    match outcome {
        WarmOutcome::Ready => format!("{} Replacement sandbox is ready.\n", "✓".green()),
        WarmOutcome::CreatedNotReady => format!(
            "{} Replacement sandbox created; worker still starting.\n",
            "⚠".yellow()
        ),
        WarmOutcome::Failed(message) => {
            format!("{} Could not start a replacement: {message}\n", "✗".red())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_invalidated() {
        let output = format_result(&InvalidateReport {
            invalidated: true,
            sandbox_name: "agent-acct-s1".to_string(),
            message: "Sandbox terminated - will be recreated on next chat message".to_string(),
        });
        assert!(output.contains("will be recreated"));
        assert!(output.contains("agent-acct-s1"));
    }

    #[test]
    fn test_format_nothing_to_invalidate() {
        let output = format_result(&InvalidateReport {
            invalidated: false,
            sandbox_name: "agent-acct-s1".to_string(),
            message: "No sandbox found".to_string(),
        });
        assert!(output.contains("No sandbox found"));
    }

    #[test]
    fn test_format_rewarm() {
        assert!(format_rewarm(&WarmOutcome::Ready).contains("ready"));
        assert!(format_rewarm(&WarmOutcome::Failed("boom".to_string())).contains("boom"));
    }
}
