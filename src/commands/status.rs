use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::Target;
use crate::config::Config;
use crate::controller::SandboxStatus;
use crate::sandbox::SandboxState;

/// Worker-level detail for a running sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerStatus {
    ready: bool,
    busy: bool,
}

pub(crate) async fn run(config: Config, target: &Target) -> Result<()> {
    let session = target.resolve(&config).await?;
    let controller = super::controller(config)?;
    let status = controller.status(&session).await?;

    let mut worker = None;
    if let Some(handle) = controller.find(&session).await? {
        if handle.state == SandboxState::Running {
            let ipc = controller.worker(&handle);
            worker = Some(WorkerStatus {
                ready: ipc.is_ready().await,
                busy: ipc.is_busy().await?,
            });
        }
    }

    print!("{}", format_status(&status, worker));
    Ok(())
}

fn format_status(status: &SandboxStatus, worker: Option<WorkerStatus>) -> String {
    let state = match status.state {
        SandboxState::Running => "running".green().bold(),
        SandboxState::Creating => "creating".yellow(),
        SandboxState::Terminated => "terminated".red(),
        SandboxState::Absent => "absent".dimmed(),
    };

    let mut out = String::new();
    let _ = writeln!(out, "\n{}", "━".repeat(50).dimmed());
    let _ = writeln!(out, "  Sandbox:    {}", status.sandbox_name.cyan());
    let _ = writeln!(out, "  State:      {state}");
    match worker {
        Some(worker) => {
            let ready = if worker.ready {
                "ready".green()
            } else {
                "starting".yellow()
            };
            let busy = if worker.busy {
                "turn in flight".yellow()
            } else {
                "idle".cyan()
            };
            let _ = writeln!(out, "  Worker:     {ready}, {busy}");
        }
        None if status.state == SandboxState::Absent => {
            let _ = writeln!(
                out,
                "  {} No sandbox found. The next chat message creates one.",
                "ℹ".blue()
            );
        }
        None => {}
    }
    let _ = writeln!(out, "{}", "━".repeat(50).dimmed());
    out
}
