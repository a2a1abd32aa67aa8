use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod catalog;
mod commands;
mod config;
mod controller;
mod interrupt;
mod ipc;
mod relay;
mod sandbox;
mod server;
mod session;
mod timing;
mod warmup;
mod worker;

use commands::Target;
use config::{Config, CONFIG_FILE};
use worker::WorkerConfig;

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(
    author,
    version,
    about = "Per-session sandboxed chat agents with streaming, warm reuse and interrupts"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (for `worker`, the provisioned worker.toml)
    #[arg(short, long, global = true, env = "AGENTBOX_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat relay and control endpoints
    Serve {
        /// Address to bind (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run the in-sandbox worker (started by the controller)
    Worker,

    /// Create or find a session's sandbox and wait for its worker
    Warm {
        #[command(flatten)]
        target: Target,

        /// Seconds to wait for the worker (default: worker.ready_timeout_secs)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Terminate a session's sandbox so the next message gets a fresh one
    Invalidate {
        #[command(flatten)]
        target: Target,

        /// Start a replacement sandbox right away
        #[arg(long)]
        rewarm: bool,
    },

    /// Show a session's sandbox state
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// Stop the turn a session's worker is running
    Interrupt {
        #[command(flatten)]
        target: Target,
    },
}

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("agentbox=debug")
    } else {
        EnvFilter::new("agentbox=info")
    }
}

/// Log to stderr, as text or JSON lines.
fn init_logging(verbose: bool, json: bool) {
    let (text, json) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(filter(verbose))
        .init();
}

/// Log to `worker.log` in the IPC directory, where the controller side can
/// read it.
fn init_worker_logging(config: &WorkerConfig, verbose: bool, json: bool) -> WorkerGuard {
    let appender = tracing_appender::rolling::never(&config.ipc_dir, "worker.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let (text, json) = if json {
        (None, Some(fmt::layer().json().with_writer(writer)))
    } else {
        (Some(fmt::layer().with_ansi(false).with_writer(writer)), None)
    };

    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(filter(verbose))
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Worker = cli.command {
        let config = WorkerConfig::load(&cli.config)?;
        std::fs::create_dir_all(&config.ipc_dir)?;
        let _guard = init_worker_logging(&config, cli.verbose, cli.log_json);
        return commands::worker::run(config).await;
    }

    init_logging(cli.verbose, cli.log_json);
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind } => commands::serve::run(config, bind).await,
        Commands::Warm { target, timeout } => commands::warm::run(config, &target, timeout).await,
        Commands::Invalidate { target, rewarm } => {
            commands::invalidate::run(config, &target, rewarm).await
        }
        Commands::Status { target } => commands::status::run(config, &target).await,
        Commands::Interrupt { target } => commands::interrupt::run(config, &target).await,
        Commands::Worker => Ok(()),
    }
}
