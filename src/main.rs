//! mergebot - batching, staging and CI-gated merge bot for GitHub

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stage approved pull requests, merge them once CI agrees
#[derive(Parser, Debug)]
#[command(name = "mergebot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the project configuration
    #[arg(short, long, default_value = "mergebot.toml")]
    config: PathBuf,

    /// Debug logging (overridden by `RUST_LOG`)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one scheduler tick
    Tick,

    /// Run ticks forever
    Run {
        /// Seconds between ticks
        #[arg(short, long, default_value = "30")]
        interval: u64,

        /// Ticks between maintenance runs (0 disables)
        #[arg(long, default_value = "120")]
        gc_every: u64,
    },

    /// Show PRs, stagings and splits per branch
    Status {
        /// Only this branch
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Process a webhook payload
    Event {
        /// Event type, as in the `X-GitHub-Event` header
        kind: String,

        /// JSON payload file, `-` for stdin
        payload: PathBuf,
    },

    /// Garbage-collect the local mirrors
    Gc,

    /// Delete scratch branches of inactive branches
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "mergebot=debug" } else { "mergebot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Tick => cli::run::run_tick(&cli.config).await?,
        Commands::Run { interval, gc_every } => {
            cli::run::run_loop(&cli.config, interval, gc_every).await?;
        }
        Commands::Status { branch } => cli::status::run_status(&cli.config, branch.as_deref())?,
        Commands::Event { kind, payload } => {
            cli::event::run_event(&cli.config, &kind, &payload).await?;
        }
        Commands::Gc => cli::run::run_gc(&cli.config).await?,
        Commands::Cleanup => cli::run::run_cleanup(&cli.config).await?,
    }
    Ok(())
}
