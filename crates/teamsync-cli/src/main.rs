mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "teamsync",
    about = "Keep a team's roster, events and results in sync within the racing service's rate limits",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .teamsync/)
    #[arg(long, global = true, env = "TEAMSYNC_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .teamsync/config.yaml
    Init {
        /// Use the recommended staggered schedule instead of the default one
        #[arg(long)]
        recommended: bool,
    },

    /// Check the config and schedule against the rate budgets
    Validate {
        /// Generate collision-free trigger offsets and save them
        #[arg(long)]
        fix: bool,
    },

    /// Run one batch in-process and print the result
    Sync {
        #[arg(long)]
        skip_riders: bool,
        #[arg(long)]
        skip_events: bool,
        #[arg(long)]
        skip_results: bool,
        /// Let the coordinator decide which phases are due
        #[arg(long, conflicts_with_all = ["skip_riders", "skip_events", "skip_results"])]
        smart: bool,
    },

    /// Serve the HTTP API and run the scheduler
    Serve {
        #[arg(long, short = 'p', default_value_t = 3000, env = "PORT")]
        port: u16,
        /// Do not start the scheduler on boot
        #[arg(long)]
        no_scheduler: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Sync { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { recommended } => cmd::init::run(&root, recommended),
        Commands::Validate { fix } => cmd::validate::run(&root, fix, cli.json),
        Commands::Sync {
            skip_riders,
            skip_events,
            skip_results,
            smart,
        } => {
            let mode = if smart {
                cmd::sync::SyncMode::Smart
            } else {
                cmd::sync::SyncMode::Batch(teamsync_core::BatchOptions {
                    skip_riders,
                    skip_events,
                    skip_results,
                    force: true,
                })
            };
            cmd::sync::run(&root, mode, cli.json)
        }
        Commands::Serve { port, no_scheduler } => cmd::serve::run(&root, port, !no_scheduler),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
