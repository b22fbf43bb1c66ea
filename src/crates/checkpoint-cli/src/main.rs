//! checkpointctl - versioned checkpoints for agent runs
//!
//! Main entry point for the checkpoint command-line tool.

use anyhow::{Context, Result};
use checkpoint_cli::commands::{self, CliContext, OutputFormat};
use clap::{Parser, Subcommand};
use run_checkpoint::{ConfigLoader, RunId, Version};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "checkpointctl")]
#[command(about = "Create, compare and restore checkpoints of agent runs", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Data directory, overriding storage.data_dir
    #[arg(long, global = true, env = "CHECKPOINT_DATA_DIR")]
    data_dir: Option<String>,

    /// Read settings from this file instead of ~/.checkpoint and ./.checkpoint
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed or inspect the live state of a run
    #[command(subcommand)]
    Run(RunCommands),

    /// Take a manual checkpoint of a run
    Create {
        /// Run ID
        run_id: String,
        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List the checkpoints of a run, newest first
    List {
        /// Run ID
        run_id: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a checkpoint and its state
    Show {
        /// Checkpoint ID
        checkpoint_id: String,
    },

    /// Diff the state of two checkpoints
    Compare {
        /// Checkpoint ID (before)
        id_a: String,
        /// Checkpoint ID (after)
        id_b: String,
        /// Also print unchanged keys
        #[arg(short, long)]
        all: bool,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Roll a run back to an earlier checkpoint
    Restore {
        /// Run ID
        run_id: String,
        /// Target version (the N of vN)
        version: Version,
        /// Confirm without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the restore journal of a run
    History {
        /// Run ID
        run_id: String,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective settings
    Config,

    /// Auto-checkpoint a run until interrupted
    Watch {
        /// Run ID
        run_id: String,
        /// Interval such as 300, 90s, 5m or 1h (60s to 1h)
        #[arg(short, long, default_value = "5m", value_parser = parse_interval_arg)]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Create or overwrite a run
    Set {
        /// Run ID
        run_id: String,
        /// Current step number
        #[arg(short, long)]
        step: u64,
        /// State as inline JSON, or @file
        #[arg(long)]
        state: String,
    },
    /// Print a run
    Show {
        /// Run ID
        run_id: String,
    },
}

fn parse_interval_arg(value: &str) -> std::result::Result<u64, String> {
    commands::parse_interval(value).map_err(|e| e.to_string())
}

fn prompt_confirmation() -> Result<bool> {
    print!("Proceed? [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_paths(None, path),
        None => ConfigLoader::new(),
    };
    let mut settings = loader.load().await.context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        settings.storage.data_dir = dir;
    }

    // RUST_LOG wins over logging.level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let ctx = CliContext::open(settings)?;
    let mut out = io::stdout();

    match cli.command {
        Commands::Run(RunCommands::Set {
            run_id,
            step,
            state,
        }) => {
            let state = commands::read_state(&state).await?;
            commands::set_run(&ctx, &RunId::new(run_id), step, state, &mut out).await
        }
        Commands::Run(RunCommands::Show { run_id }) => {
            commands::show_run(&ctx, &RunId::new(run_id), &mut out).await
        }
        Commands::Create {
            run_id,
            description,
        } => commands::create(&ctx, &RunId::new(run_id), description, &mut out).await,
        Commands::List { run_id, format } => {
            commands::list(&ctx, &RunId::new(run_id), format, &mut out).await
        }
        Commands::Show { checkpoint_id } => {
            commands::show(&ctx, &checkpoint_id, &mut out).await
        }
        Commands::Compare {
            id_a,
            id_b,
            all,
            format,
        } => commands::compare(&ctx, &id_a, &id_b, all, format, &mut out).await,
        Commands::Restore {
            run_id,
            version,
            yes,
        } => {
            let confirm = move || if yes { Ok(true) } else { prompt_confirmation() };
            commands::restore(&ctx, &RunId::new(run_id), version, confirm, &mut out).await
        }
        Commands::History { run_id, format } => {
            commands::history(&ctx, &RunId::new(run_id), format, &mut out).await
        }
        Commands::Config => commands::config(&ctx, &mut out),
        Commands::Watch { run_id, interval } => {
            let stop = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("failed to listen for Ctrl-C: {}", e);
                }
            };
            commands::watch(&ctx, &RunId::new(run_id), interval, stop, &mut out).await
        }
    }
}
