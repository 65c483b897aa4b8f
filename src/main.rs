mod cli;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kb::config::KbConfig;

#[derive(Parser)]
#[command(
    name = "kb",
    version,
    about = "Per-project knowledge store with a warm hybrid search daemon"
)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the project's knowledge store
    Init,
    /// Record a new fact
    Append(cli::append::AppendArgs),
    /// Search the knowledge store
    Query(cli::query::QueryArgs),
    /// Show daemon and index status
    Status {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether the project's daemon is alive (never starts one)
    Ping,
    /// Stop the project's daemon
    Stop,
    /// Maintenance operations
    Admin {
        #[command(subcommand)]
        action: AdminCommand,
    },
    /// Run the daemon in the foreground (used by auto-start)
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Rebuild the index from a full log scan
    Rebuild,
    /// Report malformed log lines
    Validate,
    /// Drop malformed and superseded lines, then rebuild
    Repair,
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Serve the project's store until stopped or idle
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = KbConfig::load()?;

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().context("failed to read the current directory")?,
    };

    match cli.command {
        Command::Init => cli::admin::init(&project, &config).await?,
        Command::Append(args) => cli::append::append(&project, &config, args).await?,
        Command::Query(args) => cli::query::query(&project, &config, args).await?,
        Command::Status { json } => cli::status::status(&project, &config, json).await?,
        Command::Ping => cli::status::ping(&project, &config).await?,
        Command::Stop => cli::status::stop(&project, &config).await?,
        Command::Admin { action } => match action {
            AdminCommand::Rebuild => cli::admin::rebuild(&project, &config).await?,
            AdminCommand::Validate => cli::admin::validate(&project, &config).await?,
            AdminCommand::Repair => cli::admin::repair(&project, &config).await?,
        },
        Command::Daemon { action } => match action {
            DaemonCommand::Run => kb::daemon::run(&project, config).await?,
        },
    }

    Ok(())
}
