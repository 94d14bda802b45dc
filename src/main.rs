use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use phasequeue::config::PhaseQueueConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "phasequeue")]
#[command(version, about = "Dependency-ordered phase queue with failure cascade")]
pub struct Cli {
    /// Path to phasequeue.toml (default: .phasequeue/phasequeue.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides config and PHASEQUEUE_DB_PATH.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the reconciliation loop
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create a phase chain for a group
    Enqueue {
        group_id: i64,

        /// Phase title, in order. Repeat for each phase.
        #[arg(long = "phase", conflicts_with = "file")]
        phases: Vec<String>,

        /// JSON file with an array of phase payloads
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Show the phase chain of a group
    Status {
        group_id: i64,

        #[arg(long)]
        json: bool,
    },
    /// Record that a ready phase was handed to the execution engine
    Dispatch { queue_id: String, external_ref: i64 },
    /// Mark a running phase completed
    Complete { queue_id: String },
    /// Mark a running phase failed
    Fail {
        queue_id: String,

        #[arg(long)]
        error: String,
    },
    /// Remove a pending phase and its pending dependents
    Cancel {
        queue_id: String,

        /// Also remove started phases
        #[arg(long)]
        force: bool,
    },
    /// Remove every phase of a group
    CancelGroup {
        group_id: i64,

        #[arg(long)]
        force: bool,
    },
    /// Run one reconciliation cycle and print the report
    Reconcile,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Validate,
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // `config init` must work even when the existing file does not parse.
    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = &cli.command
    {
        let path = cli.config.clone().unwrap_or_else(PhaseQueueConfig::default_path);
        return cmd::cmd_config_init(&path);
    }

    let config =
        PhaseQueueConfig::load(cli.config.clone())?.with_cli_args(cli.db.clone(), cli.verbose);
    let _log_guard = phasequeue::logging::init_logging(&config.logging())?;

    match &cli.command {
        Commands::Serve { port } => cmd::cmd_serve(&config, *port).await?,
        Commands::Enqueue {
            group_id,
            phases,
            file,
        } => cmd::cmd_enqueue(&config, *group_id, phases, file.as_deref()).await?,
        Commands::Status { group_id, json } => cmd::cmd_status(&config, *group_id, *json).await?,
        Commands::Dispatch {
            queue_id,
            external_ref,
        } => cmd::cmd_dispatch(&config, queue_id, *external_ref).await?,
        Commands::Complete { queue_id } => cmd::cmd_complete(&config, queue_id).await?,
        Commands::Fail { queue_id, error } => cmd::cmd_fail(&config, queue_id, error).await?,
        Commands::Cancel { queue_id, force } => cmd::cmd_cancel(&config, queue_id, *force).await?,
        Commands::CancelGroup { group_id, force } => {
            cmd::cmd_cancel_group(&config, *group_id, *force).await?
        }
        Commands::Reconcile => cmd::cmd_reconcile(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
