//! rangedl CLI - segmented, resumable downloads from the terminal
//!
//! Every command opens the same SQLite state under the data directory, so a
//! transfer paused here can be resumed by a later `rangedl run`.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rangedl_core::{EngineConfig, SqliteStore, TransferEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// The CLI acts for a single local owner
pub(crate) const LOCAL_OWNER: Uuid = Uuid::nil();

/// rangedl - segmented HTTP downloads that survive restarts
#[derive(Parser)]
#[command(name = "rangedl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory holding the transfer database
    #[arg(long, env = "RANGEDL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON file with engine tunables
    #[arg(long, env = "RANGEDL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL and wait for it to finish
    Get {
        /// URL to download
        url: String,

        /// Directory to save into
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// File name, derived from the URL when omitted
        #[arg(long)]
        name: Option<String>,

        /// Number of segments for parallel download
        #[arg(short, long)]
        segments: Option<u32>,

        /// Per-transfer speed cap in bytes/sec
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Drive every running transfer until none is left
    Run,

    /// List transfers
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show transfer details and its segments
    Info {
        /// Transfer ID or a unique prefix of it
        id: String,
    },

    /// Pause a transfer
    Pause {
        /// Transfer ID
        id: String,
    },

    /// Mark a transfer running again; `rangedl run` picks it up
    Resume {
        /// Transfer ID
        id: String,
    },

    /// Cancel a transfer, keeping the partial file
    Cancel {
        /// Transfer ID
        id: String,
    },

    /// Delete a transfer together with its file
    Delete {
        /// Transfer ID
        id: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,

    /// Set a setting
    Set {
        /// default_segments, global_speed_limit_bps or default_save_dir
        key: String,

        /// New value
        value: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "rangedl_core=debug,info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

async fn open_engine(data_dir: &Path, config: EngineConfig) -> Result<TransferEngine> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let store = SqliteStore::open(data_dir.join("transfers.db")).await?;
    Ok(TransferEngine::new(Arc::new(store), config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "rangedl", &mut std::io::stdout());
        return Ok(());
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("rangedl"))
            .unwrap_or_else(|| PathBuf::from(".rangedl"))
    });

    let config = load_config(cli.config.as_deref())?;
    let engine = open_engine(&data_dir, config).await?;

    let result = match cli.command {
        Commands::Get {
            url,
            output,
            name,
            segments,
            limit,
        } => {
            let request = commands::GetRequest {
                url,
                save_dir: output,
                file_name: name,
                segments,
                limit,
            };
            commands::get(&engine, request, cli.output).await
        }

        Commands::Run => commands::run(&engine, cli.output).await,

        Commands::List { status } => commands::list_transfers(&engine, status, cli.output).await,

        Commands::Info { id } => commands::show_info(&engine, &id, cli.output).await,

        Commands::Pause { id } => commands::pause_transfer(&engine, &id, cli.output).await,

        Commands::Resume { id } => commands::resume_transfer(&engine, &id, cli.output).await,

        Commands::Cancel { id } => commands::cancel_transfer(&engine, &id, cli.output).await,

        Commands::Delete { id } => commands::delete_transfer(&engine, &id, cli.output).await,

        Commands::Config { action } => commands::config_action(&engine, action, cli.output).await,

        Commands::Completions { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}
