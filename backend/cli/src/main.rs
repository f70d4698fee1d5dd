mod analyze_cmd;
mod config_cmd;
mod runtime;
mod terminal_output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use tubelens_config::{config_dir, config_file_path, load_and_prepare, TubeLensConfig};
use tubelens_logging::{init_console_logger, init_logger};

use analyze_cmd::FactorArgs;
use config_cmd::ConfigCommands;

#[derive(Parser)]
#[command(name = "tubelens")]
#[command(about = "TubeLens: explain why a video performed the way it did")]
#[command(version)]
struct Cli {
    /// Config file (default: $TUBELENS_CONFIG_DIR/config.yaml or ~/.tubelens/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a video, falling back to the classic pipeline when needed
    Analyze {
        video_id: String,
        #[command(flatten)]
        factors: FactorArgs,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which mode a video would be analyzed in, without running it
    SelectMode {
        #[command(flatten)]
        factors: FactorArgs,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or initialize the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_file_path(&config_dir()));

    match cli.command {
        Commands::Analyze {
            video_id,
            factors,
            json,
        } => {
            let config = load_and_prepare(&path).await?;
            init_logging(&config);
            debug!(path = %path.display(), "Config loaded");
            analyze_cmd::analyze(&config, &video_id, &factors, json).await?;
        }
        Commands::SelectMode { factors, json } => {
            let config = load_and_prepare(&path).await?;
            init_logging(&config);
            analyze_cmd::select_mode(&config, &factors, json)?;
        }
        Commands::Config { command } => {
            init_console_logger("warn");
            config_cmd::run(command, &path).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &TubeLensConfig) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = logging.level.as_deref().unwrap_or("info");
    match logging.dir.as_deref() {
        Some(dir) => init_logger(dir, level),
        None => init_console_logger(level),
    }
}
