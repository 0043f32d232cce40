//! qtrader - value-learning trading engine
//!
//! Replays recorded tapes for training and evaluation, and drives the same decision
//! loop against a live feed.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{backtest::BacktestArgs, live::LiveArgs};
use qtrader_backtest::BacktestConfig;
use qtrader_core::AppConfig;
use qtrader_observability::{init_logging, LogFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(name = "qtrader", version, about = "Value-learning trading engine")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "QTRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format: pretty, json or compact
    #[arg(long, global = true, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Default log level; RUST_LOG overrides it per target
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a recorded tape through the agent
    Backtest(BacktestArgs),
    /// Run the agent against a feed
    Live(LiveArgs),
}

/// On-disk configuration: the application settings plus a `[backtest]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub app: AppConfig,
    pub backtest: BacktestConfig,
}

fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else if explicit.is_some() {
        anyhow::bail!("Config file not found: {}", path.display())
    } else {
        info!("Config file not found, using defaults");
        Ok(FileConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level).context("Failed to initialise logging")?;

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Backtest(args) => commands::backtest::run(args, config).await,
        Command::Live(args) => commands::live::run(args, config).await,
    }
}
