//! Atlas full node binary.
//!
//! Loads configuration, recovers the ledger from the newest valid snapshot,
//! runs the background tasks and shuts down cleanly on Ctrl+C.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use atlas_core::error::{AtlasError, StateError};
use atlas_node_lib::{Node, NodeConfig};
use clap::Parser;
use tracing::{error, info};

/// Exit status when no valid snapshot can be recovered.
const EXIT_STATE_CORRUPT: i32 = 2;

/// Atlas proof-of-stake full node.
#[derive(Parser, Debug)]
#[command(name = "atlas-node", version, about = "Atlas proof-of-stake full node")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for snapshots
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Hex-encoded Ed25519 secret key used to forge blocks
    #[arg(long)]
    validator_key: Option<String>,

    /// Seconds between block production ticks
    #[arg(long)]
    block_time: Option<u64>,

    /// Disable snapshot writing and recovery
    #[arg(long)]
    no_snapshots: bool,
}

impl Args {
    /// Load the config file and environment, then apply CLI overrides.
    fn into_config(self) -> anyhow::Result<(NodeConfig, String)> {
        let mut config = NodeConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(key) = self.validator_key {
            config.validator_key = Some(key);
        }
        if let Some(secs) = self.block_time {
            config.params.block_time_secs = secs;
        }
        if self.no_snapshots {
            config.snapshot.enabled = false;
        }
        config.validate().context("invalid configuration")?;
        Ok((config, self.log_format))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, log_format) = Args::parse().into_config()?;
    init_logging(&config.log_level, &log_format);

    info!("Atlas Full Node v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = %config.data_dir.display(), "data directory");
    info!(
        block_time_secs = config.params.block_time_secs,
        snapshots = config.snapshot.enabled,
        "chain parameters loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(AtlasError::State(StateError::StateCorrupt)) => {
            error!("state corrupt: no valid snapshot to recover from");
            process::exit(EXIT_STATE_CORRUPT);
        }
        Err(e) => return Err(e).context("failed to start node"),
    };

    let validator = node.local_address().unwrap_or_else(|| "none".to_string());
    info!(
        height = node.height(),
        tip = %node.latest_block().hash.short(),
        %validator,
        "node initialized"
    );

    node.start();
    info!("Atlas node running (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("shutdown signal received");

    node.stop().await;
    info!("Atlas node shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` overrides `level_str`. Pass `format = "json"` for structured
/// JSON output; any other value selects human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
