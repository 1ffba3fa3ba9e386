//! Node configuration for the Atlas full node.
//!
//! [`NodeConfig`] carries the chain parameters, snapshot policy and sync
//! tuning. [`NodeConfig::load`] layers an optional TOML file and
//! `ATLAS__`-prefixed environment variables over the defaults, e.g.
//! `ATLAS__PARAMS__BLOCK_TIME_SECS=5`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use atlas_consensus::KycInfo;
use atlas_core::constants::{
    DEFAULT_APPLY_SNAPSHOT_INTERVAL_SECS, DEFAULT_SNAPSHOT_INTERVAL_SECS,
    DEFAULT_SNAPSHOT_RETENTION,
};
use atlas_core::crypto::KeyPair;
use atlas_core::error::AtlasError;
use atlas_core::params::ChainParams;
use atlas_network::SyncConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ATLAS";

/// Snapshot policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Write and recover snapshots at all.
    pub enabled: bool,
    /// Snapshot directory. `None` means `<data_dir>/snapshots`.
    pub dir: Option<PathBuf>,
    /// Number of snapshot files kept on disk.
    pub retention: usize,
    /// Period of the background snapshot task.
    pub interval_secs: u64,
    /// Minimum gap between automatic snapshots taken after block application.
    pub apply_interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            retention: DEFAULT_SNAPSHOT_RETENTION,
            interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            apply_interval_secs: DEFAULT_APPLY_SNAPSHOT_INTERVAL_SECS,
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn apply_interval(&self) -> Duration {
        Duration::from_secs(self.apply_interval_secs)
    }
}

/// Configuration for a full node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "atlas_network=trace").
    pub log_level: String,
    pub params: ChainParams,
    pub snapshot: SnapshotConfig,
    pub sync: SyncConfig,
    /// Hex-encoded Ed25519 secret key. Without one the node never forges.
    pub validator_key: Option<String>,
    /// Stake the local key registers with at startup. Zero skips
    /// registration.
    pub validator_stake: u64,
    pub validator_kyc: KycInfo,
    /// Balances credited at startup when no snapshot is recovered.
    pub genesis_allocations: BTreeMap<String, i64>,
    /// Validators every node of the network knows at startup, with their
    /// stake. Blocks are only accepted from registered validators, so
    /// followers need the producers that were registered off chain.
    pub genesis_validators: BTreeMap<String, u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("atlas");

        Self {
            data_dir,
            log_level: "info".to_string(),
            params: ChainParams::default(),
            snapshot: SnapshotConfig::default(),
            sync: SyncConfig::default(),
            validator_key: None,
            validator_stake: 0,
            validator_kyc: KycInfo::default(),
            genesis_allocations: BTreeMap::new(),
            genesis_validators: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Defaults, then `path` (TOML, required when given), then environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AtlasError> {
        let defaults = Config::try_from(&NodeConfig::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let cfg: NodeConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject parameter sets the node cannot run with.
    pub fn validate(&self) -> Result<(), AtlasError> {
        self.params.validate().map_err(AtlasError::Config)?;
        if self.snapshot.enabled && self.snapshot.retention == 0 {
            return Err(AtlasError::Config("snapshot.retention must be positive".into()));
        }
        if self.sync.chunk_size == 0 {
            return Err(AtlasError::Config("sync.chunk_size must be positive".into()));
        }
        if let Some((addr, amount)) = self.genesis_allocations.iter().find(|(_, a)| **a < 0) {
            return Err(AtlasError::Config(format!(
                "genesis allocation for {addr} is negative: {amount}"
            )));
        }
        if let Some(addr) = self.genesis_validators.iter().find(|(_, s)| **s == 0).map(|(a, _)| a) {
            return Err(AtlasError::Config(format!(
                "genesis validator {addr} has no stake"
            )));
        }
        if self.validator_stake > 0 && self.validator_key.is_none() {
            return Err(AtlasError::Config(
                "validator_stake requires validator_key".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding snapshot files.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("snapshots"))
    }

    /// The forging key, if one is configured.
    pub fn signer(&self) -> Result<Option<KeyPair>, AtlasError> {
        self.validator_key
            .as_deref()
            .map(KeyPair::from_secret_hex)
            .transpose()
            .map_err(AtlasError::from)
    }
}

fn config_error(e: config::ConfigError) -> AtlasError {
    AtlasError::Config(e.to_string())
}
