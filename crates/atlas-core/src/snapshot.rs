//! Checksummed JSON snapshots of the balance map.
//!
//! Files are named `snapshot_{height}_{YYYYMMDD_HHMMSS}.json` and hold a
//! [`Snapshot`]. The checksum covers the height, the timestamp, and every
//! `(address, balance)` pair in address order, so it does not depend on the
//! order balances were inserted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::StateError;

const PREFIX: &str = "snapshot_";
const SUFFIX: &str = ".json";

/// A point-in-time copy of every balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub balances: BTreeMap<String, i64>,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

impl Snapshot {
    /// Build a snapshot and compute its checksum.
    pub fn new(balances: BTreeMap<String, i64>, block_height: u64, timestamp: DateTime<Utc>) -> Self {
        let checksum = snapshot_checksum(&balances, block_height, &timestamp);
        Self {
            balances,
            block_height,
            timestamp,
            checksum,
        }
    }

    /// Whether the stored checksum matches the contents.
    pub fn verify(&self) -> bool {
        self.checksum == snapshot_checksum(&self.balances, self.block_height, &self.timestamp)
    }
}

/// Checksum of a snapshot's contents.
pub fn snapshot_checksum(
    balances: &BTreeMap<String, i64>,
    height: u64,
    timestamp: &DateTime<Utc>,
) -> String {
    let prefix = format!(
        "{height}_{}",
        timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    balances_checksum(&prefix, balances)
}

/// SHA-256 hex over `prefix` followed by `_{address}_{balance}` for each
/// entry in address order.
pub fn balances_checksum(prefix: &str, balances: &BTreeMap<String, i64>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    for (addr, bal) in balances {
        hasher.update(format!("_{addr}_{bal}").as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A snapshot file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub height: u64,
    pub modified: SystemTime,
}

/// Directory of snapshot files with bounded retention.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    /// Open (and create if needed) a snapshot directory.
    pub fn open(dir: impl Into<PathBuf>, retention: usize) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention: retention.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Write a snapshot and prune old files.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, StateError> {
        let name = format!(
            "{PREFIX}{}_{}{SUFFIX}",
            snapshot.block_height,
            snapshot.timestamp.format("%Y%m%d_%H%M%S")
        );
        let path = self.dir.join(name);
        let data = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&path, data)?;
        info!(height = snapshot.block_height, path = %path.display(), "snapshot written");
        self.prune()?;
        Ok(path)
    }

    /// Read and verify one snapshot file.
    pub fn read(&self, path: &Path) -> Result<Snapshot, StateError> {
        let data = fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&data)
            .map_err(|e| StateError::SnapshotCorrupt(format!("{}: {e}", path.display())))?;
        if !snapshot.verify() {
            return Err(StateError::SnapshotCorrupt(path.display().to_string()));
        }
        Ok(snapshot)
    }

    /// Snapshot files, newest first: by modification time, then by height.
    pub fn list(&self) -> Result<Vec<SnapshotFile>, StateError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(height) = name.to_str().and_then(parse_height) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(SnapshotFile {
                path: entry.path(),
                height,
                modified,
            });
        }
        files.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.height.cmp(&a.height))
        });
        Ok(files)
    }

    /// Load the newest snapshot.
    ///
    /// # Errors
    ///
    /// [`StateError::NoSnapshot`] if the directory holds none, and
    /// [`StateError::SnapshotCorrupt`] if the newest fails its checksum.
    pub fn load_latest(&self) -> Result<Snapshot, StateError> {
        let newest = self.list()?.into_iter().next().ok_or(StateError::NoSnapshot)?;
        self.read(&newest.path)
    }

    /// Load the newest snapshot that passes its checksum, walking back
    /// through older files.
    ///
    /// # Errors
    ///
    /// [`StateError::StateCorrupt`] if no valid snapshot exists.
    pub fn recover(&self) -> Result<Snapshot, StateError> {
        for file in self.list()? {
            match self.read(&file.path) {
                Ok(snapshot) => {
                    info!(height = snapshot.block_height, path = %file.path.display(), "recovered from snapshot");
                    return Ok(snapshot);
                }
                Err(e) => warn!(path = %file.path.display(), error = %e, "skipping invalid snapshot"),
            }
        }
        Err(StateError::StateCorrupt)
    }

    /// Delete all but the newest `retention` files.
    pub fn prune(&self) -> Result<usize, StateError> {
        let files = self.list()?;
        let mut removed = 0;
        for file in files.iter().skip(self.retention) {
            fs::remove_file(&file.path)?;
            debug!(path = %file.path.display(), "pruned snapshot");
            removed += 1;
        }
        Ok(removed)
    }
}

fn parse_height(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .split('_')
        .next()?
        .parse()
        .ok()
}
