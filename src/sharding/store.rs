//! Routing state that must outlive the process.
//!
//! Cutovers and added shards change where tenants resolve, and the hash
//! bucket count must stay what it was when the data was placed. Without this
//! file a restart would route migrated tenants back to their source shard.

use super::routing::RoutingTable;
use crate::connection::config::ShardDescriptor;
use crate::core::{Result, ShardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Everything a router needs to resolve tenants the way it did before a
/// restart. Passwords of added shards are never written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub hash_buckets: u32,
    pub table: RoutingTable,
    /// Shards registered after startup (ids at or above `hash_buckets`).
    #[serde(default)]
    pub added_shards: Vec<ShardDescriptor>,
    pub saved_at: DateTime<Utc>,
}

/// JSON file holding the latest [`RoutingSnapshot`].
#[derive(Debug, Clone)]
pub struct RoutingStore {
    path: PathBuf,
}

impl RoutingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot, or `None` when no file exists yet.
    pub fn load(&self) -> Result<Option<RoutingSnapshot>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(ShardError::Io(format!(
                    "read routing state {}: {}",
                    self.path.display(),
                    err
                )));
            }
        };
        let snapshot = serde_json::from_slice::<RoutingSnapshot>(&bytes).map_err(|err| {
            ShardError::Config(format!(
                "parse routing state {}: {}",
                self.path.display(),
                err
            ))
        })?;
        Ok(Some(snapshot))
    }

    /// Writes the snapshot to a temporary file and atomically renames it
    /// over the previous one.
    pub fn save(&self, snapshot: &RoutingSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    ShardError::Io(format!("create {}: {}", parent.display(), err))
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|err| ShardError::Io(format!("serialize routing state: {}", err)))?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|err| ShardError::Io(format!("write {}: {}", tmp_path.display(), err)))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|err| {
            ShardError::Io(format!("rename to {}: {}", self.path.display(), err))
        })?;

        debug!(
            path = %self.path.display(),
            epoch = snapshot.table.epoch,
            "routing state saved"
        );
        Ok(())
    }
}
