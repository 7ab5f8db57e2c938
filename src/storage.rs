//! Shared-filesystem layout and atomic publication
//!
//! Every durable artifact lives under one configured root and becomes
//! visible through write-temp-then-rename, so concurrent readers never see
//! a partial write. Naming partitions the writers: no two tasks ever write
//! the same final path, and readers ignore `.tmp` and `.partial` suffixes.
//!
//! This module also produces the filesystem evidence the failure analyzer
//! classifies: which partition files a mapper left behind, and whether a
//! reducer left a partial output or a checkpoint.

use crate::error::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Path layout under the shared filesystem root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `mr-intermediate-<m>-<r>`: mapper m's records for reducer r.
    pub fn intermediate(&self, map_index: u32, reduce_index: u32) -> PathBuf {
        self.root
            .join(format!("mr-intermediate-{map_index}-{reduce_index}"))
    }

    /// `mr-out-<r>.partial`: reducer r's not-yet-promoted output.
    pub fn partial_output(&self, reduce_index: u32) -> PathBuf {
        self.root.join(format!("mr-out-{reduce_index}.partial"))
    }

    /// `mr-out-<r>.checkpoint.json`: reducer r's progress record.
    pub fn checkpoint(&self, reduce_index: u32) -> PathBuf {
        self.root
            .join(format!("mr-out-{reduce_index}.checkpoint.json"))
    }

    /// `mr-out-<r>`: reducer r's final output.
    pub fn output(&self, reduce_index: u32) -> PathBuf {
        self.root.join(format!("mr-out-{reduce_index}"))
    }

    pub async fn ensure_root(&self) -> Result<(), CoordinatorError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CoordinatorError::storage(&self.root, e))
    }

    /// Publish `bytes` at `target` atomically via a sibling temp file.
    pub async fn publish(&self, target: &Path, bytes: &[u8]) -> Result<(), CoordinatorError> {
        let staging = staging_path(target);
        fs::write(&staging, bytes)
            .await
            .map_err(|e| CoordinatorError::storage(&staging, e))?;
        fs::rename(&staging, target)
            .await
            .map_err(|e| CoordinatorError::storage(target, e))
    }

    /// Rename a fully written staging file over its final name.
    pub async fn promote(&self, staging: &Path, target: &Path) -> Result<(), CoordinatorError> {
        fs::rename(staging, target)
            .await
            .map_err(|e| CoordinatorError::storage(target, e))
    }

    /// Gather the durable-output evidence for one map task.
    pub async fn map_evidence(
        &self,
        map_index: u32,
        reduce_count: u32,
    ) -> Result<MapEvidence, CoordinatorError> {
        let mut evidence = MapEvidence {
            map_index,
            present: Vec::new(),
            missing: Vec::new(),
            empty: Vec::new(),
        };
        for reduce_index in 0..reduce_count {
            let path = self.intermediate(map_index, reduce_index);
            match fs::metadata(&path).await {
                Ok(meta) if meta.len() > 0 => evidence.present.push(reduce_index),
                Ok(_) => evidence.empty.push(reduce_index),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    evidence.missing.push(reduce_index)
                }
                Err(e) => return Err(CoordinatorError::storage(path, e)),
            }
        }
        Ok(evidence)
    }

    /// Gather the progress evidence for one reduce task.
    ///
    /// `checkpoint` is populated only when the checkpoint file exists and
    /// parses; a corrupt checkpoint counts as absent.
    pub async fn reduce_evidence(
        &self,
        reduce_index: u32,
    ) -> Result<ReduceEvidence, CoordinatorError> {
        let partial = self.partial_output(reduce_index);
        let has_partial = match fs::metadata(&partial).await {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(CoordinatorError::storage(partial, e)),
        };
        let checkpoint_path = self.checkpoint(reduce_index);
        let checkpoint = match load_checkpoint(&checkpoint_path).await? {
            Some(_) => Some(checkpoint_path),
            None => None,
        };
        Ok(ReduceEvidence {
            reduce_index,
            has_partial,
            checkpoint,
        })
    }

    /// Whether the final output for a partition exists and is non-empty.
    pub async fn output_ready(&self, reduce_index: u32) -> bool {
        match fs::metadata(self.output(reduce_index)).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }
}

/// Sibling staging name for an atomic publication.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// What a mapper left behind on the shared filesystem.
#[derive(Debug, Clone)]
pub struct MapEvidence {
    pub map_index: u32,
    /// Partition indexes with a non-empty intermediate file.
    pub present: Vec<u32>,
    /// Partition indexes with no intermediate file at all.
    pub missing: Vec<u32>,
    /// Partition indexes whose intermediate file is zero bytes.
    pub empty: Vec<u32>,
}

impl MapEvidence {
    /// True when every expected partition file exists and is non-empty,
    /// i.e. the map work is durable and need not be rerun.
    pub fn all_durable(&self) -> bool {
        self.missing.is_empty() && self.empty.is_empty()
    }
}

/// What a reducer left behind on the shared filesystem.
#[derive(Debug, Clone)]
pub struct ReduceEvidence {
    pub reduce_index: u32,
    pub has_partial: bool,
    /// Path of a parseable checkpoint, if one exists.
    pub checkpoint: Option<PathBuf>,
}

impl ReduceEvidence {
    /// True when the reducer had started producing durable state.
    pub fn mid_processing(&self) -> bool {
        self.has_partial || self.checkpoint.is_some()
    }
}

/// A reducer's durable progress record.
///
/// Serialized as JSON so external tooling can read it; field names are part
/// of the on-disk contract. `PartialBytes` records the flushed length of
/// the `.partial` file when the checkpoint was taken, letting a resuming
/// reducer drop any unflushed tail. Unknown fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCheckpoint {
    #[serde(rename = "LastKey")]
    pub last_key: String,
    #[serde(rename = "ProcessedKeys")]
    pub processed_keys: u64,
    #[serde(rename = "PartialBytes", default)]
    pub partial_bytes: u64,
}

/// Read a checkpoint, treating a missing or unparseable file as absent.
pub async fn load_checkpoint(path: &Path) -> Result<Option<ReduceCheckpoint>, CoordinatorError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoordinatorError::storage(path, e)),
    };
    match serde_json::from_slice::<ReduceCheckpoint>(&bytes) {
        Ok(checkpoint) if !checkpoint.last_key.is_empty() => Ok(Some(checkpoint)),
        Ok(_) => Ok(None),
        Err(e) => {
            warn!("Discarding unparseable checkpoint at {}: {e}", path.display());
            Ok(None)
        }
    }
}

/// Atomically overwrite the checkpoint at `path`.
pub async fn store_checkpoint(
    layout: &StorageLayout,
    path: &Path,
    checkpoint: &ReduceCheckpoint,
) -> Result<(), CoordinatorError> {
    let bytes = serde_json::to_vec(checkpoint)?;
    layout.publish(path, &bytes).await
}
