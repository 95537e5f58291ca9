//! Manifest
//! --------
//! JSON index of every persistent file: the superblock path, the latest
//! checkpoint, all delta logs (with their epoch ranges), all segment data
//! files, and the named-roots catalog. The manifest's atomic rewrite
//! (temp + fsync + rename + directory fsync) is the linearization point
//! for adding or closing delta logs, replacing the checkpoint, and adding
//! segment files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fsio;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub path: String,
    pub epoch: u64,
    pub size: u64,
    pub entries: u64,
    pub crc: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaLogInfo {
    pub path: String,
    pub start_epoch: u64,
    /// 0 while the log is still active.
    pub end_epoch: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileInfo {
    pub class_id: u8,
    pub seq: u32,
    pub file: String,
    pub bytes: u64,
}

/// Catalog entry for one named tree root. The MBR rides along flattened
/// as `[min0, max0, min1, max1, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootEntry {
    pub name: String,
    pub node_id_raw: u64,
    pub epoch: u64,
    #[serde(default)]
    pub mbr: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_unix: u64,
    pub superblock: String,
    pub checkpoint: CheckpointInfo,
    pub delta_logs: Vec<DeltaLogInfo>,
    pub data_files: Vec<DataFileInfo>,
    pub roots: Vec<RootEntry>,
    #[serde(skip)]
    data_dir: PathBuf,
}

impl Manifest {
    pub fn new(data_dir: &Path) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            superblock: "superblock".to_string(),
            checkpoint: CheckpointInfo::default(),
            delta_logs: Vec::new(),
            data_files: Vec::new(),
            roots: Vec::new(),
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Load from disk. `Ok(None)` when the file is missing; corrupt JSON is
    /// an error the caller may downgrade to a cold start.
    pub fn load(data_dir: &Path) -> Result<Option<Manifest>> {
        let path = data_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let mut m: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("parse manifest {}", path.display()))?;
        m.data_dir = data_dir.to_path_buf();
        Ok(Some(m))
    }

    /// Atomically publish the manifest. This is the linearization point
    /// for every file-set mutation.
    pub fn store(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(self).context("serialize manifest")?;
        fsio::atomic_publish(&self.manifest_path(), text.as_bytes())
    }

    pub fn set_checkpoint(&mut self, info: CheckpointInfo) {
        self.checkpoint = info;
    }

    pub fn add_delta_log(&mut self, info: DeltaLogInfo) {
        self.delta_logs.push(info);
    }

    pub fn add_data_file(&mut self, info: DataFileInfo) {
        self.data_files.push(info);
    }

    /// Finalize the open entry for `path`. Returns false when no active
    /// entry matches.
    pub fn close_delta_log(&mut self, path: &str, end_epoch: u64, final_size: u64) -> bool {
        for log in &mut self.delta_logs {
            if log.path == path && log.end_epoch == 0 {
                log.end_epoch = end_epoch;
                log.size = final_size;
                return true;
            }
        }
        false
    }

    /// Drop delta logs fully subsumed by a checkpoint at `checkpoint_epoch`.
    /// Active logs (`end_epoch == 0`) are never pruned. Returns the removed
    /// entries so the caller can delete the files after `store()`.
    pub fn prune_old_delta_logs(&mut self, checkpoint_epoch: u64) -> Vec<DeltaLogInfo> {
        let (dead, keep): (Vec<_>, Vec<_>) = self
            .delta_logs
            .drain(..)
            .partition(|l| l.end_epoch != 0 && l.end_epoch <= checkpoint_epoch);
        self.delta_logs = keep;
        dead
    }

    /// Ordered list of logs that must be replayed on top of a checkpoint at
    /// `checkpoint_epoch`: every log that may contain later epochs.
    pub fn logs_after_checkpoint(&self, checkpoint_epoch: u64) -> Vec<DeltaLogInfo> {
        let mut out: Vec<DeltaLogInfo> = self
            .delta_logs
            .iter()
            .filter(|l| l.end_epoch == 0 || l.end_epoch > checkpoint_epoch)
            .cloned()
            .collect();
        out.sort_by_key(|l| l.start_epoch);
        out
    }

    pub fn set_root(&mut self, entry: RootEntry) {
        if let Some(r) = self.roots.iter_mut().find(|r| r.name == entry.name) {
            *r = entry;
        } else {
            self.roots.push(entry);
        }
    }

    pub fn get_root(&self, name: &str) -> Option<&RootEntry> {
        self.roots.iter().find(|r| r.name == name)
    }

    pub fn has_roots(&self) -> bool {
        !self.roots.is_empty()
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod manifest_tests;
