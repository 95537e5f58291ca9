//! Recovery
//! --------
//! Cold start: load the manifest, map the latest checkpoint and restore
//! its entries at their exact handle indices, replay every delta log past
//! the checkpoint epoch in order, then re-expose the committed root from
//! the superblock (or the manifest root catalog when the superblock is
//! absent or corrupt). Torn log tails are truncated to the last verified
//! frame so the next writer appends onto clean bytes.
//!
//! A missing or corrupt manifest downgrades to an empty cold start with a
//! warning; recovery never refuses to bring the store up.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointReader;
use crate::delta_log::OtDeltaLog;
use crate::entry::RETIRE_LIVE;
use crate::manifest::Manifest;
use crate::node_id::NodeId;
use crate::segment::SegmentAllocator;
use crate::sharded::ObjectTableSharded;
use crate::superblock::Superblock;

/// How much of the log history to bring in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Checkpoint + full WAL replay.
    Full,
    /// As `Full`, and rehydrate inline WAL payloads into segments
    /// (EVENTUAL-mode crash recovery).
    WithPayloads,
    /// Checkpoint only; accepts a slightly stale snapshot for fast
    /// read-only startup.
    ReadOnly,
}

#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub checkpoint_epoch: u64,
    pub replayed_frames: u64,
    pub replayed_bytes: u64,
    /// Epoch the MVCC clock must resume at.
    pub resume_epoch: u64,
    /// Committed root from the superblock, if it validated.
    pub root: Option<(NodeId, u64)>,
    /// Logs whose torn tails were truncated.
    pub truncated_logs: Vec<PathBuf>,
    /// Payload bytes rehydrated from the WAL (WithPayloads only).
    pub rehydrated_payloads: u64,
}

pub struct Recovery<'a> {
    pub dir: &'a Path,
    pub ot: &'a ObjectTableSharded,
    pub alloc: &'a SegmentAllocator,
    pub superblock: &'a Superblock,
}

impl Recovery<'_> {
    /// Full recovery: checkpoint + WAL replay.
    pub fn cold_start(&self, manifest: &Manifest) -> Result<RecoveryOutcome> {
        self.run(manifest, RecoveryMode::Full)
    }

    /// Recovery with WAL payload rehydration for EVENTUAL mode.
    pub fn cold_start_with_payloads(&self, manifest: &Manifest) -> Result<RecoveryOutcome> {
        self.run(manifest, RecoveryMode::WithPayloads)
    }

    /// Checkpoint-only recovery for fast read-only startup.
    pub fn cold_start_readonly(&self, manifest: &Manifest) -> Result<RecoveryOutcome> {
        self.run(manifest, RecoveryMode::ReadOnly)
    }

    /// Load the manifest for `dir`, downgrading absence or corruption to a
    /// fresh manifest with a warning.
    pub fn load_manifest(dir: &Path) -> Manifest {
        match Manifest::load(dir) {
            Ok(Some(m)) => m,
            Ok(None) => Manifest::new(dir),
            Err(err) => {
                tracing::warn!(
                    target: "xtstore::recovery",
                    "manifest unreadable, starting empty: {err:#}"
                );
                Manifest::new(dir)
            }
        }
    }

    fn run(&self, manifest: &Manifest, mode: RecoveryMode) -> Result<RecoveryOutcome> {
        let mut out = RecoveryOutcome::default();

        // 1. Re-register segment data files so persisted addresses resolve.
        let mut seen = std::collections::HashSet::new();
        for df in &manifest.data_files {
            seen.insert((df.class_id, df.seq));
            if let Err(err) = self.alloc.restore_segment(df.class_id, df.seq) {
                tracing::warn!(
                    target: "xtstore::recovery",
                    "segment {} (class {}) missing or unmappable: {err:#}", df.file, df.class_id
                );
            }
        }
        // A crash can land between segment creation and the manifest
        // update; pick up any stray segment files on disk as well.
        for (class_id, seq) in scan_segment_files(&self.dir.join("data")) {
            if seen.insert((class_id, seq)) {
                if let Err(err) = self.alloc.restore_segment(class_id, seq) {
                    tracing::warn!(
                        target: "xtstore::recovery",
                        "stray segment c{} s{} unmappable: {err:#}", class_id, seq
                    );
                }
            }
        }

        self.ot.begin_recovery();

        // 2. Restore the checkpoint, if the manifest names one.
        if !manifest.checkpoint.path.is_empty() {
            let path = self.dir.join(&manifest.checkpoint.path);
            match CheckpointReader::open(&path) {
                Ok(reader) => {
                    out.checkpoint_epoch = reader.epoch();
                    for pe in reader.entries() {
                        self.ot.restore_handle(pe.handle_idx, &pe);
                        self.note_addr_in_use(pe.class_id, pe.segment_id, pe.offset);
                    }
                    tracing::info!(
                        target: "xtstore::recovery",
                        "restored checkpoint epoch={} entries={}",
                        reader.epoch(), reader.entry_count()
                    );
                }
                Err(err) => {
                    // Downgrade: replay everything the logs still hold.
                    tracing::warn!(
                        target: "xtstore::recovery",
                        "checkpoint {} unreadable, replaying full log history: {err:#}",
                        path.display()
                    );
                }
            }
        }

        // 3. Replay delta logs in epoch order.
        if mode != RecoveryMode::ReadOnly {
            for log_info in manifest.logs_after_checkpoint(out.checkpoint_epoch) {
                let path = self.dir.join(&log_info.path);
                if !path.exists() {
                    tracing::warn!(
                        target: "xtstore::recovery",
                        "delta log {} named by manifest is missing", path.display()
                    );
                    continue;
                }
                let res = OtDeltaLog::replay(&path, |rec, payload| {
                    self.ot.apply_delta(rec);
                    if rec.retire_epoch == RETIRE_LIVE {
                        self.note_addr_in_use(rec.class_id, rec.segment_id, rec.offset);
                    }
                    if mode == RecoveryMode::WithPayloads {
                        if let Some(bytes) = payload {
                            if self.rehydrate(rec, bytes) {
                                out.rehydrated_payloads += 1;
                            }
                        }
                    }
                })
                .with_context(|| format!("replay {}", path.display()))?;
                out.replayed_frames += res.frames;
                out.replayed_bytes += res.last_good_offset;
                out.resume_epoch = out.resume_epoch.max(res.max_epoch);
                if res.truncated_tail {
                    OtDeltaLog::truncate_to(&path, res.last_good_offset)?;
                    out.truncated_logs.push(path);
                }
            }
        }

        // 4. Close recovery mode; the table is now consistent.
        self.ot.end_recovery();

        // 5. Committed root: superblock first, manifest catalog as fallback.
        match self.superblock.load() {
            Some(snap) => {
                out.resume_epoch = out.resume_epoch.max(snap.epoch);
                if snap.root.is_valid() {
                    out.root = Some((snap.root, snap.epoch));
                }
            }
            None => {
                if let Some(root) = manifest.get_root("") {
                    tracing::warn!(
                        target: "xtstore::recovery",
                        "superblock absent or corrupt; using manifest root catalog"
                    );
                    out.resume_epoch = out.resume_epoch.max(root.epoch);
                    out.root = Some((NodeId::from_raw(root.node_id_raw), root.epoch));
                }
            }
        }
        out.resume_epoch = out.resume_epoch.max(out.checkpoint_epoch);

        tracing::info!(
            target: "xtstore::recovery",
            "cold start complete: mode={:?} frames={} bytes={} resume_epoch={}",
            mode, out.replayed_frames, out.replayed_bytes, out.resume_epoch
        );
        Ok(out)
    }

    fn note_addr_in_use(&self, class_id: u8, segment_id: u32, offset: u64) {
        if let Err(err) = self.alloc.note_in_use(class_id, segment_id, offset) {
            tracing::debug!(
                target: "xtstore::recovery",
                "address c{} s{} o{} has no backing segment: {err:#}",
                class_id, segment_id, offset
            );
        }
    }

    /// Write an inline WAL payload back into its segment slot. Fails soft:
    /// a missing segment only means the node stays unreadable.
    fn rehydrate(&self, rec: &crate::delta_log::OtDeltaRec, bytes: &[u8]) -> bool {
        let addr = crate::entry::OtAddr {
            file_id: rec.file_id,
            segment_id: rec.segment_id,
            offset: rec.offset,
            length: rec.length,
        };
        match self.alloc.write_payload(&addr, bytes) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target: "xtstore::recovery",
                    "payload rehydration for handle {} failed: {err:#}", rec.handle_idx
                );
                false
            }
        }
    }
}

/// Parse `data.cXX.YYYYYY.seg` names in the data directory.
fn scan_segment_files(data_dir: &Path) -> Vec<(u8, u32)> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name.strip_prefix("data.c").and_then(|n| n.strip_suffix(".seg")) else {
            continue;
        };
        let mut parts = rest.splitn(2, '.');
        let (Some(class_s), Some(seq_s)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let (Ok(class_id), Ok(seq)) = (class_s.parse::<u8>(), seq_s.parse::<u32>()) {
            out.push((class_id, seq));
        }
    }
    out.sort_unstable();
    out
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod recovery_tests;
