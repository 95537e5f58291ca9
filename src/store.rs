//! Durable store
//! -------------
//! The thin public surface the tree layer programs against. Everything
//! else in this crate hangs off it: `allocate_node` carves segment space
//! and reserves an invisible handle, `publish_node` walks the two-phase
//! WAL-then-commit protocol, `read_node` resolves a handle through the
//! tag check and hands back payload bytes, `retire_node` stamps an
//! MVCC retirement, and `commit` / `set_root` run through the checkpoint
//! coordinator's group-commit publish.
//!
//! The store is `Send + Sync`; wrap it in an `Arc` and share it across
//! threads.

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DurabilityMode, StoreConfig};
use crate::coordinator::{delta_log_name, ActiveLog, CheckpointCoordinator, CoordinatorStats};
use crate::delta_log::{OtDeltaLog, OtDeltaRec};
use crate::entry::RETIRE_LIVE;
use crate::error::{StoreError, StoreResult};
use crate::manifest::{DataFileInfo, DeltaLogInfo, Manifest, RootEntry};
use crate::mvcc::{MvccContext, SnapshotGuard};
use crate::node_id::{NodeId, NodeKind};
use crate::recovery::{Recovery, RecoveryOutcome};
use crate::reclaim::Reclaimer;
use crate::segment::{class_slot_bytes, SegmentAllocator, SegmentPin};
use crate::sharded::ObjectTableSharded;
use crate::superblock::Superblock;

/// Why a node is being retired; carried into the trace log together with
/// the caller's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Unknown,
    SplitReplace,
    MergeDelete,
    Evict,
    AbortRollback,
    Reallocation,
    TreeDestroy,
}

/// Result of `allocate_node`: a not-yet-live id plus the slot capacity.
#[derive(Debug, Clone, Copy)]
pub struct AllocResult {
    pub id: NodeId,
    pub capacity: u32,
}

/// A pinned read: the mapping stays valid for the life of this value.
pub struct PinnedRead {
    pin: SegmentPin,
    offset: u64,
    len: u32,
}

impl PinnedRead {
    pub fn bytes(&self) -> &[u8] {
        // The pin was validated at construction.
        self.pin.bytes(self.offset, self.len).expect("pinned range was validated")
    }
}

pub struct DurableStore {
    dir: PathBuf,
    cfg: StoreConfig,
    ot: Arc<ObjectTableSharded>,
    alloc: Arc<SegmentAllocator>,
    superblock: Arc<Superblock>,
    manifest: Arc<Mutex<Manifest>>,
    mvcc: Arc<MvccContext>,
    active: Arc<ActiveLog>,
    coordinator: CheckpointCoordinator,
    roots: RwLock<HashMap<String, RootEntry>>,
}

impl DurableStore {
    /// Open (or create) a store rooted at `dir`, running cold-start
    /// recovery and starting the checkpoint coordinator.
    pub fn open(dir: &Path, cfg: StoreConfig) -> Result<DurableStore> {
        std::fs::create_dir_all(dir.join("logs")).context("create logs dir")?;
        let superblock = Arc::new(Superblock::open(&dir.join("superblock"))?);
        let alloc = Arc::new(SegmentAllocator::new(&dir.join("data"), cfg.segment_bytes)?);
        let ot = Arc::new(ObjectTableSharded::new(cfg.num_shards));
        ot.set_segment_allocator(Arc::clone(&alloc));
        let mvcc = Arc::new(MvccContext::new());

        let mut manifest = Recovery::load_manifest(dir);
        let recovery = Recovery { dir, ot: &ot, alloc: &alloc, superblock: &superblock };
        let outcome: RecoveryOutcome = match cfg.policy.durability_mode {
            DurabilityMode::Eventual => recovery.cold_start_with_payloads(&manifest)?,
            _ => recovery.cold_start(&manifest)?,
        };
        mvcc.resume_at(outcome.resume_epoch.max(1));

        // Reopen the active delta log named by the manifest, or start a
        // fresh one past every known sequence.
        let max_seq = manifest
            .delta_logs
            .iter()
            .filter_map(|l| parse_log_seq(&l.path))
            .max()
            .unwrap_or(0);
        let active_info = manifest.delta_logs.iter().find(|l| l.end_epoch == 0).cloned();
        let (log_path, log_seq) = match &active_info {
            Some(info) => (dir.join(&info.path), parse_log_seq(&info.path).unwrap_or(max_seq)),
            None => {
                let seq = max_seq + 1;
                let name = delta_log_name(seq);
                manifest.add_delta_log(DeltaLogInfo {
                    path: name.clone(),
                    start_epoch: outcome.resume_epoch + 1,
                    end_epoch: 0,
                    size: 0,
                });
                manifest.store()?;
                (dir.join(name), seq)
            }
        };
        let log = Arc::new(OtDeltaLog::new(&log_path, cfg.wal_prealloc_chunk, log_seq));
        log.open_for_append()?;
        log.seed_max_epoch(outcome.resume_epoch);
        let active = Arc::new(ActiveLog::new(log));

        let roots: HashMap<String, RootEntry> =
            manifest.roots.iter().cloned().map(|r| (r.name.clone(), r)).collect();

        let manifest = Arc::new(Mutex::new(manifest));
        let coordinator = CheckpointCoordinator::new(
            dir.to_path_buf(),
            Arc::clone(&ot),
            Arc::clone(&superblock),
            Arc::clone(&manifest),
            Arc::clone(&active),
            Arc::clone(&alloc),
            Arc::clone(&mvcc),
            cfg.policy.clone(),
            Some(Reclaimer::new(Arc::clone(&ot), Arc::clone(&mvcc))),
            log_seq + 1,
        );
        coordinator.initialize_after_recovery(outcome.resume_epoch, outcome.replayed_bytes);
        coordinator.start();

        tracing::info!(
            target: "xtstore::store",
            "store open at {} (resume epoch {}, {} replayed frames)",
            dir.display(), outcome.resume_epoch, outcome.replayed_frames
        );
        Ok(DurableStore {
            dir: dir.to_path_buf(),
            cfg,
            ot,
            alloc,
            superblock,
            manifest,
            mvcc,
            active,
            coordinator,
            roots: RwLock::new(roots),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mvcc(&self) -> &Arc<MvccContext> {
        &self.mvcc
    }

    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    /// Open a reader snapshot; entries retired at or after the snapshot
    /// epoch stay resolvable for its lifetime.
    pub fn begin_snapshot(&self) -> SnapshotGuard {
        self.mvcc.begin_snapshot()
    }

    // ---------------- Space ----------------

    /// Reserve segment space and an invisible handle. The id is not live;
    /// follow with `publish_node` or roll back with `free_node_immediate`.
    pub fn allocate_node(&self, min_len: u32, kind: NodeKind) -> StoreResult<AllocResult> {
        let allocation = self
            .alloc
            .allocate(min_len)
            .map_err(|e| StoreError::Exhausted(format!("segment space: {e:#}")))?;
        self.register_new_segments()?;
        let id = self.ot.allocate(kind, allocation.class_id, allocation.addr(), 0);
        if !id.is_valid() {
            let _ = self.alloc.free(&allocation);
            return Err(StoreError::Exhausted("object table handles".into()));
        }
        Ok(AllocResult { id, capacity: class_slot_bytes(allocation.class_id) })
    }

    /// Newly created segment files must hit the manifest before any node
    /// in them is published.
    fn register_new_segments(&self) -> StoreResult<()> {
        let new_files = self.alloc.take_new_files();
        if new_files.is_empty() {
            return Ok(());
        }
        let mut manifest = self.manifest.lock();
        for nf in new_files {
            manifest.add_data_file(DataFileInfo {
                class_id: nf.class_id,
                seq: nf.seq,
                file: format!("data/{}", nf.file_name),
                bytes: nf.bytes,
            });
        }
        manifest.store().map_err(StoreError::Other)
    }

    // ---------------- Publish ----------------

    /// Copy `data` into the reserved slot and run the two-phase publish:
    /// stage → WAL append → commit. Returns the final id (its tag may
    /// differ from `id` when the handle had a prior life); all later
    /// references must use it.
    pub fn publish_node(&self, id: NodeId, data: &[u8]) -> StoreResult<NodeId> {
        let view = self
            .ot
            .get_by_handle(id.handle_index())
            .ok_or_else(|| StoreError::InvalidState(format!("publish of unknown handle {:?}", id)))?;
        if !view.is_reserved() {
            return Err(StoreError::InvalidState(format!(
                "publish of {:?} in non-reserved state",
                id
            )));
        }
        let capacity = class_slot_bytes(view.class_id);
        if data.len() as u64 > capacity as u64 {
            return Err(StoreError::Exhausted(format!(
                "payload {} exceeds slot capacity {}",
                data.len(),
                capacity
            )));
        }
        let mut write_addr = view.addr;
        write_addr.length = capacity;
        self.alloc.write_payload(&write_addr, data).map_err(StoreError::Other)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        let crc = hasher.finalize();
        self.finish_publish(id, data.len() as u32, crc, Some(data))
    }

    /// Publish bytes already written through `with_node_mut`; skips the
    /// memcpy but still checksums the mapped range.
    pub fn publish_node_in_place(&self, id: NodeId, len: u32) -> StoreResult<NodeId> {
        let view = self
            .ot
            .get_by_handle(id.handle_index())
            .ok_or_else(|| StoreError::InvalidState(format!("publish of unknown handle {:?}", id)))?;
        if !view.is_reserved() {
            return Err(StoreError::InvalidState(format!(
                "publish of {:?} in non-reserved state",
                id
            )));
        }
        if len as u64 > class_slot_bytes(view.class_id) as u64 {
            return Err(StoreError::Exhausted(format!(
                "length {} exceeds slot capacity {}",
                len,
                class_slot_bytes(view.class_id)
            )));
        }
        let pin = self
            .alloc
            .pin(view.addr.file_id)
            .ok_or_else(|| StoreError::InvalidState("slot has no backing segment".into()))?;
        let crc = {
            let bytes = pin.bytes(view.addr.offset, len).map_err(StoreError::Other)?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(bytes);
            hasher.finalize()
        };
        // Inline payload for small nodes still applies: copy out of the map.
        let inline: Option<Vec<u8>> = if self.wants_inline_payload(len) {
            Some(pin.bytes(view.addr.offset, len).map_err(StoreError::Other)?.to_vec())
        } else {
            None
        };
        self.finish_publish(id, len, crc, inline.as_deref())
    }

    fn wants_inline_payload(&self, len: u32) -> bool {
        self.cfg.policy.durability_mode == DurabilityMode::Eventual
            && len <= self.cfg.policy.max_payload_in_wal
    }

    fn finish_publish(
        &self,
        id: NodeId,
        len: u32,
        crc: u32,
        data: Option<&[u8]>,
    ) -> StoreResult<NodeId> {
        self.ot.stage_payload(id, len, crc);
        let epoch = self.mvcc.advance_epoch();
        let reserved = self.ot.mark_live_reserve(id, epoch)?;
        let staged = self
            .ot
            .get_by_handle(reserved.handle_index())
            .ok_or_else(|| StoreError::InvalidState("reserved handle vanished".into()))?;
        let rec = OtDeltaRec {
            handle_idx: reserved.handle_index(),
            tag: reserved.tag(),
            class_id: staged.class_id,
            kind: staged.kind as u8,
            file_id: staged.addr.file_id,
            segment_id: staged.addr.segment_id,
            offset: staged.addr.offset,
            length: len,
            data_crc: crc,
            birth_epoch: epoch,
            retire_epoch: RETIRE_LIVE,
        };
        let inline = match data {
            Some(bytes) if self.wants_inline_payload(len) => Some(bytes),
            _ => None,
        };
        if let Err(err) = self.append_delta(&rec, inline) {
            // WAL rejected the publish: roll the reservation back and
            // release the slot.
            self.ot.abort_reservation(reserved);
            let _ = self.alloc.free_addr(&staged.addr, staged.class_id);
            return Err(StoreError::Other(err));
        }
        self.ot.mark_live_commit(reserved, epoch)?;
        Ok(reserved)
    }

    /// Append, riding out a coordinator rotation of the active log.
    fn append_delta(&self, rec: &OtDeltaRec, payload: Option<&[u8]>) -> Result<()> {
        for _ in 0..200 {
            let log = self.active.get();
            let res = match payload {
                Some(p) => log.append_with_payload(rec, p),
                None => log.append_single(rec),
            };
            match res {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if log.is_closing() || !log.is_open() {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        bail!("active delta log unavailable (rotation stalled)")
    }

    // ---------------- Read ----------------

    /// Copy out a node's bytes. `None` for stale tags, reserved slots and
    /// payloads whose checksum does not match (never-flushed bytes after
    /// an EVENTUAL-mode crash).
    pub fn read_node(&self, id: NodeId) -> Option<Vec<u8>> {
        self.read_node_pinned(id).map(|p| p.bytes().to_vec())
    }

    /// Zero-copy read; the returned pin keeps the mapping alive.
    pub fn read_node_pinned(&self, id: NodeId) -> Option<PinnedRead> {
        let view = self.ot.try_get(id)?;
        if view.birth_epoch == 0 {
            return None;
        }
        let pin = self.alloc.pin(view.addr.file_id)?;
        let bytes = pin.bytes(view.addr.offset, view.addr.length).ok()?;
        if view.data_crc != 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(bytes);
            if hasher.finalize() != view.data_crc {
                tracing::debug!(
                    target: "xtstore::store",
                    "payload crc mismatch for {:?}; treating as not present", id
                );
                return None;
            }
        }
        Some(PinnedRead { pin, offset: view.addr.offset, len: view.addr.length })
    }

    /// Mutable access to the slot of a RESERVED node (zero-copy fill
    /// before `publish_node_in_place`).
    pub fn with_node_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut [u8]) -> R) -> StoreResult<R> {
        let view = self
            .ot
            .get_by_handle(id.handle_index())
            .ok_or_else(|| StoreError::InvalidState(format!("unknown handle {:?}", id)))?;
        if !view.is_reserved() {
            return Err(StoreError::InvalidState(format!("{:?} is not reserved", id)));
        }
        let mut addr = view.addr;
        addr.length = class_slot_bytes(view.class_id);
        self.alloc.with_slot_mut(&addr, f).map_err(StoreError::Other)
    }

    /// Slot capacity for an existing node.
    pub fn node_capacity(&self, id: NodeId) -> Option<u32> {
        self.ot.get_by_handle(id.handle_index()).map(|v| class_slot_bytes(v.class_id))
    }

    // ---------------- Lifecycle ----------------

    /// Stamp a retirement at `retire_epoch` and log it. Idempotent. The
    /// node stays readable for snapshots older than the retire epoch
    /// until the reclaimer passes.
    #[track_caller]
    pub fn retire_node(&self, id: NodeId, retire_epoch: u64, reason: RetireReason) -> bool {
        let caller = std::panic::Location::caller();
        if !self.ot.retire(id, retire_epoch) {
            return false;
        }
        let view = match self.ot.get_by_handle(id.handle_index()) {
            Some(v) => v,
            None => return false,
        };
        let rec = OtDeltaRec::from_view(id.handle_index(), &view);
        if let Err(err) = self.append_delta(&rec, None) {
            tracing::warn!(
                target: "xtstore::store",
                "retire delta for {:?} not logged: {err:#}", id
            );
        }
        tracing::debug!(
            target: "xtstore::store",
            "retire {:?} at epoch {} ({:?} from {}:{})",
            id, retire_epoch, reason, caller.file(), caller.line()
        );
        true
    }

    /// Free a node's handle and storage immediately, bypassing the epoch
    /// horizon. Only for in-place grow / rollback where no reader can
    /// hold the id.
    #[track_caller]
    pub fn free_node_immediate(&self, id: NodeId, reason: RetireReason) -> bool {
        let caller = std::panic::Location::caller();
        let view = match self.ot.get_by_handle(id.handle_index()) {
            Some(v) => v,
            None => return false,
        };
        let was_live = view.is_live();
        if was_live {
            // A published node must be marked dead in the WAL or recovery
            // would resurrect it.
            let epoch = self.mvcc.advance_epoch();
            if !self.ot.retire(id, epoch) {
                return false;
            }
            let retired = self.ot.get_by_handle(id.handle_index()).unwrap_or(view);
            let rec = OtDeltaRec::from_view(id.handle_index(), &retired);
            if let Err(err) = self.append_delta(&rec, None) {
                tracing::warn!(
                    target: "xtstore::store",
                    "immediate-free delta for {:?} not logged: {err:#}", id
                );
            }
            let retired_id = NodeId::from_parts(id.handle_index(), retired.tag);
            self.ot.force_reclaim(retired_id);
        } else if view.is_reserved() {
            if !self.ot.abort_reservation(id) {
                return false;
            }
            let _ = self.alloc.free_addr(&view.addr, view.class_id);
        } else {
            return false;
        }
        tracing::debug!(
            target: "xtstore::store",
            "free_immediate {:?} ({:?} from {}:{})", id, reason, caller.file(), caller.line()
        );
        true
    }

    // ---------------- Roots & durability ----------------

    /// Current root for `name` (empty = primary). The primary root reads
    /// from the superblock when it validates, falling back to the
    /// catalog.
    pub fn get_root(&self, name: &str) -> NodeId {
        if name.is_empty() {
            if let Some(snap) = self.superblock.load() {
                if snap.root.is_valid() {
                    return snap.root;
                }
            }
        }
        self.roots
            .read()
            .get(name)
            .map(|r| NodeId::from_raw(r.node_id_raw))
            .unwrap_or_else(NodeId::invalid)
    }

    /// Record `(id, epoch, mbr)` in the root catalog; the primary root is
    /// also published to the superblock through the coordinator.
    pub fn set_root(&self, id: NodeId, epoch: u64, mbr: &[f32], name: &str) -> StoreResult<()> {
        let entry = RootEntry {
            name: name.to_string(),
            node_id_raw: id.raw(),
            epoch,
            mbr: mbr.to_vec(),
        };
        {
            let mut manifest = self.manifest.lock();
            manifest.set_root(entry.clone());
            manifest.store().map_err(StoreError::Other)?;
        }
        self.roots.write().insert(name.to_string(), entry);
        if name.is_empty() {
            self.coordinator.try_publish(id, epoch)?;
        }
        Ok(())
    }

    /// Durability barrier per the configured mode.
    pub fn commit(&self, epoch: u64) -> StoreResult<()> {
        self.coordinator.commit(epoch)
    }

    // ---------------- Metadata ----------------

    /// Kind of a LIVE node.
    pub fn get_node_kind(&self, id: NodeId) -> Option<NodeKind> {
        let view = self.ot.try_get(id)?;
        if view.is_live() {
            Some(view.kind)
        } else {
            None
        }
    }

    /// True when the node is RESERVED or LIVE; `staged` reports the
    /// uncommitted case.
    pub fn is_node_present(&self, id: NodeId) -> (bool, bool) {
        if let Some(view) = self.ot.try_get(id) {
            if view.is_live() {
                return (true, false);
            }
        }
        if let Some(view) = self.ot.get_by_handle(id.handle_index()) {
            if view.is_reserved() {
                return (true, true);
            }
        }
        (false, false)
    }

    pub fn ot_stats(&self) -> crate::sharded::ShardStats {
        self.ot.aggregate_metrics()
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn segment_stats(&self) -> Vec<crate::segment::ClassStats> {
        self.alloc.all_stats()
    }

    /// Segments whose dead-byte ratio crossed the configured threshold.
    /// Compaction itself is driven externally and is optional.
    pub fn compaction_candidates(&self) -> Vec<crate::segment::CompactionCandidate> {
        self.alloc.compaction_candidates(self.cfg.compaction_threshold)
    }

    /// Stop the coordinator and flush everything. Called by `Drop` as
    /// well; explicit close surfaces errors.
    pub fn close(&self) -> Result<()> {
        self.coordinator.stop();
        let log = self.active.get();
        if log.is_open() {
            log.sync()?;
        }
        self.alloc.sync_all()?;
        let manifest = self.manifest.lock();
        manifest.store()?;
        Ok(())
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(target: "xtstore::store", "close on drop failed: {err:#}");
        }
    }
}

fn parse_log_seq(path: &str) -> Option<u64> {
    let name = Path::new(path).file_name()?.to_str()?;
    name.strip_prefix("delta_")?.strip_suffix(".log")?.parse().ok()
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
