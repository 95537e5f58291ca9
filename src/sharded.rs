//! Sharded object table
//! --------------------
//! Hosts up to 64 independent [`ObjectTable`] shards to eliminate lock
//! contention. The shard id rides in bits [47:42] of the global handle
//! index, so every operation on an existing id routes directly by bit
//! extraction with no extra locking. Allocation starts on shard 0 and
//! activates further shards progressively as traffic grows; at small
//! scale the table behaves exactly like a single ObjectTable.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::checkpoint::PersistentEntry;
use crate::delta_log::OtDeltaRec;
use crate::entry::{EntryView, OtAddr};
use crate::error::{StoreError, StoreResult};
use crate::node_id::{NodeId, NodeKind, ShardBits};
use crate::object_table::{ObjectTable, OtStats};
use crate::segment::SegmentAllocator;

pub const DEFAULT_NUM_SHARDS: usize = 8;
pub const MAX_SHARDS: usize = 64;
const DEFAULT_ACTIVATION_STEP: u32 = 1024;

/// Copyable per-shard counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    pub allocations: u64,
    pub retirements: u64,
    pub reclaims: u64,
    pub validations: u64,
    pub active_handles: u64,
    pub free_handles: u64,
}

#[derive(Default)]
struct ShardStatsAtomic {
    allocations: AtomicU64,
    retirements: AtomicU64,
    reclaims: AtomicU64,
    validations: AtomicU64,
}

struct Shard {
    table: ObjectTable,
    stats: ShardStatsAtomic,
}

pub struct ObjectTableSharded {
    shards: Vec<Shard>,
    num_shards: usize,
    active_shards: AtomicUsize,
    round_robin: AtomicUsize,
    activation_step: AtomicU32,
}

impl Default for ObjectTableSharded {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_SHARDS)
    }
}

impl ObjectTableSharded {
    /// `num_shards` is clamped to `[1, 64]` and rounded up to a power of
    /// two so shard selection can mask.
    pub fn new(num_shards: usize) -> ObjectTableSharded {
        let n = num_shards.clamp(1, MAX_SHARDS).next_power_of_two().min(MAX_SHARDS);
        let shards = (0..n)
            .map(|_| Shard { table: ObjectTable::new(), stats: ShardStatsAtomic::default() })
            .collect();
        ObjectTableSharded {
            shards,
            num_shards: n,
            active_shards: AtomicUsize::new(1),
            round_robin: AtomicUsize::new(0),
            activation_step: AtomicU32::new(DEFAULT_ACTIVATION_STEP),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn active_shards(&self) -> usize {
        self.active_shards.load(Ordering::Acquire)
    }

    /// Tune the activation cadence (tests use `u32::MAX` to pin one shard).
    pub fn set_activation_step(&self, step: u32) {
        self.activation_step.store(step.max(1), Ordering::Relaxed);
    }

    pub fn set_segment_allocator(&self, alloc: Arc<SegmentAllocator>) {
        for s in &self.shards {
            s.table.set_segment_allocator(Arc::clone(&alloc));
        }
    }

    #[inline]
    fn shard_of(&self, id: NodeId) -> usize {
        let s = ShardBits::shard_from_handle_idx(id.handle_index()) as usize;
        s.min(self.num_shards - 1)
    }

    fn select_shard_for_allocation(&self) -> usize {
        let ticket = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let step = self.activation_step.load(Ordering::Relaxed) as usize;
        if step > 0 && ticket % step == 0 {
            let desired = (1 + ticket / step).min(self.num_shards);
            let mut cur = self.active_shards.load(Ordering::Relaxed);
            while cur < desired {
                match self.active_shards.compare_exchange_weak(
                    cur,
                    desired,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(c) => cur = c,
                }
            }
        }
        let active = self.active_shards.load(Ordering::Acquire).max(1);
        if active == 1 {
            0
        } else {
            ticket % active
        }
    }

    /// Allocate a RESERVED slot; the returned id is always global, even on
    /// shard 0, so handles stay uniform.
    pub fn allocate(&self, kind: NodeKind, class_id: u8, addr: OtAddr, birth_epoch: u64) -> NodeId {
        let s = self.select_shard_for_allocation();
        let local = self.shards[s].table.allocate(kind, class_id, addr, birth_epoch);
        if !local.is_valid() {
            return NodeId::invalid();
        }
        self.shards[s].stats.allocations.fetch_add(1, Ordering::Relaxed);
        ShardBits::to_global(s as u32, local)
    }

    pub fn mark_live_reserve(&self, global: NodeId, birth_epoch: u64) -> StoreResult<NodeId> {
        let s = self.shard_of(global);
        let local = self.shards[s]
            .table
            .mark_live_reserve(ShardBits::to_local(global), birth_epoch)?;
        Ok(ShardBits::to_global(s as u32, local))
    }

    pub fn mark_live_commit(&self, global_final: NodeId, birth_epoch: u64) -> StoreResult<()> {
        let s = self.shard_of(global_final);
        self.shards[s]
            .table
            .mark_live_commit(ShardBits::to_local(global_final), birth_epoch)
    }

    pub fn stage_payload(&self, global: NodeId, len: u32, crc: u32) -> bool {
        let s = self.shard_of(global);
        self.shards[s].table.stage_payload(ShardBits::to_local(global), len, crc)
    }

    /// Targeted reclaim for rollback paths; bypasses the epoch horizon.
    pub fn force_reclaim(&self, global: NodeId) -> bool {
        let s = self.shard_of(global);
        self.shards[s].table.force_reclaim(ShardBits::to_local(global))
    }

    pub fn abort_reservation(&self, global: NodeId) -> bool {
        let s = self.shard_of(global);
        let ok = self.shards[s].table.abort_reservation(ShardBits::to_local(global));
        if !ok {
            tracing::debug!(
                target: "xtstore::ot",
                "abort_reservation failed: shard={} id={:?}", s, global
            );
        }
        ok
    }

    pub fn retire(&self, id: NodeId, retire_epoch: u64) -> bool {
        let s = self.shard_of(id);
        let ok = self.shards[s].table.retire(ShardBits::to_local(id), retire_epoch);
        if ok {
            self.shards[s].stats.retirements.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn try_get(&self, id: NodeId) -> Option<EntryView> {
        let s = self.shard_of(id);
        self.shards[s].table.try_get(ShardBits::to_local(id))
    }

    pub fn validate_tag(&self, id: NodeId) -> bool {
        let s = self.shard_of(id);
        self.shards[s].stats.validations.fetch_add(1, Ordering::Relaxed);
        self.shards[s].table.validate_tag(ShardBits::to_local(id))
    }

    pub fn is_valid(&self, id: NodeId) -> bool {
        let s = self.shard_of(id);
        self.shards[s].table.is_valid(ShardBits::to_local(id))
    }

    /// Unvalidated view by global handle index.
    pub fn get_by_handle(&self, handle_idx: u64) -> Option<EntryView> {
        let s = (ShardBits::shard_from_handle_idx(handle_idx) as usize).min(self.num_shards - 1);
        self.shards[s]
            .table
            .get_by_handle(ShardBits::local_from_handle_idx(handle_idx))
    }

    /// Reclaim across all shards in parallel.
    pub fn reclaim_before_epoch(&self, safe_epoch: u64) -> usize {
        let total: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| scope.spawn(move || shard.table.reclaim_before_epoch(safe_epoch)))
                .collect();
            handles.into_iter().map(|h| h.join().expect("shard reclaim panicked")).sum()
        });
        if total > 0 {
            for s in &self.shards {
                s.stats
                    .reclaims
                    .store(s.table.stats().total_reclaims, Ordering::Relaxed);
            }
        }
        total
    }

    // ---------------- Recovery ----------------

    pub fn begin_recovery(&self) {
        for s in &self.shards {
            s.table.begin_recovery();
        }
    }

    pub fn end_recovery(&self) {
        for s in &self.shards {
            s.table.end_recovery();
        }
    }

    /// Restore a checkpoint entry; the handle in `pe` is global and routes
    /// to its shard.
    pub fn restore_handle(&self, handle_idx: u64, pe: &PersistentEntry) {
        let s = (ShardBits::shard_from_handle_idx(handle_idx) as usize).min(self.num_shards - 1);
        self.shards[s]
            .table
            .restore_handle(ShardBits::local_from_handle_idx(handle_idx), pe);
    }

    /// Route a replayed delta to its shard.
    pub fn apply_delta(&self, rec: &OtDeltaRec) {
        let s = (ShardBits::shard_from_handle_idx(rec.handle_idx) as usize).min(self.num_shards - 1);
        let mut local = *rec;
        local.handle_idx = ShardBits::local_from_handle_idx(rec.handle_idx);
        self.shards[s].table.apply_delta(&local);
    }

    // ---------------- Snapshot & stats ----------------

    /// Concatenate per-shard snapshots, rewriting each local handle to its
    /// global form. Each shard is snapped under its own lock; a
    /// crash-consistent checkpoint pairs this with WAL fencing.
    pub fn iterate_live_snapshot(&self, out: &mut Vec<PersistentEntry>) -> usize {
        out.clear();
        let mut total = 0usize;
        let mut shard_buf = Vec::new();
        for (s, shard) in self.shards.iter().enumerate() {
            shard_buf.clear();
            total += shard.table.iterate_live_snapshot(&mut shard_buf);
            for mut pe in shard_buf.drain(..) {
                pe.handle_idx = ShardBits::make_global_handle_idx(s as u32, pe.handle_idx);
                out.push(pe);
            }
        }
        total
    }

    pub fn shard_metrics(&self, shard_idx: usize) -> StoreResult<ShardStats> {
        if shard_idx >= self.num_shards {
            return Err(StoreError::InvalidState(format!("shard index {} out of range", shard_idx)));
        }
        let shard = &self.shards[shard_idx];
        let ot: OtStats = shard.table.stats();
        Ok(ShardStats {
            allocations: shard.stats.allocations.load(Ordering::Relaxed),
            retirements: shard.stats.retirements.load(Ordering::Relaxed),
            reclaims: shard.stats.reclaims.load(Ordering::Relaxed),
            validations: shard.stats.validations.load(Ordering::Relaxed),
            active_handles: ot
                .max_handle
                .saturating_sub(ot.free_handles + ot.retired_handles),
            free_handles: ot.free_handles,
        })
    }

    pub fn aggregate_metrics(&self) -> ShardStats {
        let mut agg = ShardStats::default();
        for i in 0..self.num_shards {
            let s = self.shard_metrics(i).expect("index in range");
            agg.allocations += s.allocations;
            agg.retirements += s.retirements;
            agg.reclaims += s.reclaims;
            agg.validations += s.validations;
            agg.active_handles += s.active_handles;
            agg.free_handles += s.free_handles;
        }
        agg
    }
}

#[cfg(test)]
#[path = "sharded_tests.rs"]
mod sharded_tests;
