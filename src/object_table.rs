//! Object table
//! ------------
//! Maps handle indices to [`OtEntry`] metadata cells. Entries live in
//! fixed-size slabs published into a preallocated outer table, so a cell
//! never moves once its slab is visible and readers resolve handles with
//! two atomic loads and no lock. Structural mutation (allocation, retire,
//! reclaim, slab growth) is serialized by one mutex per table; the sharded
//! wrapper in [`crate::sharded`] runs one table per shard.
//!
//! Publishing is two-phase. `allocate` hands out a RESERVED slot that is
//! invisible (`birth_epoch == 0`). `mark_live_reserve` decides the final
//! tag — bumping it when the slot had a prior life — and the caller must
//! log that id to the WAL before `mark_live_commit` stores the birth epoch
//! and release-publishes the tag. A failed WAL append is rolled back with
//! `abort_reservation`. Readers go through `try_get`, which validates the
//! tag under acquire ordering and returns `None` on any mismatch, making
//! handle reuse safe without blocking.
//!
//! The free list is an inline bitmap (bit = 1 means free) plus a small
//! LIFO cache refilled in batches by a word cursor, keeping both
//! allocation and the exact free count O(1) amortized.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::checkpoint::PersistentEntry;
use crate::config::object_table as ot_cfg;
use crate::delta_log::OtDeltaRec;
use crate::entry::{EntryView, OtAddr, OtEntry, RETIRE_LIVE};
use crate::error::{StoreError, StoreResult};
use crate::node_id::{NodeId, NodeKind, ShardBits};
use crate::segment::{class_slot_bytes, SegmentAllocator, NUM_CLASSES};

/// Counters for monitoring and tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtStats {
    pub total_allocations: u64,
    pub total_retires: u64,
    pub total_reclaims: u64,
    pub bytes_reclaimed: u64,
    pub free_handles: u64,
    pub retired_handles: u64,
    pub max_handle: u64,
    pub last_reclaim_count: u64,
    pub reclaims_per_class: [u64; NUM_CLASSES],
    pub bytes_per_class: [u64; NUM_CLASSES],
}

struct AllocState {
    /// Handles already claimed off the bitmap, ready to hand out (LIFO).
    free_cache: Vec<u64>,
    /// Handles stamped with a finite retire epoch, awaiting reclaim.
    retired: Vec<u64>,
    /// Highest handle ever issued; 0 means none (handle 0 is reserved).
    max_handle: u64,
    /// bit = 1 means the handle is FREE and not in the cache.
    free_bitmap: Vec<u64>,
    free_count: u64,
    /// Word cursor for cache refill.
    scan_cursor: usize,
    recovery_mode: bool,
    stats: OtStats,
}

pub struct ObjectTable {
    entries_per_slab: usize,
    slab_shift: u32,
    slab_mask: u64,
    slabs: Box<[OnceCell<Box<[OtEntry]>>]>,
    slab_count: AtomicU32,
    state: Mutex<AllocState>,
    allocator: OnceCell<Arc<SegmentAllocator>>,
}

#[inline]
fn bump_tag(t: u16) -> u16 {
    let n = t.wrapping_add(1);
    if n == 0 {
        1
    } else {
        n
    }
}

fn compute_entries_per_slab() -> usize {
    let target = ot_cfg::slab_target_bytes_from_env();
    let entries = (target / std::mem::size_of::<OtEntry>()).max(64);
    // Round down to a power of two for shift/mask addressing.
    1usize << (usize::BITS - 1 - entries.leading_zeros())
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectTable {
    pub fn new() -> ObjectTable {
        let entries_per_slab = compute_entries_per_slab();
        let slabs: Box<[OnceCell<Box<[OtEntry]>>]> =
            (0..ot_cfg::MAX_SLABS).map(|_| OnceCell::new()).collect();
        ObjectTable {
            entries_per_slab,
            slab_shift: entries_per_slab.trailing_zeros(),
            slab_mask: entries_per_slab as u64 - 1,
            slabs,
            slab_count: AtomicU32::new(0),
            state: Mutex::new(AllocState {
                free_cache: Vec::new(),
                retired: Vec::new(),
                max_handle: 0,
                free_bitmap: Vec::new(),
                free_count: 0,
                scan_cursor: 0,
                recovery_mode: false,
                stats: OtStats::default(),
            }),
            allocator: OnceCell::new(),
        }
    }

    /// Wire the segment allocator so reclaim can return payload space.
    pub fn set_segment_allocator(&self, alloc: Arc<SegmentAllocator>) {
        let _ = self.allocator.set(alloc);
    }

    pub fn entries_per_slab(&self) -> usize {
        self.entries_per_slab
    }

    pub fn slab_count(&self) -> usize {
        self.slab_count.load(Ordering::Acquire) as usize
    }

    /// Lock-free cell lookup. Accepts local or global handles by masking
    /// off the shard bits.
    #[inline]
    fn cell(&self, handle: u64) -> Option<&OtEntry> {
        let local = ShardBits::local_from_handle_idx(handle);
        let slab_idx = (local >> self.slab_shift) as usize;
        if slab_idx >= self.slab_count.load(Ordering::Acquire) as usize {
            return None;
        }
        let slab = self.slabs[slab_idx].get()?;
        Some(&slab[(local & self.slab_mask) as usize])
    }

    // ---------------- Allocation ----------------

    /// Reserve a handle bound to `addr`. With `birth_epoch == 0` the slot
    /// stays invisible until the two-phase publish completes; a nonzero
    /// birth publishes immediately (single-phase path for rebuilds and
    /// tooling). Returns [`NodeId::invalid`] on exhaustion.
    pub fn allocate(&self, kind: NodeKind, class_id: u8, addr: OtAddr, birth_epoch: u64) -> NodeId {
        debug_assert!(kind != NodeKind::Invalid);
        let mut st = self.state.lock();
        let h = match self.acquire_handle_locked(&mut st) {
            Some(h) => h,
            None => return NodeId::invalid(),
        };
        st.stats.total_allocations += 1;
        let entry = self.cell(h).expect("acquired handle has a published slab");
        entry.store_metadata(addr, class_id, kind);
        entry.set_data_crc(0);
        entry.set_retire_epoch(RETIRE_LIVE);
        if birth_epoch > 0 {
            let tag = bump_tag(entry.tag_relaxed());
            entry.set_birth_epoch(birth_epoch);
            entry.publish_tag(tag);
            NodeId::from_parts(h, tag)
        } else {
            entry.set_birth_epoch(0);
            // Keep the old tag unpublished; the proposed id carries it so
            // reserve can detect a prior life. from_parts promotes 0 to 1.
            NodeId::from_parts(h, entry.tag_relaxed())
        }
    }

    /// Decide the final tag for a RESERVED slot. The returned id is what
    /// must go into the WAL; it differs from `proposed` whenever the
    /// handle was used in a prior life.
    pub fn mark_live_reserve(&self, proposed: NodeId, _birth_epoch: u64) -> StoreResult<NodeId> {
        let _st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(proposed.handle_index());
        let entry = self
            .cell(h)
            .ok_or_else(|| StoreError::InvalidState(format!("reserve of unknown handle {}", h)))?;
        let view = entry.view();
        if !view.is_reserved() {
            return Err(StoreError::InvalidState(format!(
                "reserve of handle {} in non-reserved state (birth={}, kind={:?})",
                h, view.birth_epoch, view.kind
            )));
        }
        let stored = view.tag;
        let final_tag = if stored == 0 { proposed.tag() } else { bump_tag(stored) };
        Ok(NodeId::from_parts(h, final_tag))
    }

    /// Publish a reserved slot at `birth_epoch`. Call only after the WAL
    /// durably holds the reservation under `final_id`'s tag.
    pub fn mark_live_commit(&self, final_id: NodeId, birth_epoch: u64) -> StoreResult<()> {
        let _st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(final_id.handle_index());
        let entry = self
            .cell(h)
            .ok_or_else(|| StoreError::InvalidState(format!("commit of unknown handle {}", h)))?;
        let view = entry.view();
        if !view.is_reserved() {
            return Err(StoreError::InvalidState(format!(
                "commit of handle {} in non-reserved state",
                h
            )));
        }
        entry.set_birth_epoch(birth_epoch);
        entry.publish_tag(final_id.tag());
        Ok(())
    }

    /// Record the published length and payload checksum on a RESERVED
    /// slot before its delta is built. Readers later use the checksum to
    /// reject never-flushed bytes.
    pub fn stage_payload(&self, id: NodeId, len: u32, crc: u32) -> bool {
        let _st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(id.handle_index());
        match self.cell(h) {
            Some(e) if e.view().is_reserved() => {
                let mut addr = e.addr();
                addr.length = len;
                e.store_metadata(addr, e.class_id(), e.kind());
                e.set_data_crc(crc);
                true
            }
            _ => false,
        }
    }

    /// Reclaim one retired handle right now, bypassing the epoch horizon.
    /// Only for rollback paths where no reader can hold the id.
    pub fn force_reclaim(&self, id: NodeId) -> bool {
        let mut st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(id.handle_index());
        let entry = match self.cell(h) {
            Some(e) => e,
            None => return false,
        };
        if entry.tag_relaxed() != id.tag() || !entry.is_retired() {
            return false;
        }
        let view = entry.view();
        if let Some(alloc) = self.allocator.get() {
            if view.addr.length > 0 {
                let _ = alloc.free_addr(&view.addr, view.class_id);
            }
        }
        entry.clear_to_free();
        if let Some(pos) = st.retired.iter().position(|&r| r == h) {
            st.retired.swap_remove(pos);
        }
        Self::bm_set(&mut st, h);
        st.stats.total_reclaims += 1;
        true
    }

    /// Roll back a reservation whose WAL append failed. Restores FREE,
    /// bumps the tag so the aborted id can never validate, and returns the
    /// handle to the free cache. Does not free segment storage.
    pub fn abort_reservation(&self, id: NodeId) -> bool {
        let mut st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(id.handle_index());
        let entry = match self.cell(h) {
            Some(e) => e,
            None => return false,
        };
        if !entry.view().is_reserved() {
            tracing::debug!(
                target: "xtstore::ot",
                "abort_reservation on handle {} in non-reserved state", h
            );
            return false;
        }
        let bumped = bump_tag(entry.tag_relaxed());
        entry.clear_to_free();
        entry.set_retire_epoch(RETIRE_LIVE);
        entry.publish_tag(bumped);
        st.free_cache.push(h);
        true
    }

    /// Stamp a finite retire epoch. Idempotent; a stale tag is a no-op.
    /// The handle stays resolvable (not live) until reclaim.
    pub fn retire(&self, id: NodeId, retire_epoch: u64) -> bool {
        let mut st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(id.handle_index());
        let entry = match self.cell(h) {
            Some(e) => e,
            None => return false,
        };
        if entry.tag_relaxed() != id.tag() {
            return false;
        }
        if entry.is_retired() {
            return true;
        }
        if !entry.is_live() {
            return false;
        }
        entry.set_retire_epoch(retire_epoch);
        st.retired.push(h);
        st.stats.total_retires += 1;
        true
    }

    // ---------------- Reads ----------------

    /// Tag-validated read; `None` on mismatch or unknown handle. Lock-free.
    pub fn try_get(&self, id: NodeId) -> Option<EntryView> {
        self.cell(id.handle_index())?.try_view(id.tag())
    }

    /// Tag check only, acquire-ordered.
    pub fn validate_tag(&self, id: NodeId) -> bool {
        match self.cell(id.handle_index()) {
            Some(e) => e.tag_acquire() == id.tag(),
            None => false,
        }
    }

    /// Liveness of the slot named by `id`'s handle, regardless of tag.
    pub fn is_valid(&self, id: NodeId) -> bool {
        self.cell(id.handle_index()).is_some_and(|e| e.is_live())
    }

    /// Unvalidated view by handle (publish flow, checkpointing). `None`
    /// for handles past the published slabs.
    pub fn get_by_handle(&self, handle: u64) -> Option<EntryView> {
        self.cell(handle).map(|e| e.view())
    }

    // ---------------- Reclaim ----------------

    /// Free handles retired strictly before `safe_epoch`: segment space
    /// goes back to the allocator, the slot returns to FREE (tag intact;
    /// the next reserve bumps it), the handle returns to the bitmap.
    pub fn reclaim_before_epoch(&self, safe_epoch: u64) -> usize {
        let mut st = self.state.lock();
        let retired = std::mem::take(&mut st.retired);
        let mut kept = Vec::with_capacity(retired.len());
        let mut freed = 0usize;
        for h in retired {
            if h == 0 {
                continue;
            }
            let entry = match self.cell(h) {
                Some(e) => e,
                None => continue,
            };
            let view = entry.view();
            if !view.is_retired() || view.retire_epoch >= safe_epoch {
                kept.push(h);
                continue;
            }
            if let Some(alloc) = self.allocator.get() {
                if view.addr.length > 0 {
                    if let Err(err) = alloc.free_addr(&view.addr, view.class_id) {
                        tracing::warn!(
                            target: "xtstore::ot",
                            "reclaim of handle {} could not free segment space: {err:#}", h
                        );
                    }
                }
            }
            entry.clear_to_free();
            Self::bm_set(&mut st, h);
            let class = (view.class_id as usize).min(NUM_CLASSES - 1);
            st.stats.reclaims_per_class[class] += 1;
            st.stats.bytes_per_class[class] += class_slot_bytes(view.class_id.min(NUM_CLASSES as u8 - 1)) as u64;
            st.stats.bytes_reclaimed += view.addr.length as u64;
            freed += 1;
        }
        st.retired = kept;
        st.stats.total_reclaims += freed as u64;
        st.stats.last_reclaim_count = freed as u64;
        freed
    }

    // ---------------- Recovery ----------------

    /// Switch to recovery mode: deltas install entries at explicit handle
    /// indices and no new handles are issued.
    pub fn begin_recovery(&self) {
        self.state.lock().recovery_mode = true;
    }

    /// Leave recovery mode and rebuild the free bitmap from entry state.
    pub fn end_recovery(&self) {
        let mut st = self.state.lock();
        st.recovery_mode = false;
        st.free_cache.clear();
        for w in st.free_bitmap.iter_mut() {
            *w = 0;
        }
        st.free_count = 0;
        st.scan_cursor = 0;
        for h in 1..=st.max_handle {
            if self.cell(h).is_some_and(|e| e.is_free()) {
                Self::bm_set(&mut st, h);
            }
        }
    }

    /// Install a checkpoint entry at its exact handle index.
    pub fn restore_handle(&self, handle_idx: u64, pe: &PersistentEntry) {
        let mut st = self.state.lock();
        let h = ShardBits::local_from_handle_idx(handle_idx);
        if h == 0 {
            // Handle 0 is reserved; an entry naming it is hostile input.
            return;
        }
        if self.ensure_handle_locked(&mut st, h).is_err() {
            tracing::error!(target: "xtstore::ot", "restore_handle {} exceeds table capacity", h);
            return;
        }
        let entry = self.cell(h).expect("slab ensured");
        self.install_locked(&mut st, entry, h, pe);
    }

    /// Apply one WAL delta during replay. Installs or updates the handle;
    /// retire records move it to the retired list.
    pub fn apply_delta(&self, rec: &OtDeltaRec) {
        let mut st = self.state.lock();
        debug_assert!(st.recovery_mode, "apply_delta outside recovery mode");
        let h = ShardBits::local_from_handle_idx(rec.handle_idx);
        if h == 0 {
            return;
        }
        if self.ensure_handle_locked(&mut st, h).is_err() {
            tracing::error!(target: "xtstore::ot", "apply_delta {} exceeds table capacity", h);
            return;
        }
        let entry = self.cell(h).expect("slab ensured");
        self.install_locked(&mut st, entry, h, rec);
    }

    fn install_locked(&self, st: &mut AllocState, entry: &OtEntry, h: u64, rec: &OtDeltaRec) {
        let kind = NodeKind::from_u8(rec.kind).unwrap_or(NodeKind::Invalid);
        let was_retired = entry.is_retired();
        entry.store_metadata(
            OtAddr {
                file_id: rec.file_id,
                segment_id: rec.segment_id,
                offset: rec.offset,
                length: rec.length,
            },
            rec.class_id,
            kind,
        );
        entry.set_data_crc(rec.data_crc);
        entry.set_birth_epoch(rec.birth_epoch);
        entry.set_retire_epoch(rec.retire_epoch);
        entry.publish_tag(rec.tag);
        Self::bm_clear(st, h);
        st.max_handle = st.max_handle.max(h);
        if rec.retire_epoch != RETIRE_LIVE && !was_retired {
            st.retired.push(h);
        }
    }

    // ---------------- Snapshot ----------------

    /// Copy every LIVE entry under the lock. Handles are local; the
    /// sharded wrapper rewrites them to global form.
    pub fn iterate_live_snapshot(&self, out: &mut Vec<PersistentEntry>) -> usize {
        let st = self.state.lock();
        let before = out.len();
        let est = (st.max_handle as usize)
            .saturating_sub(st.free_count as usize + st.retired.len());
        out.reserve(est);
        for h in 1..=st.max_handle {
            let entry = match self.cell(h) {
                Some(e) => e,
                None => continue,
            };
            let view = entry.view();
            if !view.is_live() {
                continue;
            }
            out.push(OtDeltaRec::from_view(h, &view));
        }
        out.len() - before
    }

    pub fn stats(&self) -> OtStats {
        let st = self.state.lock();
        let mut s = st.stats;
        s.free_handles = st.free_count + st.free_cache.len() as u64;
        s.retired_handles = st.retired.len() as u64;
        s.max_handle = st.max_handle;
        s
    }

    // ---------------- Free-list internals (lock held) ----------------

    fn bm_set(st: &mut AllocState, h: u64) {
        let word = (h >> 6) as usize;
        if word >= st.free_bitmap.len() {
            st.free_bitmap.resize(word + 1, 0);
        }
        let mask = 1u64 << (h & 63);
        if st.free_bitmap[word] & mask == 0 {
            st.free_bitmap[word] |= mask;
            st.free_count += 1;
        }
    }

    fn bm_clear(st: &mut AllocState, h: u64) {
        let word = (h >> 6) as usize;
        if word >= st.free_bitmap.len() {
            return;
        }
        let mask = 1u64 << (h & 63);
        if st.free_bitmap[word] & mask != 0 {
            st.free_bitmap[word] &= !mask;
            st.free_count -= 1;
        }
    }

    /// Refill the LIFO cache from the bitmap, clearing the bits claimed.
    fn refill_free_cache_locked(&self, st: &mut AllocState, target: usize) {
        if st.free_count == 0 {
            return;
        }
        let words = st.free_bitmap.len();
        let mut scanned = 0usize;
        while st.free_cache.len() < target && scanned < words {
            let w = st.scan_cursor % words;
            let mut bits = st.free_bitmap[w];
            while bits != 0 && st.free_cache.len() < target {
                let bit = bits.trailing_zeros() as u64;
                bits &= bits - 1;
                let h = (w as u64) << 6 | bit;
                st.free_bitmap[w] &= !(1u64 << bit);
                st.free_count -= 1;
                st.free_cache.push(h);
            }
            if bits == 0 {
                st.scan_cursor = (w + 1) % words;
                scanned += 1;
            }
        }
    }

    fn acquire_handle_locked(&self, st: &mut AllocState) -> Option<u64> {
        if st.free_cache.is_empty() {
            self.refill_free_cache_locked(st, ot_cfg::FREE_CACHE_BATCH);
        }
        if let Some(h) = st.free_cache.pop() {
            return Some(h);
        }
        // Virgin growth path.
        let next = st.max_handle + 1;
        if self.ensure_handle_locked(st, next).is_err() {
            return None;
        }
        st.max_handle = next;
        Some(next)
    }

    /// Make sure the slab covering `h` is published (and the bitmap is
    /// wide enough). Errors when the fixed outer table is full.
    fn ensure_handle_locked(&self, st: &mut AllocState, h: u64) -> Result<(), ()> {
        let slab_idx = (h >> self.slab_shift) as usize;
        if slab_idx >= ot_cfg::MAX_SLABS {
            return Err(());
        }
        while self.slab_count.load(Ordering::Relaxed) as usize <= slab_idx {
            let idx = self.slab_count.load(Ordering::Relaxed) as usize;
            let slab: Box<[OtEntry]> =
                (0..self.entries_per_slab).map(|_| OtEntry::default()).collect();
            // Only the growth path (under the lock) ever sets a slot.
            let _ = self.slabs[idx].set(slab);
            self.slab_count.store(idx as u32 + 1, Ordering::Release);
        }
        let total = self.slab_count.load(Ordering::Relaxed) as u64 * self.entries_per_slab as u64;
        let words = (total as usize).div_ceil(64);
        if st.free_bitmap.len() < words {
            st.free_bitmap.resize(words, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "object_table_tests.rs"]
mod object_table_tests;
