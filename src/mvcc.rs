//! MVCC epoch context
//! ------------------
//! A monotonic 64-bit epoch clock plus a registry of open reader
//! snapshots. Writers stamp births and retirements with fresh epochs;
//! reclamation uses `min_active_epoch` as the safe horizon: nothing
//! retired at or after it may be freed while a reader could still
//! traverse it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct MvccContext {
    epoch: AtomicU64,
    // epoch -> open reader count; BTreeMap keeps the minimum at the front.
    readers: Mutex<BTreeMap<u64, u32>>,
}

impl Default for MvccContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccContext {
    pub fn new() -> Self {
        MvccContext {
            epoch: AtomicU64::new(1),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resume the clock at `epoch` after recovery. Never moves backwards.
    pub fn resume_at(&self, epoch: u64) {
        self.epoch.fetch_max(epoch, Ordering::AcqRel);
    }

    /// Current epoch without advancing.
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Mint a fresh epoch, strictly greater than all previously returned.
    #[inline]
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Open a reader snapshot at the current epoch. The returned guard
    /// holds the epoch in the registry until dropped.
    pub fn begin_snapshot(self: &Arc<Self>) -> SnapshotGuard {
        let epoch = self.current_epoch();
        self.readers.lock().entry(epoch).and_modify(|c| *c += 1).or_insert(1);
        SnapshotGuard { ctx: Arc::clone(self), epoch }
    }

    /// Lowest epoch held by any open snapshot, or the current epoch when no
    /// reader is registered.
    pub fn min_active_epoch(&self) -> u64 {
        let readers = self.readers.lock();
        readers
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current_epoch())
    }

    fn unregister(&self, epoch: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&epoch);
            }
        }
    }
}

/// RAII registration of one reader snapshot.
pub struct SnapshotGuard {
    ctx: Arc<MvccContext>,
    epoch: u64,
}

impl SnapshotGuard {
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.ctx.unregister(self.epoch);
    }
}
