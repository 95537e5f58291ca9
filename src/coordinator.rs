//! Checkpoint coordinator
//! ----------------------
//! The single background thread that enforces durability policy. It
//! triggers checkpoints (replay-size, age, query-only age, or explicit
//! request), rotates the active delta log, prunes subsumed logs, drives
//! reclamation, and serves `try_publish` — the writers' commit point —
//! with optional group commit: the first caller becomes the leader,
//! coalesces pending publishes over a small window, and fsyncs once for
//! the whole batch.
//!
//! The coordinator is the only component allowed to close or rotate the
//! active delta log or swap the shared active-log pointer.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::write_checkpoint;
use crate::config::{CheckpointPolicy, DurabilityMode};
use crate::delta_log::OtDeltaLog;
use crate::error::{StoreError, StoreResult};
use crate::manifest::{CheckpointInfo, DataFileInfo, DeltaLogInfo, Manifest};
use crate::mvcc::MvccContext;
use crate::node_id::NodeId;
use crate::reclaim::Reclaimer;
use crate::segment::SegmentAllocator;
use crate::sharded::ObjectTableSharded;
use crate::superblock::Superblock;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Appends within this window count as "write activity" for the
/// burst-vs-steady replay threshold.
const WRITE_ACTIVITY_WINDOW: Duration = Duration::from_secs(1);

/// Shared pointer to the active delta log. Writers clone it per append;
/// only the coordinator swaps it.
pub struct ActiveLog {
    inner: RwLock<Arc<OtDeltaLog>>,
}

impl ActiveLog {
    pub fn new(log: Arc<OtDeltaLog>) -> ActiveLog {
        ActiveLog { inner: RwLock::new(log) }
    }

    pub fn get(&self) -> Arc<OtDeltaLog> {
        Arc::clone(&self.inner.read())
    }

    fn swap(&self, log: Arc<OtDeltaLog>) -> Arc<OtDeltaLog> {
        std::mem::replace(&mut *self.inner.write(), log)
    }
}

pub fn delta_log_name(seq: u64) -> String {
    format!("logs/delta_{:06}.log", seq)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub checkpoints_written: u64,
    pub rotations: u64,
    pub publishes: u64,
    pub group_commit_batches: u64,
    pub last_replay_bytes: u64,
    pub last_checkpoint_epoch: u64,
    pub reclaimed_handles: u64,
}

pub type MetricsCallback = Box<dyn Fn(&CoordinatorStats) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

struct CoordState {
    last_checkpoint_at: Instant,
    last_checkpoint_epoch: u64,
    /// Bytes in logs closed since the last checkpoint.
    closed_bytes: u64,
    /// Active-log offset at the last checkpoint (same log generation).
    active_baseline: u64,
    last_seen_offset: u64,
    last_write_at: Instant,
    checkpoint_requested: bool,
    next_log_seq: u64,
    eventual_dirty: bool,
}

struct GroupState {
    leader_active: bool,
    pending_root: NodeId,
    pending_epoch: u64,
    has_pending: bool,
    /// Highest epoch durably published by any batch so far.
    published_epoch: u64,
    last_error: Option<String>,
}

struct Shared {
    dir: PathBuf,
    policy: CheckpointPolicy,
    ot: Arc<ObjectTableSharded>,
    superblock: Arc<Superblock>,
    manifest: Arc<Mutex<Manifest>>,
    active_log: Arc<ActiveLog>,
    alloc: Arc<SegmentAllocator>,
    mvcc: Arc<MvccContext>,
    reclaimer: Option<Reclaimer>,
    state: Mutex<CoordState>,
    wake_mu: Mutex<()>,
    wake_cv: Condvar,
    stop: AtomicBool,
    stats: Mutex<CoordinatorStats>,
    group_mu: Mutex<GroupState>,
    group_cv: Condvar,
    metrics_cb: Mutex<Option<MetricsCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
}

pub struct CheckpointCoordinator {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CheckpointCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: PathBuf,
        ot: Arc<ObjectTableSharded>,
        superblock: Arc<Superblock>,
        manifest: Arc<Mutex<Manifest>>,
        active_log: Arc<ActiveLog>,
        alloc: Arc<SegmentAllocator>,
        mvcc: Arc<MvccContext>,
        policy: CheckpointPolicy,
        reclaimer: Option<Reclaimer>,
        next_log_seq: u64,
    ) -> CheckpointCoordinator {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            dir,
            policy,
            ot,
            superblock,
            manifest,
            active_log,
            alloc,
            mvcc,
            reclaimer,
            state: Mutex::new(CoordState {
                last_checkpoint_at: now,
                last_checkpoint_epoch: 0,
                closed_bytes: 0,
                active_baseline: 0,
                last_seen_offset: 0,
                last_write_at: now,
                checkpoint_requested: false,
                next_log_seq,
                eventual_dirty: false,
            }),
            wake_mu: Mutex::new(()),
            wake_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            stats: Mutex::new(CoordinatorStats::default()),
            group_mu: Mutex::new(GroupState {
                leader_active: false,
                pending_root: NodeId::invalid(),
                pending_epoch: 0,
                has_pending: false,
                published_epoch: 0,
                last_error: None,
            }),
            group_cv: Condvar::new(),
            metrics_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        });
        CheckpointCoordinator { shared, thread: Mutex::new(None) }
    }

    /// Seed the trigger state after recovery: a large replay means the
    /// checkpoint is stale, so request one eagerly.
    pub fn initialize_after_recovery(&self, last_epoch: u64, replay_bytes: u64) {
        let mut st = self.shared.state.lock();
        st.last_checkpoint_epoch = last_epoch;
        st.closed_bytes = replay_bytes;
        if replay_bytes > self.shared.policy.steady_replay_bytes {
            st.checkpoint_requested = true;
        }
        drop(st);
        self.shared.wake_cv.notify_all();
    }

    pub fn start(&self) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *guard = Some(
            std::thread::Builder::new()
                .name("xtstore-ckpt".into())
                .spawn(move || run_loop(shared))
                .expect("spawn checkpoint coordinator"),
        );
    }

    /// Signal the thread and join it; in-flight work completes first.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake_cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn request_checkpoint(&self) {
        self.shared.state.lock().checkpoint_requested = true;
        self.shared.wake_cv.notify_all();
    }

    pub fn stats(&self) -> CoordinatorStats {
        *self.shared.stats.lock()
    }

    pub fn set_metrics_callback(&self, cb: MetricsCallback) {
        *self.shared.metrics_cb.lock() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.shared.error_cb.lock() = Some(cb);
    }

    /// Block until no group-commit leader is in flight (test barrier).
    pub fn wait_for_publish(&self) {
        let mut g = self.shared.group_mu.lock();
        while g.leader_active {
            self.shared.group_cv.wait_for(&mut g, Duration::from_millis(100));
        }
    }

    /// Commit point for writers: durably name `(new_root, new_epoch)` in
    /// the superblock, according to the durability mode. With group commit
    /// the first caller leads and coalesces followers' publishes; everyone
    /// returns the batch outcome.
    pub fn try_publish(&self, new_root: NodeId, new_epoch: u64) -> StoreResult<()> {
        let sh = &self.shared;
        let window = sh.policy.group_commit_interval;
        if sh.policy.durability_mode == DurabilityMode::Strict || window.is_zero() {
            let res = self.publish_now(new_root, new_epoch);
            if res.is_ok() {
                sh.stats.lock().publishes += 1;
            }
            return res;
        }

        let mut g = sh.group_mu.lock();
        if !g.has_pending || new_epoch >= g.pending_epoch {
            g.pending_root = new_root;
            g.pending_epoch = new_epoch;
            g.has_pending = true;
        }
        // Wait until some batch publishes an epoch covering ours, leading
        // a batch ourselves whenever no leader is in flight.
        loop {
            if g.published_epoch >= new_epoch {
                return Ok(());
            }
            if let Some(msg) = g.last_error.take() {
                return Err(StoreError::Other(anyhow::anyhow!("group commit failed: {msg}")));
            }
            if !g.leader_active {
                g.leader_active = true;
                if !g.has_pending {
                    g.pending_root = new_root;
                    g.pending_epoch = new_epoch;
                    g.has_pending = true;
                }
                drop(g);
                // Let followers pile onto this batch.
                std::thread::sleep(window);
                let (root, epoch) = {
                    let mut g = sh.group_mu.lock();
                    g.has_pending = false;
                    (g.pending_root, g.pending_epoch)
                };
                let result = self.publish_now(root, epoch);
                g = sh.group_mu.lock();
                g.leader_active = false;
                match &result {
                    Ok(()) => g.published_epoch = g.published_epoch.max(epoch),
                    Err(e) => g.last_error = Some(e.to_string()),
                }
                sh.group_cv.notify_all();
                drop(g);
                {
                    let mut stats = sh.stats.lock();
                    stats.publishes += 1;
                    stats.group_commit_batches += 1;
                }
                return result;
            }
            sh.group_cv.wait(&mut g);
        }
    }

    fn publish_now(&self, root: NodeId, epoch: u64) -> StoreResult<()> {
        let sh = &self.shared;
        match sh.policy.durability_mode {
            DurabilityMode::Eventual => {
                // Fsync skipped; the background loop flushes in batches.
                sh.state.lock().eventual_dirty = true;
            }
            _ => {
                sh.active_log.get().sync().map_err(StoreError::Other)?;
            }
        }
        sh.superblock.publish(root, epoch)
    }

    /// Durability barrier without a root change.
    pub fn commit(&self, _epoch: u64) -> StoreResult<()> {
        let sh = &self.shared;
        match sh.policy.durability_mode {
            DurabilityMode::Strict => {
                sh.alloc.sync_all().map_err(StoreError::Other)?;
                sh.active_log.get().sync().map_err(StoreError::Other)?;
            }
            DurabilityMode::Balanced => {
                sh.active_log.get().sync().map_err(StoreError::Other)?;
            }
            DurabilityMode::Eventual => {
                sh.state.lock().eventual_dirty = true;
            }
        }
        Ok(())
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------- Background thread ----------------

fn run_loop(sh: Arc<Shared>) {
    tracing::debug!(target: "xtstore::coordinator", "checkpoint coordinator started");
    while !sh.stop.load(Ordering::Acquire) {
        {
            let mut g = sh.wake_mu.lock();
            sh.wake_cv.wait_for(&mut g, POLL_INTERVAL);
        }
        if sh.stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = tick(&sh) {
            report_error(&sh, &format!("coordinator tick failed: {err:#}"));
        }
    }
    // Final flush so a clean shutdown loses nothing.
    if let Err(err) = final_flush(&sh) {
        report_error(&sh, &format!("coordinator shutdown flush failed: {err:#}"));
    }
    tracing::debug!(target: "xtstore::coordinator", "checkpoint coordinator stopped");
}

fn report_error(sh: &Shared, msg: &str) {
    tracing::error!(target: "xtstore::coordinator", "{msg}");
    if let Some(cb) = sh.error_cb.lock().as_ref() {
        cb(msg);
    }
}

fn tick(sh: &Shared) -> Result<()> {
    let now = Instant::now();
    let active = sh.active_log.get();
    let end = active.end_offset();
    let log_age = active.age();

    let (do_checkpoint, do_rotate, flush_eventual) = {
        let mut st = sh.state.lock();
        if end != st.last_seen_offset {
            st.last_seen_offset = end;
            st.last_write_at = now;
        }
        let replay_bytes = st.closed_bytes + end.saturating_sub(st.active_baseline);
        let writing = now.duration_since(st.last_write_at) < WRITE_ACTIVITY_WINDOW;
        let eventual = sh.policy.durability_mode == DurabilityMode::Eventual;

        let byte_threshold = if eventual {
            // Eager checkpoints: inline payloads must not pile up.
            sh.policy.steady_replay_bytes / 4
        } else if writing {
            sh.policy.max_replay_bytes
        } else {
            sh.policy.steady_replay_bytes
        };
        let age_threshold =
            if writing { sh.policy.max_age } else { sh.policy.query_only_age };

        let since_ckpt = now.duration_since(st.last_checkpoint_at);
        let interval_ok = since_ckpt >= sh.policy.min_interval;
        let mut do_checkpoint = false;
        if interval_ok
            && (st.checkpoint_requested
                || replay_bytes > byte_threshold.max(1)
                || (since_ckpt > age_threshold && replay_bytes > 0))
        {
            do_checkpoint = true;
            st.checkpoint_requested = false;
        }
        let do_rotate = end > sh.policy.rotate_bytes || log_age > sh.policy.rotate_age;
        let flush = eventual && st.eventual_dirty;
        if flush {
            st.eventual_dirty = false;
        }
        (do_checkpoint, do_rotate, flush)
    };

    if flush_eventual {
        active.sync()?;
        sh.alloc.sync_all()?;
    }
    if do_rotate {
        rotate(sh)?;
    }
    if do_checkpoint {
        checkpoint(sh)?;
        if let Some(reclaimer) = &sh.reclaimer {
            let freed = reclaimer.run_once();
            sh.stats.lock().reclaimed_handles += freed as u64;
        }
    }
    Ok(())
}

fn final_flush(sh: &Shared) -> Result<()> {
    let active = sh.active_log.get();
    if active.is_open() {
        active.sync()?;
    }
    sh.alloc.sync_all()?;
    Ok(())
}

/// prepare_close → drain → close → open new log → swap pointer → manifest.
fn rotate(sh: &Shared) -> Result<()> {
    let old = sh.active_log.get();
    let seq = {
        let mut st = sh.state.lock();
        let s = st.next_log_seq;
        st.next_log_seq += 1;
        s
    };
    old.prepare_close();
    old.sync()?;
    old.close()?;
    // A closed entry must not keep end_epoch 0 (the active marker), and
    // reopened logs seed their watermark at the recovery resume epoch.
    let old_end_epoch = old.max_epoch().max(1);
    let old_size = old.end_offset();

    let new_name = delta_log_name(seq);
    let new_log = Arc::new(OtDeltaLog::new(
        &sh.dir.join(&new_name),
        sh.policy.rotate_bytes.min(crate::delta_log::DEFAULT_PREALLOC_CHUNK),
        seq,
    ));
    new_log.open_for_append().context("open rotated delta log")?;
    sh.active_log.swap(Arc::clone(&new_log));

    {
        let mut manifest = sh.manifest.lock();
        let old_rel = old
            .path()
            .strip_prefix(&sh.dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| old.path().to_string_lossy().into_owned());
        manifest.close_delta_log(&old_rel, old_end_epoch, old_size);
        manifest.add_delta_log(DeltaLogInfo {
            path: new_name.clone(),
            start_epoch: old_end_epoch + 1,
            end_epoch: 0,
            size: 0,
        });
        manifest.store()?;
    }
    {
        let mut st = sh.state.lock();
        st.closed_bytes += old_size.saturating_sub(st.active_baseline);
        st.active_baseline = 0;
        st.last_seen_offset = 0;
    }
    sh.stats.lock().rotations += 1;
    tracing::info!(
        target: "xtstore::coordinator",
        "rotated delta log -> {} (old: {} bytes, end epoch {})",
        new_name, old_size, old_end_epoch
    );
    Ok(())
}

fn checkpoint(sh: &Shared) -> Result<()> {
    // Barrier: checkpointed addresses must point at flushed bytes.
    sh.alloc.sync_all()?;
    let active = sh.active_log.get();
    if active.is_open() {
        active.sync()?;
    }

    let mut entries = Vec::new();
    sh.ot.iterate_live_snapshot(&mut entries);
    let epoch = sh.mvcc.current_epoch();
    let summary = write_checkpoint(&sh.dir, epoch, &entries)?;

    let (old_checkpoint, dead_logs) = {
        let mut manifest = sh.manifest.lock();
        let old = manifest.checkpoint.clone();
        for nf in sh.alloc.take_new_files() {
            manifest.add_data_file(DataFileInfo {
                class_id: nf.class_id,
                seq: nf.seq,
                file: format!("data/{}", nf.file_name),
                bytes: nf.bytes,
            });
        }
        manifest.set_checkpoint(CheckpointInfo {
            path: summary.file_name.clone(),
            epoch: summary.epoch,
            size: summary.size,
            entries: summary.entries,
            crc: summary.crc,
        });
        let dead = manifest.prune_old_delta_logs(epoch);
        manifest.store()?;
        (old, dead)
    };

    // Only after the manifest points at the new checkpoint may the old
    // files go away.
    if !old_checkpoint.path.is_empty() && old_checkpoint.path != summary.file_name {
        let _ = std::fs::remove_file(sh.dir.join(&old_checkpoint.path));
    }
    for dead in dead_logs {
        let _ = std::fs::remove_file(sh.dir.join(&dead.path));
        tracing::debug!(target: "xtstore::coordinator", "pruned delta log {}", dead.path);
    }

    let replay_bytes;
    {
        let mut st = sh.state.lock();
        st.last_checkpoint_at = Instant::now();
        st.last_checkpoint_epoch = epoch;
        st.closed_bytes = 0;
        st.active_baseline = active.end_offset();
        replay_bytes = st.active_baseline;
    }
    {
        let mut stats = sh.stats.lock();
        stats.checkpoints_written += 1;
        stats.last_checkpoint_epoch = epoch;
        stats.last_replay_bytes = replay_bytes;
    }
    if let Some(cb) = sh.metrics_cb.lock().as_ref() {
        cb(&sh.stats.lock());
    }
    Ok(())
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod coordinator_tests;
