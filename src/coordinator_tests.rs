use super::*;
use crate::config::IngestMode;
use crate::delta_log::OtDeltaRec;
use crate::entry::{OtAddr, RETIRE_LIVE};
use crate::node_id::NodeKind;
use std::sync::atomic::AtomicU64;

struct Rig {
    tmp: tempfile::TempDir,
    ot: Arc<ObjectTableSharded>,
    superblock: Arc<Superblock>,
    manifest: Arc<Mutex<Manifest>>,
    active: Arc<ActiveLog>,
    alloc: Arc<SegmentAllocator>,
    mvcc: Arc<MvccContext>,
}

impl Rig {
    fn new() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let log = Arc::new(OtDeltaLog::new(&dir.join(delta_log_name(1)), 4096, 1));
        log.open_for_append().unwrap();
        let mut manifest = Manifest::new(&dir);
        manifest.add_delta_log(DeltaLogInfo {
            path: delta_log_name(1),
            start_epoch: 1,
            end_epoch: 0,
            size: 0,
        });
        Rig {
            ot: Arc::new(ObjectTableSharded::new(2)),
            superblock: Arc::new(Superblock::open(&dir.join("superblock")).unwrap()),
            manifest: Arc::new(Mutex::new(manifest)),
            active: Arc::new(ActiveLog::new(log)),
            alloc: Arc::new(SegmentAllocator::new(&dir.join("data"), 1024).unwrap()),
            mvcc: Arc::new(MvccContext::new()),
            tmp,
        }
    }

    fn coordinator(&self, policy: CheckpointPolicy) -> CheckpointCoordinator {
        CheckpointCoordinator::new(
            self.tmp.path().to_path_buf(),
            Arc::clone(&self.ot),
            Arc::clone(&self.superblock),
            Arc::clone(&self.manifest),
            Arc::clone(&self.active),
            Arc::clone(&self.alloc),
            Arc::clone(&self.mvcc),
            policy,
            None,
            2,
        )
    }

    /// Simulate write traffic: publish entries through the OT and log them.
    fn simulate_writes(&self, count: u64) {
        let log = self.active.get();
        for i in 0..count {
            let epoch = self.mvcc.advance_epoch();
            let a = OtAddr { file_id: 1, segment_id: 0, offset: i * 64, length: 64 };
            let p = self.ot.allocate(NodeKind::Leaf, 0, a, 0);
            let r = self.ot.mark_live_reserve(p, epoch).unwrap();
            let rec = OtDeltaRec {
                handle_idx: r.handle_index(),
                tag: r.tag(),
                class_id: 0,
                kind: NodeKind::Leaf as u8,
                file_id: 1,
                segment_id: 0,
                offset: i * 64,
                length: 64,
                data_crc: 0,
                birth_epoch: epoch,
                retire_epoch: RETIRE_LIVE,
            };
            log.append_single(&rec).unwrap();
            self.ot.mark_live_commit(r, epoch).unwrap();
        }
        log.sync().unwrap();
    }
}

fn wait_until(mut f: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    f()
}

fn quiet_policy() -> CheckpointPolicy {
    // Nothing triggers on its own.
    CheckpointPolicy {
        max_replay_bytes: u64::MAX / 2,
        steady_replay_bytes: u64::MAX / 2,
        max_age: Duration::from_secs(3600),
        query_only_age: Duration::from_secs(3600),
        min_interval: Duration::ZERO,
        rotate_bytes: u64::MAX / 2,
        rotate_age: Duration::from_secs(3600),
        max_payload_in_wal: 4096,
        durability_mode: DurabilityMode::Balanced,
        group_commit_interval: Duration::from_millis(3),
        ingest_mode: IngestMode::Normal,
    }
}

#[test]
fn explicit_request_writes_a_checkpoint() {
    let rig = Rig::new();
    let coord = rig.coordinator(quiet_policy());
    coord.start();
    rig.simulate_writes(10);
    coord.request_checkpoint();
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    coord.stop();
    let stats = coord.stats();
    assert!(stats.last_checkpoint_epoch > 0);
    let manifest = rig.manifest.lock();
    assert!(!manifest.checkpoint.path.is_empty());
    assert!(rig.tmp.path().join(&manifest.checkpoint.path).exists());
    assert_eq!(manifest.checkpoint.entries, 10);
}

#[test]
fn replay_size_bound_triggers_checkpoint() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.max_replay_bytes = 1024;
    policy.steady_replay_bytes = 1024;
    let coord = rig.coordinator(policy);
    coord.start();
    // 68 bytes per frame; 40 frames ≈ 2.7 KB > 1 KB threshold.
    rig.simulate_writes(40);
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    coord.stop();
}

#[test]
fn age_bound_triggers_checkpoint() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.max_age = Duration::from_millis(200);
    policy.query_only_age = Duration::from_millis(200);
    let coord = rig.coordinator(policy);
    coord.start();
    rig.simulate_writes(3);
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    coord.stop();
}

#[test]
fn rotation_closes_and_replaces_the_active_log() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.rotate_bytes = 512;
    let coord = rig.coordinator(policy);
    let old_path = rig.active.get().path().to_path_buf();
    coord.start();
    rig.simulate_writes(20); // ~1.3 KB > 512 B
    assert!(wait_until(|| coord.stats().rotations >= 1, Duration::from_secs(5)));
    coord.stop();

    let new_log = rig.active.get();
    assert_ne!(new_log.path(), old_path.as_path());
    assert!(new_log.is_open());
    // Appends keep working on the new log.
    rig.simulate_writes(1);

    let manifest = rig.manifest.lock();
    let closed = manifest
        .delta_logs
        .iter()
        .find(|l| rig.tmp.path().join(&l.path) == old_path)
        .expect("old log still listed");
    assert_ne!(closed.end_epoch, 0, "old log entry must be closed");
    assert!(manifest.delta_logs.iter().any(|l| l.end_epoch == 0), "a new active entry exists");
}

#[test]
fn checkpoint_prunes_subsumed_logs() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.rotate_bytes = 512;
    let coord = rig.coordinator(policy);
    let old_path = rig.active.get().path().to_path_buf();
    coord.start();
    rig.simulate_writes(20);
    assert!(wait_until(|| coord.stats().rotations >= 1, Duration::from_secs(5)));
    coord.request_checkpoint();
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    // The closed log's epochs are all ≤ the checkpoint epoch, so its file
    // is deleted once the manifest points at the checkpoint.
    assert!(wait_until(|| !old_path.exists(), Duration::from_secs(5)));
    coord.stop();
}

#[test]
fn try_publish_updates_the_superblock() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.durability_mode = DurabilityMode::Strict;
    let coord = rig.coordinator(policy);
    coord.start();
    let root = NodeId::from_parts(123, 1);
    coord.try_publish(root, 10).unwrap();
    let snap = rig.superblock.load().unwrap();
    assert_eq!(snap.root, root);
    assert_eq!(snap.epoch, 10);
    // Regression is surfaced to the caller.
    assert!(coord.try_publish(root, 5).is_err());
    coord.stop();
}

#[test]
fn group_commit_coalesces_concurrent_publishes() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.group_commit_interval = Duration::from_millis(10);
    let coord = Arc::new(rig.coordinator(policy));
    coord.start();

    let max_epoch = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for t in 1..=8u64 {
        let coord = Arc::clone(&coord);
        let max_epoch = Arc::clone(&max_epoch);
        handles.push(std::thread::spawn(move || {
            let epoch = 100 + t;
            coord.try_publish(NodeId::from_parts(1000 + epoch, 1), epoch).unwrap();
            max_epoch.fetch_max(epoch, Ordering::Relaxed);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    coord.wait_for_publish();
    let snap = rig.superblock.load().unwrap();
    // The winning pair is the highest epoch offered to the batch.
    assert_eq!(snap.epoch, max_epoch.load(Ordering::Relaxed));
    assert_eq!(snap.root.handle_index(), 1000 + snap.epoch);
    let stats = coord.stats();
    assert!(
        stats.group_commit_batches <= stats.publishes,
        "batches={} publishes={}",
        stats.group_commit_batches,
        stats.publishes
    );
    coord.stop();
}

#[test]
fn metrics_and_error_callbacks_fire() {
    let rig = Rig::new();
    let coord = rig.coordinator(quiet_policy());
    let metrics_calls = Arc::new(AtomicU64::new(0));
    let mc = Arc::clone(&metrics_calls);
    coord.set_metrics_callback(Box::new(move |stats| {
        assert!(stats.checkpoints_written >= 1);
        mc.fetch_add(1, Ordering::Relaxed);
    }));
    coord.start();
    rig.simulate_writes(5);
    coord.request_checkpoint();
    assert!(wait_until(|| metrics_calls.load(Ordering::Relaxed) >= 1, Duration::from_secs(5)));
    coord.stop();
}

#[test]
fn initialize_after_recovery_requests_eager_checkpoint() {
    let rig = Rig::new();
    let mut policy = quiet_policy();
    policy.steady_replay_bytes = 1024;
    policy.max_replay_bytes = u64::MAX / 2;
    let coord = rig.coordinator(policy);
    // Recovery replayed 300 MB: far past the steady bound.
    coord.initialize_after_recovery(100, 300 * 1024 * 1024);
    rig.simulate_writes(1);
    coord.start();
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    coord.stop();
}

#[test]
fn stop_is_idempotent_and_joins_the_thread() {
    let rig = Rig::new();
    let coord = rig.coordinator(quiet_policy());
    coord.start();
    coord.stop();
    coord.stop();
    // Restart works after a stop.
    coord.start();
    coord.request_checkpoint();
    rig.simulate_writes(1);
    assert!(wait_until(|| coord.stats().checkpoints_written >= 1, Duration::from_secs(5)));
    coord.stop();
}
