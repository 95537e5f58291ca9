use super::*;
use crate::config::CheckpointPolicy;
use crate::config::IngestMode;

fn test_config() -> StoreConfig {
    StoreConfig {
        policy: CheckpointPolicy {
            // Keep the background coordinator quiet unless a test pokes it.
            max_replay_bytes: u64::MAX / 2,
            steady_replay_bytes: u64::MAX / 2,
            max_age: Duration::from_secs(3600),
            query_only_age: Duration::from_secs(3600),
            min_interval: Duration::ZERO,
            rotate_bytes: u64::MAX / 2,
            rotate_age: Duration::from_secs(3600),
            max_payload_in_wal: 512,
            durability_mode: DurabilityMode::Strict,
            group_commit_interval: Duration::from_millis(2),
            ingest_mode: IngestMode::Normal,
        },
        num_shards: 2,
        segment_bytes: 16 * 1024,
        wal_prealloc_chunk: 64 * 1024,
        compaction_threshold: 0.5,
    }
}

#[test]
fn allocate_publish_read_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();

    let alloc = store.allocate_node(100, NodeKind::Leaf).unwrap();
    assert!(alloc.capacity >= 100);
    // Not yet live.
    let (present, staged) = store.is_node_present(alloc.id);
    assert!(present && staged);
    assert!(store.read_node(alloc.id).is_none());

    let payload = b"a leaf full of rectangles".to_vec();
    let id = store.publish_node(alloc.id, &payload).unwrap();
    assert_eq!(id.handle_index(), alloc.id.handle_index());

    assert_eq!(store.read_node(id).unwrap(), payload);
    let pinned = store.read_node_pinned(id).unwrap();
    assert_eq!(pinned.bytes(), &payload[..]);
    assert_eq!(store.get_node_kind(id), Some(NodeKind::Leaf));
    let (present, staged) = store.is_node_present(id);
    assert!(present && !staged);
}

#[test]
fn in_place_publish_skips_the_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let alloc = store.allocate_node(64, NodeKind::Internal).unwrap();
    store
        .with_node_mut(alloc.id, |buf| {
            buf[..11].copy_from_slice(b"hello inner");
        })
        .unwrap();
    let id = store.publish_node_in_place(alloc.id, 11).unwrap();
    assert_eq!(store.read_node(id).unwrap(), b"hello inner");
    assert_eq!(store.node_capacity(id), Some(64));
}

#[test]
fn retired_nodes_stay_readable_until_reclaim() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let alloc = store.allocate_node(32, NodeKind::DataRecord).unwrap();
    let id = store.publish_node(alloc.id, b"record").unwrap();

    let snap = store.begin_snapshot();
    let retire_epoch = store.mvcc().advance_epoch();
    assert!(store.retire_node(id, retire_epoch, RetireReason::MergeDelete));
    // Not live: metadata lookups say gone.
    assert_eq!(store.get_node_kind(id), None);
    assert_eq!(store.is_node_present(id), (false, false));
    // But the snapshot can still dereference the bytes.
    assert_eq!(store.read_node(id).unwrap(), b"record");
    drop(snap);
}

#[test]
fn double_retire_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let alloc = store.allocate_node(32, NodeKind::Leaf).unwrap();
    let id = store.publish_node(alloc.id, b"x").unwrap();
    let e = store.mvcc().advance_epoch();
    assert!(store.retire_node(id, e, RetireReason::Evict));
    assert!(store.retire_node(id, e + 1, RetireReason::Evict));
}

#[test]
fn free_immediate_rolls_back_a_reservation() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let alloc = store.allocate_node(32, NodeKind::Leaf).unwrap();
    assert!(store.free_node_immediate(alloc.id, RetireReason::AbortRollback));
    assert_eq!(store.is_node_present(alloc.id), (false, false));
    // The handle and the slot are both recycled.
    let again = store.allocate_node(32, NodeKind::Leaf).unwrap();
    assert_eq!(again.id.handle_index(), alloc.id.handle_index());
}

#[test]
fn free_immediate_reclaims_a_live_node() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let alloc = store.allocate_node(32, NodeKind::Leaf).unwrap();
    let id = store.publish_node(alloc.id, b"grown out of").unwrap();
    assert!(store.free_node_immediate(id, RetireReason::Reallocation));
    assert!(store.read_node(id).is_none());
    assert_eq!(store.is_node_present(id), (false, false));
}

#[test]
fn roots_roundtrip_and_publish_to_superblock() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    assert!(!store.get_root("").is_valid());

    let alloc = store.allocate_node(64, NodeKind::Internal).unwrap();
    let id = store.publish_node(alloc.id, b"root node").unwrap();
    let epoch = store.mvcc().current_epoch();
    store.set_root(id, epoch, &[0.0, 10.0, -5.0, 5.0], "").unwrap();
    assert_eq!(store.get_root(""), id);

    // Named roots live only in the catalog.
    store.set_root(id, epoch, &[], "aux").unwrap();
    assert_eq!(store.get_root("aux"), id);
    assert!(!store.get_root("missing").is_valid());
}

#[test]
fn roots_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let (id, epoch);
    {
        let store = DurableStore::open(tmp.path(), test_config()).unwrap();
        let alloc = store.allocate_node(64, NodeKind::Internal).unwrap();
        id = store.publish_node(alloc.id, b"the root").unwrap();
        epoch = store.mvcc().current_epoch();
        store.set_root(id, epoch, &[1.0, 2.0], "").unwrap();
        store.commit(epoch).unwrap();
        store.close().unwrap();
    }
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    assert_eq!(store.get_root(""), id);
    assert_eq!(store.read_node(id).unwrap(), b"the root");
}

#[test]
fn published_nodes_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ids = Vec::new();
    {
        let store = DurableStore::open(tmp.path(), test_config()).unwrap();
        for i in 0..50u32 {
            let alloc = store.allocate_node(80, NodeKind::Leaf).unwrap();
            let body = format!("node payload {}", i).into_bytes();
            ids.push((store.publish_node(alloc.id, &body).unwrap(), body));
        }
        store.commit(store.mvcc().current_epoch()).unwrap();
        store.close().unwrap();
    }
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    for (id, body) in &ids {
        assert_eq!(store.read_node(*id).as_ref(), Some(body), "lost node {:?}", id);
        assert_eq!(store.get_node_kind(*id), Some(NodeKind::Leaf));
    }
}

#[test]
fn retirements_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let (kept, gone);
    {
        let store = DurableStore::open(tmp.path(), test_config()).unwrap();
        let a = store.allocate_node(32, NodeKind::Leaf).unwrap();
        kept = store.publish_node(a.id, b"kept").unwrap();
        let b = store.allocate_node(32, NodeKind::Leaf).unwrap();
        gone = store.publish_node(b.id, b"gone").unwrap();
        let e = store.mvcc().advance_epoch();
        store.retire_node(gone, e, RetireReason::SplitReplace);
        store.commit(e).unwrap();
        store.close().unwrap();
    }
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    assert_eq!(store.get_node_kind(kept), Some(NodeKind::Leaf));
    assert_eq!(store.get_node_kind(gone), None);
    assert_eq!(store.is_node_present(gone), (false, false));
}

#[test]
fn oversize_allocation_reports_exhaustion() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DurableStore::open(tmp.path(), test_config()).unwrap();
    let err = store.allocate_node(8 * 1024 * 1024, NodeKind::Leaf).unwrap_err();
    assert!(matches!(err, StoreError::Exhausted(_)));
}

#[test]
fn concurrent_publishers_and_readers() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(DurableStore::open(tmp.path(), test_config()).unwrap());
    let mut writers = Vec::new();
    for t in 0..4u32 {
        let store = Arc::clone(&store);
        writers.push(std::thread::spawn(move || {
            let mut out = Vec::new();
            for i in 0..50u32 {
                let alloc = store.allocate_node(64, NodeKind::Leaf).unwrap();
                let body = format!("w{}-{}", t, i).into_bytes();
                let id = store.publish_node(alloc.id, &body).unwrap();
                out.push((id, body));
            }
            out
        }));
    }
    let published: Vec<(NodeId, Vec<u8>)> =
        writers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    assert_eq!(published.len(), 200);
    for (id, body) in &published {
        assert_eq!(store.read_node(*id).as_ref(), Some(body));
    }
}
