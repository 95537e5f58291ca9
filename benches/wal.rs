use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use xtstore::delta_log::{OtDeltaLog, OtDeltaRec};
use xtstore::entry::RETIRE_LIVE;
use xtstore::node_id::NodeKind;

fn rec(i: u64) -> OtDeltaRec {
    OtDeltaRec {
        handle_idx: i + 1,
        tag: 1,
        class_id: 2,
        kind: NodeKind::Leaf as u8,
        file_id: 1,
        segment_id: 0,
        offset: i * 256,
        length: 256,
        data_crc: 0,
        birth_epoch: i + 1,
        retire_epoch: RETIRE_LIVE,
    }
}

fn bench_wal(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_log");
    group.sample_size(20);

    for &batch in &[1usize, 16, 256] {
        let recs: Vec<OtDeltaRec> = (0..batch as u64).map(rec).collect();
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::new("append_batched", batch), &batch, |b, &batch| {
            b.iter(|| {
                let tmp = tempfile::tempdir().unwrap();
                let log = OtDeltaLog::new(&tmp.path().join("bench.log"), 64 << 20, 1);
                log.open_for_append().unwrap();
                for _ in 0..(10_000 / batch) {
                    log.append(&recs).unwrap();
                }
                log.sync().unwrap();
                log.close().unwrap();
            });
        });
    }

    group.bench_function("replay_10k", |b| {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("replay.log");
        let log = OtDeltaLog::new(&path, 64 << 20, 1);
        log.open_for_append().unwrap();
        let recs: Vec<OtDeltaRec> = (0..10_000).map(rec).collect();
        log.append(&recs).unwrap();
        log.sync().unwrap();
        log.close().unwrap();
        b.iter(|| {
            let mut n = 0u64;
            let res = OtDeltaLog::replay(&path, |_, _| n += 1).unwrap();
            assert_eq!(res.frames, n);
            criterion::black_box(n)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_wal);
criterion_main!(benches);
