//! Startup and recovery benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use xlog_bench::{bench_collab, bench_config, fresh_log, random_data, BENCH_RMGR_ID};
use xlog_core::{Lsn, RecordRequest, SyncMethod, WalManager};

/// Leaves a crashed log of `count` records behind.
fn crashed_log(count: usize) -> TempDir {
    let config = bench_config(SyncMethod::Disabled);
    let (dir, wal) = fresh_log(&config);
    let data = random_data(200);
    let mut end = Lsn::INVALID;
    for i in 0..count {
        end = wal
            .insert(&RecordRequest::new(BENCH_RMGR_ID, 0x10).xid(i as u32 + 1).data(&data))
            .unwrap();
    }
    wal.flush_through(end).unwrap();
    drop(wal);
    dir
}

/// Benchmark crash recovery by the number of records to replay.
fn bench_crash_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("crash_recovery");
    group.sample_size(10);

    for count in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter_batched(
                || crashed_log(count),
                |dir| {
                    let (collab, rmgr) = bench_collab();
                    let wal = WalManager::open(
                        &dir.path().join("data"),
                        bench_config(SyncMethod::Disabled),
                        collab,
                    )
                    .unwrap();
                    assert_eq!(rmgr.count(), count as u64);
                    black_box(wal.startup_report().end_of_log);
                    dir
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

/// Benchmark a clean open, which reads the checkpoint and replays nothing.
fn bench_clean_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_open");
    group.sample_size(20);

    group.bench_function("after_shutdown", |b| {
        let config = bench_config(SyncMethod::Disabled);
        let (dir, wal) = fresh_log(&config);
        wal.shutdown().unwrap();
        let path = dir.path().join("data");

        b.iter(|| {
            let wal = WalManager::open(&path, config.clone(), bench_collab().0).unwrap();
            wal.shutdown().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_crash_recovery, bench_clean_open);

criterion_main!(benches);
