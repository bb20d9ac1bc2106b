//! Record insertion and flush benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::thread;
use xlog_bench::{bench_config, fresh_log, random_data, BENCH_RMGR_ID};
use xlog_core::{Lsn, PageTag, RecordRequest, RelFileNode, SyncMethod, TouchedPage};

/// Benchmark inserting single records without flushing.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [64, 256, 1024, 8192].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (_dir, wal) = fresh_log(&bench_config(SyncMethod::Disabled));
            let data = random_data(size);

            b.iter(|| {
                let end = wal
                    .insert(&RecordRequest::new(BENCH_RMGR_ID, 0x10).xid(1).data(black_box(&data)))
                    .unwrap();
                black_box(end);
            });
        });
    }
    group.finish();
}

/// Benchmark insert followed by flush, the commit path.
fn bench_insert_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_flush");
    group.sample_size(20);

    for sync in [SyncMethod::Disabled, SyncMethod::Fdatasync] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{sync:?}")),
            &sync,
            |b, &sync| {
                let (_dir, wal) = fresh_log(&bench_config(sync));
                let data = random_data(256);

                b.iter(|| {
                    let end = wal
                        .insert(&RecordRequest::new(BENCH_RMGR_ID, 0x10).xid(1).data(&data))
                        .unwrap();
                    wal.flush_through(end).unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a batch of inserts sharing one flush.
fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_commit");
    group.sample_size(20);

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let (_dir, wal) = fresh_log(&bench_config(SyncMethod::Fdatasync));
                let payloads: Vec<_> = (0..batch_size).map(|_| random_data(256)).collect();

                b.iter(|| {
                    let mut end = Lsn::INVALID;
                    for data in &payloads {
                        end = wal
                            .insert(&RecordRequest::new(BENCH_RMGR_ID, 0x10).xid(1).data(data))
                            .unwrap();
                    }
                    wal.flush_through(end).unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark concurrent inserters contending for the insert lock.
fn bench_concurrent_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_insert");
    group.sample_size(20);

    for threads in [1usize, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements((*threads * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let (_dir, wal) = fresh_log(&bench_config(SyncMethod::Disabled));
            let data = random_data(128);

            b.iter(|| {
                thread::scope(|s| {
                    for t in 0..threads {
                        let wal = &wal;
                        let data = &data;
                        s.spawn(move || {
                            for _ in 0..100 {
                                wal.insert(
                                    &RecordRequest::new(BENCH_RMGR_ID, 0x10)
                                        .xid(t as u32 + 1)
                                        .data(data),
                                )
                                .unwrap();
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

/// Benchmark records that carry a full-page image.
fn bench_page_image(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_image");

    let config = bench_config(SyncMethod::Disabled);
    let page = random_data(config.data_page_size as usize);
    let tag = PageTag::new(
        RelFileNode {
            spc_node: 1663,
            db_node: 1,
            rel_node: 16384,
        },
        0,
    );
    for (name, page_lsn) in [("imaged", Lsn::INVALID), ("plain", Lsn::new(u64::MAX))] {
        group.bench_function(name, |b| {
            let (_dir, wal) = fresh_log(&config);
            b.iter(|| {
                wal.insert(
                    &RecordRequest::new(BENCH_RMGR_ID, 0x10)
                        .xid(1)
                        .data(b"tuple header")
                        .page(TouchedPage::new(tag, page_lsn, &page).with_hole(512, 4096))
                        .page_data(0, b"tuple body"),
                )
                .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_insert_flush,
    bench_group_commit,
    bench_concurrent_insert,
    bench_page_image,
);

criterion_main!(benches);
