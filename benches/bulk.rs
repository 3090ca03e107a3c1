//! Re-entry latency of parallel regions and the cost of a blocking wait.

use std::{
    hint::black_box,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tutti::prelude::*;

fn bench_bulk_execute(c: &mut Criterion) {
    let topology: Arc<dyn Topology> = Arc::new(LogicalTopology::with_domains(2, 2));
    let targets = topology.numa_domains();
    let flat = ForkJoinExecutor::with_topology(
        Arc::clone(&topology),
        &targets[0].mask().union(targets[1].mask()),
        ForkJoinParams::default(),
    )
    .unwrap();
    let block =
        BlockForkJoinExecutor::with_topology(Arc::clone(&topology), targets, ForkJoinParams::default())
            .unwrap();

    let mut group = c.benchmark_group("bulk_execute");
    for size in [16usize, 1024, 65536] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("fork_join", size), &size, |bencher, &size| {
            let sum = AtomicU64::new(0);
            bencher.iter(|| {
                flat.bulk_execute(
                    |i| {
                        sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
                    },
                    0..size,
                )
            });
        });

        group.bench_with_input(BenchmarkId::new("block", size), &size, |bencher, &size| {
            let sum = AtomicU64::new(0);
            bencher.iter(|| {
                block.bulk_execute(
                    |i| {
                        sum.fetch_add(black_box(i as u64), Ordering::Relaxed);
                    },
                    0..size,
                )
            });
        });
    }
    group.finish();
}

fn bench_sync_wait(c: &mut Criterion) {
    c.bench_function("sync_wait_ready", |bencher| {
        bencher.iter(|| sync_wait(just::<_, tutti::Error>(black_box(1u64)).then(|v| v + 1)))
    });
    c.bench_function("sync_wait_thread", |bencher| {
        bencher.iter(|| spawn_thread(|| black_box(1u64)).sync_wait())
    });
}

criterion_group!(benches, bench_bulk_execute, bench_sync_wait);
criterion_main!(benches);
