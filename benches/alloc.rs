//! Allocation-path benchmarks over a file-backed pool.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pmem_heap::{Pool, PoolOptions};

fn bench_pool() -> (tempfile::TempDir, Pool) {
    let dir = tempfile::TempDir::new().unwrap();
    let options = PoolOptions {
        size: 256 * 1024 * 1024,
        lane_count: 64,
        ..PoolOptions::default()
    };
    let pool = Pool::create(dir.path().join("bench.pool"), &options).unwrap();
    (dir, pool)
}

fn alloc_free_pairs(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");
    for size in [64u64, 1024, 16 * 1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (_dir, pool) = bench_pool();
            let heap = pool.heap();
            b.iter(|| {
                let mut slot = 0u64;
                heap.alloc(&mut slot, size).unwrap();
                heap.free(&mut slot).unwrap();
            });
        });
    }
    group.finish();
}

fn run_fill(c: &mut Criterion) {
    c.bench_function("run_fill_1000x128", |b| {
        let (_dir, pool) = bench_pool();
        let heap = pool.heap();
        b.iter(|| {
            let mut slots = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let mut slot = 0u64;
                heap.alloc(&mut slot, 128).unwrap();
                slots.push(slot);
            }
            for slot in slots.iter_mut() {
                heap.free(slot).unwrap();
            }
        });
    });
}

criterion_group!(benches, alloc_free_pairs, run_fill);
criterion_main!(benches);
