//! Benchmark for the number allocators
//!
//! Range search over a densely occupied pool and transactional
//! allocate / rollback cycles on the minor number pool.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use linstor_core::numberpool::{get_free_number, DynamicNumberPool};
use linstor_core::transaction::{MemoryDriver, Transaction};
use std::sync::Arc;

const START: i32 = 1000;
const END: i32 = 49999;

fn bench_range_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_search");
    group.throughput(Throughput::Elements(1));

    for fill in [0usize, 1_000, 10_000, 40_000] {
        let occupied: Vec<i32> = (START..START + fill as i32).collect();
        group.bench_with_input(BenchmarkId::new("lowest_free", fill), &occupied, |b, occupied| {
            b.iter(|| get_free_number(black_box(occupied), START, START, END));
        });
    }

    // Free slot only below the offset, forcing the wrap-around search
    let occupied: Vec<i32> = (START + 1..=END).collect();
    group.bench_function("wrap_around", |b| {
        b.iter(|| get_free_number(black_box(&occupied), END, START, END));
    });

    group.finish();
}

fn bench_pool_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("dynamic_pool");
    group.throughput(Throughput::Elements(1));

    let driver = Arc::new(MemoryDriver::new());
    let pool = DynamicNumberPool::new("minor number", START, END);
    let mut setup = Transaction::new(driver.clone());
    for _ in 0..10_000 {
        let _ = pool.auto_allocate(&mut setup);
    }
    let _ = setup.commit();

    group.bench_function("auto_allocate_rollback", |b| {
        b.iter(|| {
            let mut tx = Transaction::new(driver.clone());
            let nr = pool.auto_allocate(&mut tx);
            tx.rollback();
            black_box(nr)
        });
    });

    group.bench_function("allocate_in_use", |b| {
        b.iter(|| {
            let mut tx = Transaction::new(driver.clone());
            let result = pool.allocate(&mut tx, black_box(START + 42));
            tx.rollback();
            black_box(result)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_range_search, bench_pool_allocation);
criterion_main!(benches);
