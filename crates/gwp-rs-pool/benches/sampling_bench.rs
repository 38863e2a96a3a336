//! Hot-path benchmarks.
//!
//! The sampling gate runs on every host allocation, so its cost is the
//! allocator's headline overhead number.

use criterion::{Criterion, criterion_group, criterion_main};

use gwp_rs_core::options::Options;
use gwp_rs_pool::GuardedPoolAllocator;

fn bench_should_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("should_sample");

    let zero: &'static GuardedPoolAllocator = Box::leak(Box::new(GuardedPoolAllocator::new()));
    group.bench_function("zero_state", |b| {
        b.iter(|| criterion::black_box(zero.should_sample()));
    });

    let pool: &'static GuardedPoolAllocator = Box::leak(Box::new(GuardedPoolAllocator::new()));
    pool.init(Options {
        sample_rate: 5000,
        max_simultaneous_allocations: 16,
        install_fork_handlers: false,
        ..Options::default()
    })
    .expect("valid bench options");
    group.bench_function("rate_5000", |b| {
        b.iter(|| criterion::black_box(pool.should_sample()));
    });

    group.finish();
}

fn bench_guarded_alloc_free(c: &mut Criterion) {
    let pool: &'static GuardedPoolAllocator = Box::leak(Box::new(GuardedPoolAllocator::new()));
    pool.init(Options {
        sample_rate: 1,
        max_simultaneous_allocations: 16,
        install_fork_handlers: false,
        ..Options::default()
    })
    .expect("valid bench options");

    let mut group = c.benchmark_group("guarded_alloc_free");
    for size in [1usize, 64, 1024] {
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| {
                let ptr = pool.allocate(size);
                assert!(!ptr.is_null());
                pool.deallocate(ptr);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_should_sample, bench_guarded_alloc_free);
criterion_main!(benches);
