use channeler::pool::Pool;
use channeler::sync::LockStrategy;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn pool_churn(c: &mut Criterion) {
    let pool = Pool::new(1472, 64, LockStrategy::SingleThread, None);

    c.bench_function("allocate_release", |b| {
        b.iter(|| {
            let slot = pool.allocate().unwrap();
            black_box(&slot);
        })
    });

    let pool = Pool::new(1472, 64, LockStrategy::Atomic, None);

    c.bench_function("allocate_release_atomic", |b| {
        b.iter(|| {
            let slot = pool.allocate().unwrap();
            black_box(&slot);
        })
    });

    let pool = Pool::new(1472, 64, LockStrategy::SingleThread, None);

    c.bench_function("allocate_batch_64", |b| {
        b.iter(|| {
            let slots: Vec<_> = (0..64).map(|_| pool.allocate().unwrap()).collect();
            black_box(&slots);
        })
    });
}

criterion_group!(benches, pool_churn);
criterion_main!(benches);
