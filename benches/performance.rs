use criterion::{black_box, criterion_group, criterion_main, Criterion};
use natmem::prelude::*;

fn bench_allocate_release(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default());
    c.bench_function("allocate_drop_4k", |b| {
        b.iter(|| {
            let h = rt.allocate(HandleKind::BYTE, 4096).unwrap();
            black_box(h.address());
        })
    });

    let budgeted = Runtime::new(RuntimeConfig {
        max_bytes: 64 * 1024 * 1024,
        ..RuntimeConfig::default()
    });
    c.bench_function("allocate_drop_4k_budgeted", |b| {
        b.iter(|| {
            let h = budgeted.allocate(HandleKind::BYTE, 4096).unwrap();
            black_box(h.address());
        })
    });
}

fn bench_retain_release(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default());
    let h = rt.allocate(HandleKind::LONG, 8).unwrap();
    h.retain_reference();
    c.bench_function("retain_release", |b| {
        b.iter(|| {
            h.retain_reference();
            black_box(h.release_reference());
        })
    });
}

fn bench_scope_close(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default());
    c.bench_function("scope_close_64_handles", |b| {
        b.iter(|| {
            let scope = HandleScope::open();
            for _ in 0..64 {
                let _ = rt.allocate(HandleKind::INT, 16).unwrap();
            }
            scope.close();
        })
    });
}

fn bench_deferred_collection(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig {
        collector: CollectorMode::Disabled,
        ..RuntimeConfig::default()
    });
    c.bench_function("collect_256_unreachable", |b| {
        b.iter(|| {
            for _ in 0..256 {
                drop(rt.allocate(HandleKind::BYTE, 256).unwrap());
            }
            black_box(rt.collect());
        })
    });
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_retain_release,
    bench_scope_close,
    bench_deferred_collection
);
criterion_main!(benches);
