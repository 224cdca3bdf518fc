//! Allocation throughput and collection pause time.

use criterion::{criterion_group, criterion_main, Criterion};
use reclaim_gc::{CollectMode, Collector, CollectorConfig, ObjectAttributes};
use std::hint::black_box;

fn collector() -> Collector {
    let config = CollectorConfig {
        background: false,
        auto_collect_bytes: 0,
        ..CollectorConfig::default()
    };
    Collector::with_config(config).expect("collector")
}

fn bench_small_alloc(c: &mut Criterion) {
    let gc = collector();
    c.bench_function("alloc_64b", |b| {
        b.iter(|| {
            let p = gc.alloc(64, ObjectAttributes::NONE).unwrap();
            black_box(p);
        });
    });
}

fn bench_leaf_alloc(c: &mut Criterion) {
    let gc = collector();
    c.bench_function("alloc_64b_leaf", |b| {
        b.iter(|| {
            let p = gc.alloc(64, ObjectAttributes::LEAF).unwrap();
            black_box(p);
        });
    });
}

fn bench_pause_1000_objects(c: &mut Criterion) {
    c.bench_function("exhaustive_pause_1000_objects", |b| {
        b.iter(|| {
            let gc = collector();
            let keep = gc.alloc(64, ObjectAttributes::NONE).unwrap();
            gc.pin_root(keep).unwrap();
            for _ in 0..1000 {
                gc.alloc(64, ObjectAttributes::NONE).unwrap();
            }
            gc.collect_now(CollectMode::Exhaustive).unwrap();
            black_box(gc.last_metrics());
        });
    });
}

fn bench_partial_vs_exhaustive(c: &mut Criterion) {
    c.bench_function("partial_pause_dense_heap", |b| {
        b.iter(|| {
            let gc = collector();
            for _ in 0..1000 {
                let p = gc.alloc(64, ObjectAttributes::NONE).unwrap();
                gc.pin_root(p).unwrap();
            }
            gc.collect_now(CollectMode::Partial).unwrap();
            black_box(gc.last_metrics());
        });
    });
}

criterion_group!(
    benches,
    bench_small_alloc,
    bench_leaf_alloc,
    bench_pause_1000_objects,
    bench_partial_vs_exhaustive
);
criterion_main!(benches);
