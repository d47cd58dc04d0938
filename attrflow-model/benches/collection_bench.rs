//! Benchmarks for collection reconciliation and change propagation.
//!
//! Run with: cargo bench -p attrflow-model

use attrflow_model::{
    Collection, CollectionKind, Comparator, Entity, EntityKind, SetOptions,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value as Json, json};
use std::hint::black_box;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn item_kind() -> Rc<EntityKind> {
    EntityKind::builder("item").build().unwrap()
}

fn models(range: std::ops::Range<u64>, version: u64) -> Json {
    Json::Array(
        range
            .map(|id| json!({"id": id, "rank": (id * 7919) % 1000, "version": version}))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// 1. set: merge half, add half, remove half
// ---------------------------------------------------------------------------

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection/set");

    for count in [100u64, 1_000, 5_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("unsorted", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    Collection::new(
                        CollectionKind::of(item_kind()),
                        models(0..count, 0),
                        &SetOptions::default(),
                    )
                },
                |collection| {
                    collection.set(models(count / 2..count + count / 2, 1), &SetOptions::default());
                    black_box(collection.len())
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("sorted", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let kind = CollectionKind::builder("ranked", item_kind())
                        .comparator(Comparator::attribute("rank"))
                        .build();
                    Collection::new(kind, models(0..count, 0), &SetOptions::default())
                },
                |collection| {
                    collection.set(models(count / 2..count + count / 2, 1), &SetOptions::default());
                    black_box(collection.len())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Lookup by identity
// ---------------------------------------------------------------------------

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection/get");
    let count = 10_000u64;
    let collection = Collection::new(
        CollectionKind::of(item_kind()),
        models(0..count, 0),
        &SetOptions::default(),
    );
    group.throughput(Throughput::Elements(count));
    group.bench_function("by_id", |b| {
        b.iter(|| {
            for id in 0..count {
                black_box(collection.get(id));
            }
        });
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Nested change propagation
// ---------------------------------------------------------------------------

fn bench_propagation(c: &mut Criterion) {
    let leaf = EntityKind::builder("leaf").build().unwrap();
    let middle = EntityKind::builder("middle").has_one("leaf", leaf).build().unwrap();
    let top = EntityKind::builder("top").has_one("middle", middle).build().unwrap();
    let root = Entity::new(top, json!({"middle": {"leaf": {"n": 0}}}), &SetOptions::default());
    let leaf = root
        .get("middle.leaf")
        .and_then(|value| value.as_entity().cloned())
        .unwrap();

    let mut n = 0i64;
    c.bench_function("entity/propagate_two_levels", |b| {
        b.iter(|| {
            n += 1;
            leaf.set(json!({"n": n}), &SetOptions::default()).unwrap();
        });
    });
}

criterion_group!(benches, bench_set, bench_get, bench_propagation);
criterion_main!(benches);
