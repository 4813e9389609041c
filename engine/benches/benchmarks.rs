//! Performance benchmarks for ferry-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ferry_engine::{
    CollectionSchema, CollectionSnapshot, Document, FieldDef, FieldType, MemoryBackend, Store,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn users() -> CollectionSchema {
    CollectionSchema::new(
        "users",
        vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::optional("email", FieldType::String),
            FieldDef::optional("age", FieldType::Int),
        ],
    )
}

fn populated_store(size: usize) -> Store {
    let store = Store::builder("bench", Arc::new(MemoryBackend::new()))
        .collection(users())
        .open()
        .unwrap();
    for i in 0..size {
        store
            .insert(
                "users",
                json!({"id": format!("user_{}", i), "name": format!("User {}", i)}),
            )
            .unwrap();
    }
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("store_open", |b| {
        b.iter(|| {
            Store::builder(black_box("bench"), Arc::new(MemoryBackend::new()))
                .collection(users())
                .open()
        })
    });

    group.bench_function("insert", |b| {
        let store = populated_store(0);
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            store.insert(
                "users",
                black_box(json!({"id": format!("user_{}", id), "name": "Test User"})),
            )
        })
    });

    group.bench_function("get_document", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get(black_box("users"), black_box("user_500")))
    });

    group.bench_function("update_document", |b| {
        let store = populated_store(100);
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            store.update("users", black_box("user_50"), |mut fields| {
                fields.insert("age".into(), json!(n));
                fields
            })
        })
    });

    group.bench_function("find_all", |b| {
        let store = populated_store(1000);
        b.iter(|| store.all(black_box("users")))
    });

    group.finish();
}

fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for size in [10, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::new("apply_remote", size), size, |b, &size| {
            let batch: Vec<Document> = (0..size)
                .map(|i| {
                    let fields = json!({"name": format!("Remote User {}", i), "updatedAt": 2000 + i})
                        .as_object()
                        .cloned()
                        .unwrap();
                    Document::from_flat(format!("user_{}", i), fields, false)
                        .with_remote_rev(Some(format!("1-{}", i)))
                })
                .collect();

            b.iter(|| {
                let store = populated_store(size / 2);
                store.apply_remote("users", black_box(batch.clone()))
            })
        });

        group.bench_with_input(BenchmarkId::new("pending_changes", size), size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| store.pending_changes(black_box("users"), 60))
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 500, 1000].iter() {
        let backend = MemoryBackend::new();
        {
            let store = Store::builder("snap", Arc::new(backend.clone()))
                .collection(users())
                .open()
                .unwrap();
            for i in 0..*size {
                store
                    .insert(
                        "users",
                        json!({"id": format!("user_{}", i), "name": format!("User {}", i), "email": format!("user{}@test.com", i)}),
                    )
                    .unwrap();
            }
        }

        group.bench_with_input(BenchmarkId::new("reopen", size), size, |b, _| {
            b.iter(|| {
                Store::builder("snap", Arc::new(backend.clone()))
                    .collection(users())
                    .open()
            })
        });

        let bytes = ferry_engine::StorageBackend::read(&backend, "snap", "users")
            .unwrap()
            .unwrap();
        group.bench_with_input(BenchmarkId::new("decode", size), size, |b, _| {
            b.iter(|| CollectionSnapshot::from_bytes("users", black_box(&bytes)))
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let store = populated_store(1);
    let doc = store.get("users", "user_0").unwrap().unwrap();

    group.bench_function("document_to_json", |b| {
        b.iter(|| serde_json::to_string(black_box(&doc)))
    });

    let json = serde_json::to_string(&doc).unwrap();
    group.bench_function("document_from_json", |b| {
        b.iter(|| serde_json::from_str::<Document>(black_box(&json)))
    });

    group.bench_function("flat_view", |b| {
        b.iter(|| -> Value { black_box(&doc).to_json_with_key("_id") })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_store_operations,
    bench_replication,
    bench_snapshot,
    bench_serialization,
);
criterion_main!(benches);
