//! Store lifecycle tests: migrations, encryption, recovery, concurrency and
//! live queries, run against both backends where it matters.

use ferry_engine::{
    ChangeKind, Checkpoint, CollectionSchema, Error, FieldDef, FieldType, FileBackend,
    MemoryBackend, Origin, RecoveryMode, StorageBackend, Store, StoreHeader,
};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::thread;

fn tasks_v1() -> CollectionSchema {
    CollectionSchema::new(
        "tasks",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("completed", FieldType::Bool),
            FieldDef::optional("projectId", FieldType::String),
        ],
    )
    .version(1)
    .migration(1, |mut doc| {
        doc.entry("projectId").or_insert(Value::Null);
        doc
    })
}

fn completed_to_status(mut doc: Map<String, Value>) -> Map<String, Value> {
    if let Some(completed) = doc.remove("completed") {
        let status = if completed.as_bool().unwrap_or(false) {
            "done"
        } else {
            "todo"
        };
        doc.insert("status".into(), json!(status));
    }
    doc
}

fn tasks_v2() -> CollectionSchema {
    CollectionSchema::new(
        "tasks",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("status", FieldType::String),
            FieldDef::optional("projectId", FieldType::String),
        ],
    )
    .version(2)
    .migration(1, |mut doc| {
        doc.entry("projectId").or_insert(Value::Null);
        doc
    })
    .migration(2, completed_to_status)
}

// ============================================================================
// Migrations
// ============================================================================

#[test]
fn legacy_completed_flag_becomes_status() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path()));

    {
        let store = Store::builder("kernel_db", backend.clone())
            .collection(tasks_v1())
            .open()
            .unwrap();
        store
            .insert("tasks", json!({"id": "t1", "title": "Ship", "completed": true}))
            .unwrap();
        store
            .insert("tasks", json!({"id": "t2", "title": "Plan", "completed": false}))
            .unwrap();
    }

    let store = Store::builder("kernel_db", backend.clone())
        .collection(tasks_v2())
        .open()
        .unwrap();

    let t1 = store.get("tasks", "t1").unwrap().unwrap();
    assert_eq!(t1.get("status"), Some(&json!("done")));
    assert!(t1.get("completed").is_none());
    assert_eq!(t1.metadata.schema_version, 2);

    let t2 = store.get("tasks", "t2").unwrap().unwrap();
    assert_eq!(t2.get("status"), Some(&json!("todo")));

    let header = StoreHeader::from_bytes(&backend.read("kernel_db", "_meta").unwrap().unwrap()).unwrap();
    let live: Vec<_> = header
        .metadata
        .iter()
        .filter(|r| r.collection == "tasks" && !r.deleted)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].version, 2);
}

#[test]
fn migration_runs_once() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    {
        let store = Store::builder("db", backend.clone())
            .collection(tasks_v1())
            .open()
            .unwrap();
        store
            .insert("tasks", json!({"id": "t1", "title": "a", "completed": true}))
            .unwrap();
    }

    let first = Store::builder("db", backend.clone())
        .collection(tasks_v2())
        .open()
        .unwrap()
        .get("tasks", "t1")
        .unwrap()
        .unwrap();
    let second = Store::builder("db", backend.clone())
        .collection(tasks_v2())
        .open()
        .unwrap()
        .get("tasks", "t1")
        .unwrap()
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn downgrade_is_a_schema_conflict() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    Store::builder("db", backend.clone())
        .collection(tasks_v2())
        .open()
        .unwrap();

    let result = Store::builder("db", backend)
        .collection(tasks_v1())
        .open();
    assert!(matches!(result, Err(Error::SchemaConflict { .. })));
}

#[test]
fn incompatible_shape_at_same_version() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    Store::builder("db", backend.clone())
        .collection(tasks_v1())
        .open()
        .unwrap();

    let retyped = CollectionSchema::new("tasks", vec![FieldDef::required("title", FieldType::Int)])
        .version(1)
        .migration(1, |d| d);
    let result = Store::builder("db", backend).collection(retyped).open();
    assert!(matches!(result, Err(Error::SchemaConflict { .. })));
}

// ============================================================================
// Encryption and recovery
// ============================================================================

#[test]
fn wrong_passphrase_then_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path()));
    let schema = tasks_v2().encrypted(["title"]);

    {
        let store = Store::builder("kernel_db", backend.clone())
            .password("first-passphrase")
            .collection(schema.clone())
            .open()
            .unwrap();
        store
            .insert("tasks", json!({"id": "t1", "title": "secret"}))
            .unwrap();
    }

    let strict = Store::builder("kernel_db", backend.clone())
        .password("second-passphrase")
        .collection(schema.clone())
        .open();
    assert!(matches!(strict, Err(Error::CredentialMismatch(_))));

    let store = Store::builder("kernel_db", backend.clone())
        .password("second-passphrase")
        .collection(schema.clone())
        .open_with_recovery(RecoveryMode::Development)
        .unwrap();
    assert!(store.get("tasks", "t1").unwrap().is_none());
    store
        .insert("tasks", json!({"id": "t2", "title": "fresh"}))
        .unwrap();
    drop(store);

    let reopened = Store::builder("kernel_db", backend)
        .password("second-passphrase")
        .collection(schema)
        .open()
        .unwrap();
    assert_eq!(
        reopened.get("tasks", "t2").unwrap().unwrap().get("title"),
        Some(&json!("fresh"))
    );
}

#[test]
fn production_mode_keeps_data() {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    {
        Store::builder("db", backend.clone())
            .password("a")
            .collection(tasks_v2())
            .open()
            .unwrap()
            .insert("tasks", json!({"id": "t1", "title": "keep me"}))
            .unwrap();
    }

    let result = Store::builder("db", backend.clone())
        .password("b")
        .collection(tasks_v2())
        .open_with_recovery(RecoveryMode::Production);
    assert!(matches!(result, Err(Error::CredentialMismatch(_))));

    let store = Store::builder("db", backend)
        .password("a")
        .collection(tasks_v2())
        .open()
        .unwrap();
    assert!(store.get("tasks", "t1").unwrap().is_some());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_disjoint_updates_both_persist() {
    let store = Store::builder("db", Arc::new(MemoryBackend::new()))
        .collection(CollectionSchema::new(
            "counters",
            vec![
                FieldDef::optional("a", FieldType::Int),
                FieldDef::optional("b", FieldType::Int),
            ],
        ))
        .open()
        .unwrap();
    store.insert("counters", json!({"id": "c"})).unwrap();

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|field| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 1..=25 {
                    store
                        .update("counters", "c", |mut fields| {
                            fields.insert(field.to_string(), json!(i));
                            fields
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let doc = store.get("counters", "c").unwrap().unwrap();
    assert_eq!(doc.get("a"), Some(&json!(25)));
    assert_eq!(doc.get("b"), Some(&json!(25)));
    assert_eq!(doc.metadata.revision, 51);
}

// ============================================================================
// Live queries
// ============================================================================

#[tokio::test]
async fn observe_emits_current_then_changes() {
    let store = Store::builder("db", Arc::new(MemoryBackend::new()))
        .collection(tasks_v2())
        .open()
        .unwrap();

    let mut stream = store.observe("tasks", "t1").unwrap();
    assert_eq!(stream.next().await, Some(None));

    store
        .insert("tasks", json!({"id": "t1", "title": "a"}))
        .unwrap();
    let inserted = stream.next().await.unwrap().unwrap();
    assert_eq!(inserted.get("title"), Some(&json!("a")));

    store.remove("tasks", "t1").unwrap();
    assert_eq!(stream.next().await, Some(None));
}

#[tokio::test]
async fn observe_all_tracks_collection() {
    let store = Store::builder("db", Arc::new(MemoryBackend::new()))
        .collection(tasks_v2())
        .open()
        .unwrap();
    store
        .insert("tasks", json!({"id": "t1", "title": "a"}))
        .unwrap();

    let mut stream = store.observe_all("tasks").unwrap();
    assert_eq!(stream.next().await.unwrap().len(), 1);

    store
        .insert("tasks", json!({"id": "t2", "title": "b"}))
        .unwrap();
    assert_eq!(stream.next().await.unwrap().len(), 2);
}

#[tokio::test]
async fn change_events_carry_origin() {
    let store = Store::builder("db", Arc::new(MemoryBackend::new()))
        .collection(tasks_v2())
        .open()
        .unwrap();
    let mut events = store.subscribe();

    store
        .insert("tasks", json!({"id": "t1", "title": "a"}))
        .unwrap();
    let fields = json!({"title": "b"}).as_object().cloned().unwrap();
    store
        .apply_remote(
            "tasks",
            vec![ferry_engine::Document::from_flat("t1".into(), fields, false)
                .with_remote_rev(Some("2-x".into()))],
        )
        .unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!((first.kind, first.origin), (ChangeKind::Insert, Origin::Local));
    let second = events.recv().await.unwrap();
    assert_eq!((second.kind, second.origin), (ChangeKind::Update, Origin::Remote));
}

// ============================================================================
// Properties
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn migration_chain_is_idempotent(title in "[a-z]{1,12}", completed in any::<bool>()) {
            let schema = tasks_v2();
            let doc = json!({"title": title, "completed": completed})
                .as_object()
                .cloned()
                .unwrap();

            let once = schema.migrate(doc, 0).unwrap();
            let twice = schema.migrate(once.clone(), 0).unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert!(schema.validate_payload(&once).is_ok());
        }

        #[test]
        fn checkpoint_never_decreases(sequence in proptest::collection::vec(0u64..1000, 1..30)) {
            let store = Store::builder("db", Arc::new(MemoryBackend::new()))
                .collection(tasks_v2())
                .open()
                .unwrap();

            let mut highest = 0;
            for seq in sequence {
                let current = store.advance_checkpoint("tasks", Checkpoint::from(seq)).unwrap();
                highest = highest.max(seq);
                prop_assert_eq!(current.ordinal(), Some(highest));
            }
            prop_assert_eq!(store.checkpoint("tasks").unwrap().ordinal(), Some(highest));
        }
    }
}
