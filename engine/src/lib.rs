//! # Ferry Engine
//!
//! A durable, schema-versioned document store for local-first applications.
//!
//! This crate holds everything that lives on the device: typed document
//! collections, their on-disk schema evolution, optional at-rest encryption
//! and the bookkeeping a replicator needs (pending changes, checkpoints,
//! remote revision tokens). It never talks to the network; `ferry-sync`
//! drives replication on top of it.
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] is a flat JSON object with:
//! - A collection-unique id
//! - Store-managed `createdAt`/`updatedAt` timestamps (strictly increasing)
//! - A local revision counter used for optimistic concurrency
//! - The schema version its fields conform to
//! - A tombstone flag, so deletions replicate
//!
//! ### Schemas and migrations
//!
//! Each collection is described by a [`CollectionSchema`] with an ordered
//! chain of pure migration steps. Opening a store brings every persisted
//! document up to the registered version exactly once and records that in
//! a [`CollectionMetadataRecord`].
//!
//! ### Concurrency
//!
//! [`Store::update`] is an atomic read-modify-write: the caller's mutator
//! runs outside the lock and only commits if nobody wrote the document in
//! between, otherwise it is retried with the fresh document.
//!
//! ### Recovery
//!
//! [`RecoveryManager`] resets a store whose local state can no longer be
//! opened (changed passphrase, missing migration) when running in
//! [`RecoveryMode::Development`].
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{CollectionSchema, FieldDef, FieldType, MemoryBackend, Store};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Describe a collection
//! let tasks = CollectionSchema::new(
//!     "tasks",
//!     vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("status", FieldType::String),
//!     ],
//! );
//!
//! // 2. Open a store
//! let store = Store::builder("kernel_db", Arc::new(MemoryBackend::new()))
//!     .collection(tasks)
//!     .open()
//!     .unwrap();
//!
//! // 3. Write
//! store.insert("tasks", json!({"id": "t1", "title": "Write docs"})).unwrap();
//! store
//!     .update("tasks", "t1", |mut fields| {
//!         fields.insert("status".into(), json!("done"));
//!         fields
//!     })
//!     .unwrap();
//!
//! // 4. Read
//! let doc = store.get("tasks", "t1").unwrap().unwrap();
//! assert_eq!(doc.get("status"), Some(&json!("done")));
//! assert_eq!(store.pending_changes("tasks", 10).unwrap().len(), 1);
//! ```
//!
//! ## Persistence
//!
//! Stores persist through a [`StorageBackend`]: [`FileBackend`] keeps one
//! directory per store with one JSON file per collection plus `_meta.json`;
//! [`MemoryBackend`] keeps everything in memory.

pub mod checkpoint;
pub mod clock;
pub mod crypto;
pub mod document;
pub mod error;
pub mod migration;
pub mod observe;
pub mod reconcile;
pub mod recovery;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod typed;

// Re-export main types at crate root
pub use checkpoint::Checkpoint;
pub use clock::{MonotonicClock, SystemTime, TimeSource};
pub use document::{Document, Metadata, Origin};
pub use error::{Error, ErrorKind, Result};
pub use migration::{CollectionMetadataRecord, MigrationPlan};
pub use observe::{ChangeEvent, ChangeKind};
pub use reconcile::{MergeStrategy, Resolution};
pub use recovery::{RecoveryManager, RecoveryMode};
pub use schema::{CollectionSchema, FieldDef, FieldType, MigrationStep, Model, SchemaShape};
pub use snapshot::{CollectionSnapshot, StoreHeader, SNAPSHOT_FORMAT_VERSION};
pub use storage::{FileBackend, MemoryBackend, StorageBackend};
pub use store::{RemoteApply, Store, StoreBuilder, SyncAck, MAX_UPDATE_ATTEMPTS};
pub use typed::TypedCollection;

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
pub type Revision = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
