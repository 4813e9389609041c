//! # Ferry Sync
//!
//! Bidirectional replication between a [`ferry_engine::Store`] and a
//! CouchDB-compatible document server.
//!
//! ## Architecture
//!
//! ```text
//! SyncCoordinator ── one per session
//!   └─ ReplicationEngine ── one per collection, own timer and task
//!        ├─ RemoteDatabase (CouchClient over reqwest)
//!        └─ Store (pending changes, apply_remote, checkpoints)
//! ```
//!
//! Every collection replicates into its own per-user database named
//! `{prefix}-{userId}-{collection}`. A cycle pulls the change feed from the
//! stored checkpoint and then pushes pending local writes with a single
//! `_bulk_docs` request per batch. Push conflicts are resolved by a
//! [`ConflictHandler`], by default [`MergeResolver`] with
//! [`ferry_engine::MergeStrategy::LatestWins`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferry_engine::{CollectionSchema, FileBackend, Store};
//! use ferry_sync::{Credentials, SyncCoordinator};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::builder("kernel_db", Arc::new(FileBackend::new("./data")))
//!     .collection(CollectionSchema::new("tasks", vec![]))
//!     .open()?;
//!
//! let coordinator = SyncCoordinator::new(store);
//! coordinator
//!     .start("u1", "https://couch.example.com", Credentials::basic("u1", "secret"))
//!     .await?;
//!
//! // ... on logout
//! coordinator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod collections;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod provision;
pub mod remote;
pub mod replication;

pub use auth::{Credentials, TokenProvider};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{Rejection, Result, SyncError};
pub use provision::RemoteProvisioner;
pub use remote::{CouchClient, RemoteDatabase};
pub use replication::{
    ConflictHandler, CycleReport, MergeResolver, Phase, PullBatch, PullReport, PushReport,
    ReplicationEngine, ReplicationEvent, ReplicationHandle, ReplicationOptions, ReplicationState,
};
