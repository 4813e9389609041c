//! Replication between a local collection and a remote database.

mod engine;
mod events;
mod state;

pub use engine::{
    ConflictHandler, CycleReport, MergeResolver, PullBatch, PullReport, PushReport,
    ReplicationEngine, ReplicationHandle, ReplicationOptions, DEFAULT_BATCH_SIZE,
    DEFAULT_PULL_INTERVAL,
};
pub use events::ReplicationEvent;
pub use state::{Phase, ReplicationState};
