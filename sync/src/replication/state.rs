//! Observable replication state.

use ferry_engine::Checkpoint;
use serde::Serialize;
use std::fmt;

/// Where a replication engine is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Pulling,
    Pushing,
    /// Terminal; the engine never runs again
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Pulling => "pulling",
            Phase::Pushing => "pushing",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of one collection's replication.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationState {
    pub collection: String,
    /// Remote database name
    pub database: String,
    /// Last checkpoint durably applied
    pub checkpoint: Checkpoint,
    /// Whether cycles repeat on the interval
    pub live: bool,
    pub phase: Phase,
    /// Message of the most recent failed cycle, cleared by a successful one
    pub last_error: Option<String>,
    /// Completed cycles since the engine started
    pub cycles: u64,
}

impl ReplicationState {
    pub fn new(collection: impl Into<String>, database: impl Into<String>, checkpoint: Checkpoint, live: bool) -> Self {
        Self {
            collection: collection.into(),
            database: database.into(),
            checkpoint,
            live,
            phase: Phase::Idle,
            last_error: None,
            cycles: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Stopped
    }
}
