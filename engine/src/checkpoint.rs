//! Replication checkpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Opaque remote sequence marker: everything up to here has been pulled.
///
/// CouchDB 1.x reports integer sequences, 2.x and later report strings of
/// the form `"N-opaque"`. Ordering uses the leading integer in both cases;
/// the original value is kept verbatim for the next `since=` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Value);

impl Checkpoint {
    /// The start of the change feed.
    pub fn zero() -> Self {
        Self(Value::from(0))
    }

    pub fn new(sequence: Value) -> Self {
        Self(sequence)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Leading integer of the sequence, if it has one.
    pub fn ordinal(&self) -> Option<u64> {
        match &self.0 {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => {
                let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            }
            _ => None,
        }
    }

    /// The value to send as `since=`.
    pub fn as_query_param(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            Value::Null => "0".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether moving from `self` to `next` keeps the checkpoint monotonic.
    pub fn allows_advance_to(&self, next: &Checkpoint) -> bool {
        // Unparseable sequences are opaque; trust the remote.
        self.compare(next) != Some(Ordering::Greater)
    }

    /// Order by leading integer. `None` when either side has none.
    pub fn compare(&self, other: &Checkpoint) -> Option<Ordering> {
        Some(self.ordinal()?.cmp(&other.ordinal()?))
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_query_param())
    }
}

impl From<u64> for Checkpoint {
    fn from(seq: u64) -> Self {
        Self(Value::from(seq))
    }
}

impl From<&str> for Checkpoint {
    fn from(seq: &str) -> Self {
        Self(Value::String(seq.to_string()))
    }
}
