//! Documents and their bookkeeping metadata.

use crate::{DocumentId, Revision, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names the store manages itself; callers cannot set them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Where the latest write to a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written through the local CRUD API
    Local,
    /// Applied from the remote during pull or conflict resolution
    Remote,
}

/// Bookkeeping kept next to every document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the document was first written (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the document was last written (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Local write counter, bumped on every mutation
    pub revision: Revision,
    /// Schema version the fields conform to
    pub schema_version: SchemaVersion,
    /// Source of the latest write
    pub origin: Origin,
    /// Last revision the remote acknowledged, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_revision: Option<Revision>,
    /// Remote revision token (`_rev`) last seen for this document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_rev: Option<String>,
}

/// A document in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Primary key, unique within the collection
    pub id: DocumentId,
    /// Collection-specific fields
    pub fields: Map<String, Value>,
    pub metadata: Metadata,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    pub(crate) fn new_local(
        id: DocumentId,
        fields: Map<String, Value>,
        timestamp: Timestamp,
        schema_version: SchemaVersion,
    ) -> Self {
        Self {
            id,
            fields,
            metadata: Metadata {
                created_at: timestamp,
                updated_at: timestamp,
                revision: 1,
                schema_version,
                origin: Origin::Local,
                synced_revision: None,
                remote_rev: None,
            },
            deleted: false,
        }
    }

    /// Build a document from a flat JSON object as the remote sends it,
    /// after the remote key has been normalized into `id`.
    ///
    /// `createdAt`/`updatedAt` are taken from the object when present and
    /// removed from the fields.
    pub fn from_flat(id: DocumentId, mut fields: Map<String, Value>, deleted: bool) -> Self {
        fields.remove("id");
        let created_at = take_timestamp(&mut fields, "createdAt").unwrap_or(0);
        let updated_at = take_timestamp(&mut fields, "updatedAt").unwrap_or(created_at);
        Self {
            id,
            fields,
            metadata: Metadata {
                created_at,
                updated_at,
                revision: 0,
                schema_version: 0,
                origin: Origin::Remote,
                synced_revision: None,
                remote_rev: None,
            },
            deleted,
        }
    }

    /// Attach the remote revision token the document was fetched at.
    pub fn with_remote_rev(mut self, rev: Option<String>) -> Self {
        self.metadata.remote_rev = rev;
        self
    }

    /// A tombstone for a document known only by id.
    pub fn tombstone(id: impl Into<DocumentId>) -> Self {
        Self::from_flat(id.into(), Map::new(), true)
    }

    /// Check if the document is live (not a tombstone).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the latest local write has not reached the remote yet.
    pub fn is_pending(&self) -> bool {
        self.metadata.origin == Origin::Local
            && self.metadata.synced_revision != Some(self.metadata.revision)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Flat JSON view: fields plus `id`, `createdAt` and `updatedAt`, with
    /// `primary_key` naming the id field.
    pub fn to_json_with_key(&self, primary_key: &str) -> Value {
        let mut obj = self.fields.clone();
        obj.insert(primary_key.to_string(), Value::String(self.id.clone()));
        obj.insert("createdAt".into(), Value::from(self.metadata.created_at));
        obj.insert("updatedAt".into(), Value::from(self.metadata.updated_at));
        if self.deleted {
            obj.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(obj)
    }

    /// Flat JSON view keyed on `id`.
    pub fn to_json(&self) -> Value {
        self.to_json_with_key("id")
    }

    pub(crate) fn write_fields(
        &mut self,
        fields: Map<String, Value>,
        timestamp: Timestamp,
        origin: Origin,
    ) {
        self.fields = fields;
        self.touch(timestamp, origin);
    }

    pub(crate) fn mark_deleted(&mut self, timestamp: Timestamp, origin: Origin) {
        self.deleted = true;
        self.touch(timestamp, origin);
    }

    fn touch(&mut self, timestamp: Timestamp, origin: Origin) {
        self.metadata.revision += 1;
        self.metadata.updated_at = timestamp.max(self.metadata.updated_at + 1);
        self.metadata.origin = origin;
    }
}

/// Remove the store-managed keys from caller-supplied fields.
pub(crate) fn strip_reserved(fields: &mut Map<String, Value>, primary_key: &str) {
    for key in RESERVED_FIELDS {
        fields.remove(key);
    }
    fields.remove(primary_key);
}

fn take_timestamp(fields: &mut Map<String, Value>, key: &str) -> Option<Timestamp> {
    match fields.remove(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.timestamp_millis().max(0) as Timestamp),
        _ => None,
    }
}
