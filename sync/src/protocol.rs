//! CouchDB wire format.
//!
//! Remote documents are flat JSON objects keyed by `_id` and versioned by
//! `_rev`. Locally the key lives in the collection's primary key field and
//! every `_`-prefixed field is dropped, except that `_rev` is kept as the
//! document's remote revision token and `_deleted` becomes the tombstone
//! flag.

use ferry_engine::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ids of design documents, which never replicate into local collections.
pub const DESIGN_PREFIX: &str = "_design/";

pub fn is_design_document(id: &str) -> bool {
    id.starts_with(DESIGN_PREFIX)
}

/// Response of `GET /{db}/_changes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    #[serde(default)]
    pub last_seq: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<u64>,
}

/// One row of the change feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    #[serde(default)]
    pub seq: Value,
    #[serde(default)]
    pub changes: Vec<RevisionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ChangeRow {
    /// Decode the row into a local document. Returns `None` for rows that
    /// carry no body and are not deletions.
    pub fn into_document(self) -> Option<Document> {
        match self.doc {
            Some(body) => Some(decode_document(&self.id, body)),
            None if self.deleted => {
                let rev = self.changes.into_iter().next().map(|c| c.rev);
                Some(Document::tombstone(self.id).with_remote_rev(rev))
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// Body of `POST /{db}/_bulk_docs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    pub docs: Vec<Value>,
}

/// Per-document result of `_bulk_docs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDocsResult {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What happened to one pushed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    Saved { rev: Option<String> },
    Conflict,
    Rejected { error: String, reason: String },
}

impl BulkDocsResult {
    pub fn saved(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: Some(true),
            rev: Some(rev.into()),
            ..Default::default()
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(error.into()),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn outcome(&self) -> BulkOutcome {
        match self.error.as_deref() {
            None => BulkOutcome::Saved {
                rev: self.rev.clone(),
            },
            Some("conflict") => BulkOutcome::Conflict,
            Some(error) => BulkOutcome::Rejected {
                error: error.to_string(),
                reason: self.reason.clone().unwrap_or_default(),
            },
        }
    }
}

/// Body of `POST /{db}/_all_docs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllDocsRequest {
    pub keys: Vec<String>,
}

/// Response of `POST /{db}/_all_docs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllDocsResponse {
    #[serde(default)]
    pub rows: Vec<AllDocsRow>,
}

/// One row of `_all_docs`. Keys the database has never seen come back
/// with `error: "not_found"` and no value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllDocsRow {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RowValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowValue {
    pub rev: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl AllDocsRow {
    /// Document id of the row, falling back to the requested key.
    pub fn doc_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.key)
    }

    /// Current remote revision, if the document exists or existed.
    pub fn rev(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.rev.as_str())
    }

    /// Decode the row into a local document: the body when included, a
    /// tombstone for deleted rows, `None` otherwise.
    pub fn into_document(self) -> Option<Document> {
        let id = self.doc_id().to_string();
        match (self.doc, self.value) {
            (Some(body), _) => Some(decode_document(&id, body)),
            (None, Some(value)) if value.deleted => {
                Some(Document::tombstone(id).with_remote_rev(Some(value.rev)))
            }
            _ => None,
        }
    }
}

/// Body of a CouchDB error response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

/// Body of `PUT /{db}/_security`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityObject {
    #[serde(default)]
    pub admins: SecurityGroup,
    #[serde(default)]
    pub members: SecurityGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SecurityObject {
    /// Only `user` may read or write the database.
    pub fn sole_member(user: impl Into<String>) -> Self {
        Self {
            admins: SecurityGroup::default(),
            members: SecurityGroup {
                names: vec![user.into()],
                roles: Vec::new(),
            },
        }
    }
}

/// Turn a remote document body into a local document.
pub fn decode_document(fallback_id: &str, mut body: Map<String, Value>) -> Document {
    let id = match body.remove("_id") {
        Some(Value::String(id)) => id,
        _ => fallback_id.to_string(),
    };
    let rev = match body.remove("_rev") {
        Some(Value::String(rev)) => Some(rev),
        _ => None,
    };
    let deleted = matches!(body.remove("_deleted"), Some(Value::Bool(true)));
    body.retain(|key, _| !key.starts_with('_'));
    Document::from_flat(id, body, deleted).with_remote_rev(rev)
}

/// Turn a local document into a remote body, carrying `rev` when the
/// remote already has a version of it.
pub fn encode_document(doc: &Document, rev: Option<&str>) -> Value {
    let mut body = doc.to_json_with_key("_id");
    if let (Some(rev), Value::Object(obj)) = (rev, &mut body) {
        obj.insert("_rev".into(), Value::String(rev.to_string()));
    }
    body
}
