//! In-process mock of the CouchDB endpoints replication uses.
//!
//! Revisions are `{n}-{hash}`, sequences are plain integers per database.
//! Failures can be injected per endpoint.

#![allow(dead_code)]

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, head},
    Json, Router,
};
use ferry_sync::protocol::{
    AllDocsRequest, AllDocsResponse, AllDocsRow, BulkDocsRequest, BulkDocsResult, ChangeRow,
    ChangesResponse, RevisionRef, RowValue,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: String,
    generation: u64,
    seq: u64,
    body: Map<String, Value>,
    deleted: bool,
}

impl StoredDoc {
    fn full_body(&self, id: &str) -> Map<String, Value> {
        let mut body = if self.deleted {
            Map::new()
        } else {
            self.body.clone()
        };
        body.insert("_id".into(), json!(id));
        body.insert("_rev".into(), json!(self.rev));
        if self.deleted {
            body.insert("_deleted".into(), json!(true));
        }
        body
    }
}

#[derive(Debug, Default)]
struct Database {
    docs: BTreeMap<String, StoredDoc>,
    seq: u64,
}

impl Database {
    fn write(&mut self, id: &str, body: Map<String, Value>, deleted: bool) -> String {
        self.seq += 1;
        let generation = self.docs.get(id).map_or(0, |d| d.generation) + 1;
        let rev = format!("{}-{}", generation, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        self.docs.insert(
            id.to_string(),
            StoredDoc {
                rev: rev.clone(),
                generation,
                seq: self.seq,
                body,
                deleted,
            },
        );
        rev
    }
}

#[derive(Debug, Default)]
struct MockState {
    dbs: HashMap<String, Database>,
    security: HashMap<String, Value>,
    /// Writes another device makes right before the next `_bulk_docs`
    interleaved: Vec<(String, String, Map<String, Value>)>,
    /// `_changes` requests still to answer with 503
    failing_changes: usize,
    /// Ids `_bulk_docs` refuses, with error and reason
    rejections: HashMap<String, (String, String)>,
    requests: Vec<String>,
    authorization: Option<String>,
}

impl MockState {
    fn record(&mut self, method: &str, path: String, headers: &HeaderMap) {
        self.requests.push(format!("{method} {path}"));
        self.authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
    }
}

type Shared = Arc<Mutex<MockState>>;

/// A running mock server.
#[derive(Clone)]
pub struct MockCouch {
    pub url: String,
    state: Shared,
}

impl MockCouch {
    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/{db}", head(head_db).put(put_db))
            .route(
                "/{db}/{segment}",
                get(get_segment).post(post_segment).put(put_segment),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Write a document as another client would. Returns the new revision.
    pub fn put_doc(&self, db: &str, id: &str, body: Value) -> String {
        let body = body.as_object().cloned().unwrap_or_default();
        self.state.lock().dbs.entry(db.into()).or_default().write(id, body, false)
    }

    pub fn delete_doc(&self, db: &str, id: &str) -> String {
        self.state
            .lock()
            .dbs
            .entry(db.into())
            .or_default()
            .write(id, Map::new(), true)
    }

    /// Body of a live document, without `_` fields.
    pub fn doc(&self, db: &str, id: &str) -> Option<Map<String, Value>> {
        let state = self.state.lock();
        let doc = state.dbs.get(db)?.docs.get(id)?;
        (!doc.deleted).then(|| doc.body.clone())
    }

    pub fn rev(&self, db: &str, id: &str) -> Option<String> {
        let state = self.state.lock();
        Some(state.dbs.get(db)?.docs.get(id)?.rev.clone())
    }

    pub fn is_deleted(&self, db: &str, id: &str) -> bool {
        let state = self.state.lock();
        state
            .dbs
            .get(db)
            .and_then(|d| d.docs.get(id))
            .is_some_and(|d| d.deleted)
    }

    pub fn doc_count(&self, db: &str) -> usize {
        let state = self.state.lock();
        state
            .dbs
            .get(db)
            .map_or(0, |d| d.docs.values().filter(|doc| !doc.deleted).count())
    }

    /// Make the next write land at sequence `seq + 1`.
    pub fn set_sequence(&self, db: &str, seq: u64) {
        self.state.lock().dbs.entry(db.into()).or_default().seq = seq;
    }

    pub fn create_db(&self, db: &str) {
        self.state.lock().dbs.entry(db.into()).or_default();
    }

    pub fn has_db(&self, db: &str) -> bool {
        self.state.lock().dbs.contains_key(db)
    }

    pub fn security(&self, db: &str) -> Option<Value> {
        self.state.lock().security.get(db).cloned()
    }

    /// Another device writes `id` between our revision lookup and our
    /// bulk write.
    pub fn interleave(&self, db: &str, id: &str, body: Value) {
        let body = body.as_object().cloned().unwrap_or_default();
        self.state
            .lock()
            .interleaved
            .push((db.into(), id.into(), body));
    }

    pub fn fail_next_changes(&self, count: usize) {
        self.state.lock().failing_changes = count;
    }

    pub fn reject(&self, id: &str, error: &str, reason: &str) {
        self.state
            .lock()
            .rejections
            .insert(id.into(), (error.into(), reason.into()));
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().requests.clone()
    }

    pub fn count_requests(&self, needle: &str) -> usize {
        self.requests().iter().filter(|r| r.contains(needle)).count()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.lock().authorization.clone()
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn not_found(reason: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "reason": reason})),
    )
        .into_response()
}

fn leading_number(value: Option<&String>) -> u64 {
    value
        .map(|v| v.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

async fn head_db(
    State(state): State<Shared>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let mut state = state.lock();
    state.record("HEAD", db.clone(), &headers);
    if state.dbs.contains_key(&db) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_db(
    State(state): State<Shared>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock();
    state.record("PUT", db.clone(), &headers);
    if state.dbs.contains_key(&db) {
        return (
            StatusCode::PRECONDITION_FAILED,
            Json(json!({"error": "file_exists", "reason": "The database could not be created."})),
        )
            .into_response();
    }
    state.dbs.insert(db, Database::default());
    (StatusCode::CREATED, Json(json!({"ok": true}))).into_response()
}

async fn get_segment(
    State(state): State<Shared>,
    Path((db, segment)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock();
    state.record("GET", format!("{db}/{segment}"), &headers);

    if segment == "_changes" {
        if state.failing_changes > 0 {
            state.failing_changes -= 1;
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "unavailable", "reason": "injected"})),
            )
                .into_response();
        }

        let since = leading_number(params.get("since"));
        let limit = params
            .get("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(usize::MAX);
        let database = state.dbs.entry(db).or_default();

        let mut changed: Vec<_> = database
            .docs
            .iter()
            .filter(|(_, doc)| doc.seq > since)
            .collect();
        changed.sort_by_key(|(_, doc)| doc.seq);
        changed.truncate(limit);

        let last_seq = changed.last().map_or(since, |(_, doc)| doc.seq);
        let results = changed
            .into_iter()
            .map(|(id, doc)| ChangeRow {
                id: id.clone(),
                seq: json!(doc.seq),
                changes: vec![RevisionRef {
                    rev: doc.rev.clone(),
                }],
                doc: Some(doc.full_body(id)),
                deleted: doc.deleted,
            })
            .collect();

        return Json(ChangesResponse {
            results,
            last_seq: json!(last_seq),
            pending: None,
        })
        .into_response();
    }

    let Some(doc) = state.dbs.get(&db).and_then(|d| d.docs.get(&segment)) else {
        return not_found("missing");
    };
    if doc.deleted {
        return not_found("deleted");
    }
    Json(Value::Object(doc.full_body(&segment))).into_response()
}

async fn post_segment(
    State(state): State<Shared>,
    Path((db, segment)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock();
    state.record("POST", format!("{db}/{segment}"), &headers);

    match segment.as_str() {
        "_all_docs" => {
            let request: AllDocsRequest = serde_json::from_value(body).unwrap_or_default();
            let include_docs = params.get("include_docs").is_some_and(|v| v == "true");
            let database = state.dbs.entry(db).or_default();
            let rows = request
                .keys
                .into_iter()
                .map(|key| match database.docs.get(&key) {
                    Some(doc) => AllDocsRow {
                        id: Some(key.clone()),
                        value: Some(RowValue {
                            rev: doc.rev.clone(),
                            deleted: doc.deleted,
                        }),
                        doc: (include_docs && !doc.deleted).then(|| doc.full_body(&key)),
                        key,
                        error: None,
                    },
                    None => AllDocsRow {
                        key,
                        error: Some("not_found".into()),
                        ..Default::default()
                    },
                })
                .collect();
            Json(AllDocsResponse { rows }).into_response()
        }
        "_bulk_docs" => {
            let request: BulkDocsRequest = serde_json::from_value(body).unwrap_or_default();

            let interleaved: Vec<_> = std::mem::take(&mut state.interleaved);
            for (target, id, doc) in interleaved {
                state.dbs.entry(target).or_default().write(&id, doc, false);
            }

            let rejections = state.rejections.clone();
            let database = state.dbs.entry(db).or_default();
            let results: Vec<BulkDocsResult> = request
                .docs
                .into_iter()
                .map(|doc| {
                    let mut doc = doc.as_object().cloned().unwrap_or_default();
                    let id = doc
                        .remove("_id")
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let rev = doc.remove("_rev").and_then(|v| v.as_str().map(String::from));
                    let deleted = doc.remove("_deleted") == Some(json!(true));

                    if let Some((error, reason)) = rejections.get(&id) {
                        return BulkDocsResult::failed(id, error.clone(), reason.clone());
                    }
                    let conflict = match (database.docs.get(&id), &rev) {
                        (Some(existing), Some(rev)) => existing.rev != *rev,
                        (Some(existing), None) => !existing.deleted,
                        (None, Some(_)) => true,
                        (None, None) => false,
                    };
                    if conflict {
                        return BulkDocsResult::failed(id, "conflict", "Document update conflict.");
                    }
                    let new_rev = database.write(&id, doc, deleted);
                    BulkDocsResult::saved(id, new_rev)
                })
                .collect();
            (StatusCode::CREATED, Json(results)).into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad_request", "reason": "unsupported"})),
        )
            .into_response(),
    }
}

async fn put_segment(
    State(state): State<Shared>,
    Path((db, segment)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock();
    state.record("PUT", format!("{db}/{segment}"), &headers);
    if segment != "_security" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "bad_request", "reason": "unsupported"})),
        )
            .into_response();
    }
    state.security.insert(db, body);
    Json(json!({"ok": true})).into_response()
}
