//! Remote database access.
//!
//! [`RemoteDatabase`] is the seam between replication and the network.
//! [`CouchClient`] implements it over the CouchDB HTTP API with `reqwest`.

use crate::auth::Credentials;
use crate::error::{Result, SyncError};
use crate::protocol::{
    decode_document, AllDocsRequest, AllDocsResponse, AllDocsRow, BulkDocsRequest,
    BulkDocsResult, ChangesResponse, ErrorBody,
};
use async_trait::async_trait;
use ferry_engine::{Checkpoint, Document};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, trace};

/// One remote database.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Database name, for logging.
    fn name(&self) -> &str;

    /// Changes after `since`, at most `limit` rows, with bodies.
    async fn changes(&self, since: &Checkpoint, limit: usize) -> Result<ChangesResponse>;

    /// Current revision of each id the remote knows. Unknown ids are absent.
    async fn revisions(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// `_all_docs` rows for `ids` with bodies included.
    async fn all_docs_with_docs(&self, ids: &[String]) -> Result<Vec<AllDocsRow>>;

    /// Latest revision of one document. A deleted document comes back as a
    /// tombstone; `None` means the remote never had it.
    async fn get_latest(&self, id: &str) -> Result<Option<Document>>;

    /// Write documents in one request, one result per document.
    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkDocsResult>>;
}

/// CouchDB client bound to a single database.
#[derive(Debug, Clone)]
pub struct CouchClient {
    http: Client,
    db_url: Url,
    db_name: String,
    credentials: Credentials,
}

impl CouchClient {
    /// Client for `{base_url}/{db_name}`.
    pub fn new(
        http: Client,
        base_url: &str,
        db_name: impl Into<String>,
        credentials: Credentials,
    ) -> Result<Self> {
        let db_name = db_name.into();
        let db_url = endpoint(base_url, &[&db_name])?;
        Ok(Self {
            http,
            db_url,
            db_name,
            credentials,
        })
    }

    pub fn url(&self) -> &Url {
        &self.db_url
    }

    fn path(&self, segments: &[&str]) -> Url {
        let mut url = self.db_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.credentials.apply(self.http.request(method, url))
    }

    async fn all_docs(&self, ids: &[String], include_docs: bool) -> Result<Vec<AllDocsRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.path(&["_all_docs"]);
        if include_docs {
            url.query_pairs_mut().append_pair("include_docs", "true");
        }
        let response = self
            .request(Method::POST, url.clone())
            .json(&AllDocsRequest {
                keys: ids.to_vec(),
            })
            .send()
            .await?;
        let body: AllDocsResponse = decode(check_status(response, &url).await?).await?;
        Ok(body.rows)
    }
}

#[async_trait]
impl RemoteDatabase for CouchClient {
    fn name(&self) -> &str {
        &self.db_name
    }

    async fn changes(&self, since: &Checkpoint, limit: usize) -> Result<ChangesResponse> {
        let mut url = self.path(&["_changes"]);
        url.query_pairs_mut()
            .append_pair("style", "all_docs")
            .append_pair("feed", "normal")
            .append_pair("include_docs", "true")
            .append_pair("limit", &limit.to_string())
            .append_pair("since", &since.as_query_param());

        trace!(db = %self.db_name, %since, limit, "Requesting changes");
        let response = self.request(Method::GET, url.clone()).send().await?;
        decode(check_status(response, &url).await?).await
    }

    async fn revisions(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let rows = self.all_docs(ids, false).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let rev = row.rev()?.to_string();
                Some((row.doc_id().to_string(), rev))
            })
            .collect())
    }

    async fn all_docs_with_docs(&self, ids: &[String]) -> Result<Vec<AllDocsRow>> {
        self.all_docs(ids, true).await
    }

    async fn get_latest(&self, id: &str) -> Result<Option<Document>> {
        let mut url = self.path(&[id]);
        url.query_pairs_mut()
            .append_pair("revs", "true")
            .append_pair("latest", "true");

        let response = self.request(Method::GET, url.clone()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            debug!(db = %self.db_name, id, reason = %body.reason, "Document not found on remote");
            return Ok((body.reason == "deleted").then(|| Document::tombstone(id)));
        }

        let body: Map<String, Value> = decode(check_status(response, &url).await?).await?;
        Ok(Some(decode_document(id, body)))
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkDocsResult>> {
        let url = self.path(&["_bulk_docs"]);
        let count = docs.len();
        let response = self
            .request(Method::POST, url.clone())
            .json(&BulkDocsRequest { docs })
            .send()
            .await?;
        let results: Vec<BulkDocsResult> = decode(check_status(response, &url).await?).await?;
        trace!(db = %self.db_name, sent = count, results = results.len(), "Bulk write finished");
        Ok(results)
    }
}

/// `base` with `segments` appended as percent-encoded path segments.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let invalid = |reason: String| SyncError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base URL".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn a non-success response into [`SyncError::Status`].
pub(crate) async fn check_status(response: Response, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Status {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| SyncError::Decode(e.to_string()))
}
