//! A simulated client of the gateway's public API.
//!
//! Every successful write is recorded in the session cache (`doc id -> rev id`). Scenarios
//! compare the cache against what the changes feed delivered.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use testkit_common::pool::WorkerPool;
use tracing::{debug, error, info, warn};

use crate::admin::AllDocs;
use crate::changes::{ChangesFeedTracker, ChangesResponse, Sequence};
use crate::client;
use crate::error::{ApiError, ChangesFeedError, UserError};

const LOCAL_DOC_PREFIX: &str = "_local/";

#[derive(Debug, Clone, Deserialize)]
pub struct DocWriteResponse {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Normal,
    Longpoll,
    Continuous,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangesFilter {
    #[serde(rename = "sync_gateway/bychannel")]
    ByChannel,
}

/// Parameters of a one-off `_changes` request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Sequence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_docs: Option<bool>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_channels"
    )]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ChangesFilter>,
}

fn serialize_channels<S>(channels: &Option<Vec<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match channels {
        Some(channels) => serializer.serialize_str(&channels.join(",")),
        None => serializer.serialize_none(),
    }
}

/// A user bound to one database on one gateway.
#[derive(Debug)]
pub struct UserSession {
    client: reqwest::Client,
    public_url: String,
    db: String,
    name: String,
    password: String,
    channels: Vec<String>,
    pool: WorkerPool,
    cache: Mutex<BTreeMap<String, String>>,
    last_changes: Mutex<Option<ChangesResponse>>,
}

impl UserSession {
    pub fn new(
        client: reqwest::Client,
        public_url: &str,
        db: &str,
        name: &str,
        password: &str,
        channels: Vec<String>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            client,
            public_url: public_url.trim_end_matches('/').to_owned(),
            db: db.to_owned(),
            name: name.to_owned(),
            password: password.to_owned(),
            channels,
            pool,
            cache: Mutex::new(BTreeMap::new()),
            last_changes: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Snapshot of `doc id -> rev id` for every document this user wrote.
    pub fn cache(&self) -> BTreeMap<String, String> {
        self.cache_guard().clone()
    }

    /// A new tracker for this user's view of the changes feed.
    pub fn changes_tracker(&self) -> Result<ChangesFeedTracker, ChangesFeedError> {
        Ok(ChangesFeedTracker::new(&self.public_url, &self.db)?
            .with_credentials(&self.name, &self.password))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.public_url, self.db, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!(user = %self.name, %method, %url, "request");

        self.client
            .request(method, url)
            .basic_auth(&self.name, Some(&self.password))
    }

    fn new_doc_body(&self, content: Option<Value>) -> Value {
        let mut body = Map::new();
        body.insert("updates".to_owned(), json!(0));

        if !self.channels.is_empty() {
            body.insert("channels".to_owned(), json!(self.channels));
        }

        if let Some(content) = content {
            body.insert("content".to_owned(), content);
        }

        Value::Object(body)
    }

    /// Create a document. Without an id the gateway picks one. Returns the document id.
    pub async fn add_doc(
        &self,
        doc_id: Option<&str>,
        content: Option<Value>,
    ) -> Result<String, UserError> {
        let body = self.new_doc_body(content);

        let request = match doc_id {
            None => self.request(reqwest::Method::POST, ""),
            Some(doc_id) => self.request(reqwest::Method::PUT, doc_id),
        };

        let written: DocWriteResponse = client::send_json(request.json(&body)).await?;
        let rev = written
            .rev
            .ok_or_else(|| UserError::MissingRev(written.id.clone()))?;

        // Local docs never show up on the changes feed.
        if !written.id.starts_with(LOCAL_DOC_PREFIX) {
            self.cache_guard().insert(written.id.clone(), rev);
        }

        Ok(written.id)
    }

    /// Create documents in one `_bulk_docs` request.
    pub async fn add_bulk_docs(&self, doc_ids: &[String]) -> Result<Vec<String>, UserError> {
        let docs: Vec<Value> = doc_ids
            .iter()
            .map(|doc_id| {
                let mut doc = self.new_doc_body(None);
                doc["_id"] = json!(doc_id);
                doc
            })
            .collect();

        let written: Vec<DocWriteResponse> = client::send_json(
            self.request(reqwest::Method::POST, "_bulk_docs")
                .json(&json!({"docs": docs})),
        )
        .await?;

        if written.len() != doc_ids.len() {
            return Err(UserError::BulkMismatch {
                expected: doc_ids.len(),
                returned: written.len(),
            });
        }

        let mut cache = self.cache_guard();
        let mut ids = Vec::with_capacity(written.len());
        for doc in written {
            let rev = doc.rev.ok_or_else(|| UserError::MissingRev(doc.id.clone()))?;
            cache.insert(doc.id.clone(), rev);
            ids.push(doc.id);
        }

        Ok(ids)
    }

    /// Create `count` documents, one request each or in a single bulk request.
    ///
    /// Ids are `<prefix><i>`, or random UUIDs without a prefix. HTTP failures are collected as
    /// `(url, status)` instead of stopping the batch.
    pub async fn add_docs(
        &self,
        count: usize,
        bulk: bool,
        name_prefix: Option<&str>,
    ) -> Result<Vec<(String, StatusCode)>, UserError> {
        let doc_ids: Vec<String> = (0..count)
            .map(|i| match name_prefix {
                Some(prefix) => format!("{}{}", prefix, i),
                None => uuid::Uuid::new_v4().to_string(),
            })
            .collect();

        let results = if bulk {
            vec![self.add_bulk_docs(&doc_ids).await.map(|_| ())]
        } else {
            self.pool
                .run_all(
                    doc_ids.iter().map(|doc_id| async move {
                        self.add_doc(Some(doc_id.as_str()), None).await.map(|_| ())
                    }),
                )
                .await
        };

        self.collect_http_errors(results)
    }

    /// Apply `revisions` successive updates to one document. Returns the final revision.
    pub async fn update_doc(
        &self,
        doc_id: &str,
        revisions: usize,
        content: Option<Value>,
    ) -> Result<BTreeMap<String, String>, UserError> {
        let mut updated = BTreeMap::new();

        for _ in 0..revisions {
            let mut doc = self.get_doc(doc_id).await?;

            let updates = doc.get("updates").and_then(Value::as_u64).unwrap_or(0);
            doc["updates"] = json!(updates + 1);
            if let Some(content) = &content {
                doc["content"] = content.clone();
            }

            let written: DocWriteResponse =
                client::send_json(self.request(reqwest::Method::PUT, doc_id).json(&doc)).await?;
            let rev = written
                .rev
                .ok_or_else(|| UserError::MissingRev(doc_id.to_owned()))?;

            self.cache_guard().insert(doc_id.to_owned(), rev.clone());
            updated.insert(doc_id.to_owned(), rev);
        }

        Ok(updated)
    }

    /// Update every cached document `revisions` times, collecting HTTP failures.
    pub async fn update_docs(
        &self,
        revisions: usize,
    ) -> Result<Vec<(String, StatusCode)>, UserError> {
        let doc_ids: Vec<String> = self.cache_guard().keys().cloned().collect();
        if doc_ids.is_empty() {
            warn!(user = %self.name, "no docs to update");
        }

        let results = self
            .pool
            .run_all(doc_ids.iter().map(|doc_id| async move {
                self.update_doc(doc_id, revisions, None).await.map(|_| ())
            }))
            .await;

        self.collect_http_errors(results)
    }

    /// Delete a document at `rev`, or at its current revision when `rev` is `None`.
    pub async fn delete_doc(
        &self,
        doc_id: &str,
        rev: Option<&str>,
    ) -> Result<DocWriteResponse, UserError> {
        let rev = match rev {
            Some(rev) => rev.to_owned(),
            None => {
                let doc = self.get_doc(doc_id).await?;
                doc.get("_rev")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| UserError::MissingRev(doc_id.to_owned()))?
            }
        };

        let deleted: DocWriteResponse = client::send_json(
            self.request(reqwest::Method::DELETE, doc_id)
                .query(&[("rev", rev.as_str())]),
        )
        .await?;

        if let Some(tombstone) = &deleted.rev {
            self.cache_guard().insert(doc_id.to_owned(), tombstone.clone());
        }

        Ok(deleted)
    }

    pub async fn get_doc(&self, doc_id: &str) -> Result<Value, UserError> {
        Ok(client::send_json(self.request(reqwest::Method::GET, doc_id)).await?)
    }

    /// Fetch documents with `_bulk_get`. The multipart response is scanned for JSON parts.
    pub async fn get_docs(&self, doc_ids: &[String]) -> Result<Vec<Value>, UserError> {
        let body = json!({
            "docs": doc_ids.iter().map(|id| json!({"id": id})).collect::<Vec<_>>()
        });

        let request = self.request(reqwest::Method::POST, "_bulk_get").json(&body);
        let response = client::send(request).await?;
        let url = response.url().to_string();
        let text = response
            .text()
            .await
            .map_err(|source| ApiError::Decode { url, source })?;

        text.lines()
            .filter(|line| line.starts_with('{'))
            .map(|line| serde_json::from_str(line).map_err(UserError::from))
            .collect()
    }

    pub async fn get_all_docs(&self) -> Result<AllDocs, UserError> {
        Ok(client::send_json(self.request(reqwest::Method::GET, "_all_docs")).await?)
    }

    /// Issue one `_changes` request. The response is kept for `check_doc_ids_in_changes_feed`.
    pub async fn get_changes(&self, query: &ChangesQuery) -> Result<ChangesResponse, UserError> {
        let changes: ChangesResponse =
            client::send_json(self.request(reqwest::Method::POST, "_changes").json(query)).await?;

        if changes.results.is_empty() {
            warn!(user = %self.name, "got no data in changes feed");
        }

        *self
            .last_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(changes.clone());
        Ok(changes)
    }

    /// Whether every cached doc id appears in the last `get_changes` response.
    /// A doc id listed twice in that response is an error.
    pub async fn check_doc_ids_in_changes_feed(&self) -> Result<bool, UserError> {
        let last_changes = self
            .last_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let results = last_changes.map(|changes| changes.results).unwrap_or_default();

        let mut feed_ids = HashSet::with_capacity(results.len());
        for record in &results {
            if !feed_ids.insert(record.id.as_str()) {
                error!(doc_id = %record.id, "doc id already exists in changes feed");
                return Err(UserError::DuplicateDocId(record.id.clone()));
            }
        }

        let mut missing = 0;
        for doc_id in self.cache_guard().keys() {
            if !feed_ids.contains(doc_id.as_str()) {
                error!(doc_id = %doc_id, user = %self.name, "doc id missing from changes feed");
                missing += 1;
            }
        }

        Ok(missing == 0)
    }

    fn collect_http_errors(
        &self,
        results: Vec<Result<(), UserError>>,
    ) -> Result<Vec<(String, StatusCode)>, UserError> {
        let mut http_errors = Vec::new();

        for result in results {
            match result {
                Ok(()) => {}
                Err(UserError::Api(ApiError::Status { url, status, .. })) => {
                    info!(user = %self.name, %url, %status, "request failed");
                    http_errors.push((url, status));
                }
                Err(error) => return Err(error),
            }
        }

        Ok(http_errors)
    }

    fn cache_guard(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
