//! # Changes feed
//!
//! Consumers of a database's `_changes` feed on behalf of one user. A `ChangesFeedTracker` runs
//! either as a long-poll loop or on one continuous connection and accumulates the
//! `(doc id, rev id)` pairs it sees until a termination document arrives or the server ends
//! the session.
//!
//! Ending abnormally is not an `Err`: the caller always gets a `FeedOutcome` with whatever was
//! observed before the feed stopped.
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ChangesFeedError;

/// Ids with this prefix are user records the gateway puts on the feed, never test documents.
pub const BOOKKEEPING_PREFIX: &str = "_user/";

const DEFAULT_POLL_DELAY: time::Duration = time::Duration::from_millis(100);
const LONGPOLL_HEARTBEAT_MS: u64 = 300_000;
const WAIT_POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Position in a changes feed. The gateway reports numbers or compound strings depending on the
/// deployment, so the value is only ever echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sequence {
    Number(u64),
    Text(String),
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence::Text("0".to_owned())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sequence::Number(seq) => write!(f, "{}", seq),
            Sequence::Text(seq) => write!(f, "{}", seq),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevRef {
    pub rev: String,
}

/// One entry of a changes response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default)]
    pub seq: Option<Sequence>,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<RevRef>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

impl ChangeRecord {
    pub fn is_bookkeeping(&self) -> bool {
        self.id.starts_with(BOOKKEEPING_PREFIX)
    }

    /// The included document's `_id`, falling back to the change id.
    pub fn doc_id(&self) -> &str {
        self.doc
            .as_ref()
            .and_then(|doc| doc.get("_id"))
            .and_then(Value::as_str)
            .unwrap_or(&self.id)
    }

    /// The included document's `_rev`, falling back to the first listed change.
    pub fn rev(&self) -> Option<&str> {
        self.doc
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .or_else(|| self.changes.first().map(|change| change.rev.as_str()))
    }

    pub fn to_event(&self) -> Option<ChangeEvent> {
        let rev_id = self.rev()?;

        Some(ChangeEvent {
            doc_id: self.doc_id().to_owned(),
            rev_id: rev_id.to_owned(),
            sequence: self.seq.clone(),
            deleted: self.deleted,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRecord>,
    #[serde(default)]
    pub last_seq: Option<Sequence>,
}

/// A line of a continuous feed: a change, or the closing `last_seq` marker.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedLine {
    Change(ChangeRecord),
    LastSeq { last_seq: Sequence },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub doc_id: String,
    pub rev_id: String,
    pub sequence: Option<Sequence>,
    pub deleted: bool,
}

#[derive(Debug)]
pub enum FeedStatus {
    /// The termination document was seen, or a single shot poll returned.
    Completed,
    /// The server ended a continuous feed.
    Closed,
    /// A request or the stream failed. Events seen before the failure are kept.
    Failed(ChangesFeedError),
}

impl FeedStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, FeedStatus::Failed(_))
    }
}

#[derive(Debug)]
pub struct FeedOutcome {
    pub status: FeedStatus,
    pub events: Vec<ChangeEvent>,
    pub last_sequence: Sequence,
}

impl FeedOutcome {
    /// Latest revision seen for each document.
    pub fn docs(&self) -> BTreeMap<String, String> {
        latest_revs(&self.events)
    }
}

fn latest_revs(events: &[ChangeEvent]) -> BTreeMap<String, String> {
    events
        .iter()
        .map(|event| (event.doc_id.clone(), event.rev_id.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Keep polling until the termination document or an error.
    Loop,
    /// Return after the first response, including one that timed out empty. Responses that
    /// only carry bookkeeping records are skipped.
    SingleShot,
}

#[derive(Debug, Clone, Copy)]
pub struct LongPollOptions {
    /// How long the gateway holds each request open.
    pub timeout: time::Duration,
    pub mode: PollMode,
}

impl Default for LongPollOptions {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_secs(10),
            mode: PollMode::Loop,
        }
    }
}

#[derive(Debug, Default)]
struct FeedState {
    events: Vec<ChangeEvent>,
    seen: HashSet<(String, String)>,
    last_sequence: Sequence,
}

impl FeedState {
    /// Returns false when the pair was already recorded.
    fn record(&mut self, event: ChangeEvent) -> bool {
        if !self
            .seen
            .insert((event.doc_id.clone(), event.rev_id.clone()))
        {
            return false;
        }

        self.events.push(event);
        true
    }
}

/// What applying a batch of changes did to the feed state.
#[derive(Debug, Default, PartialEq, Eq)]
struct Applied {
    changes: usize,
    terminated: bool,
}

/// Changes feed consumer for one user. Each tracker owns its own connection.
///
/// Clones share the accumulated state, so a scenario can run the feed on one task and
/// `wait_until` on another.
#[derive(Clone, Debug)]
pub struct ChangesFeedTracker {
    client: reqwest::Client,
    changes_url: String,
    credentials: Option<(String, String)>,
    termination_doc_id: Option<String>,
    poll_delay: time::Duration,
    state: Arc<Mutex<FeedState>>,
}

impl ChangesFeedTracker {
    pub fn new(public_url: &str, db: &str) -> Result<Self, ChangesFeedError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(ChangesFeedError::Client)?;

        Ok(Self {
            client,
            changes_url: format!("{}/{}/_changes", public_url.trim_end_matches('/'), db),
            credentials: None,
            termination_doc_id: None,
            poll_delay: DEFAULT_POLL_DELAY,
            state: Arc::new(Mutex::new(FeedState::default())),
        })
    }

    pub fn with_credentials(mut self, name: &str, password: &str) -> Self {
        self.credentials = Some((name.to_owned(), password.to_owned()));
        self
    }

    /// Stop once a change for `doc_id` arrives.
    pub fn with_termination_doc(mut self, doc_id: &str) -> Self {
        self.termination_doc_id = Some(doc_id.to_owned());
        self
    }

    pub fn with_poll_delay(mut self, poll_delay: time::Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn changes_url(&self) -> &str {
        &self.changes_url
    }

    /// Latest revision seen for each document so far.
    pub fn docs(&self) -> BTreeMap<String, String> {
        latest_revs(&self.state().events)
    }

    pub fn last_sequence(&self) -> Sequence {
        self.state().last_sequence.clone()
    }

    /// Wait until every `(doc id, rev id)` in `expected` has been seen, up to `timeout`.
    pub async fn wait_until(
        &self,
        expected: &BTreeMap<String, String>,
        timeout: time::Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let missing = {
                let state = self.state();
                expected
                    .iter()
                    .filter(|(doc_id, rev_id)| {
                        !state
                            .seen
                            .contains(&((*doc_id).clone(), (*rev_id).clone()))
                    })
                    .count()
            };

            if missing == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(missing, url = %self.changes_url, "changes feed did not catch up in time");
                return false;
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Run a long-poll session from sequence zero.
    pub async fn long_poll(&self, options: &LongPollOptions) -> FeedOutcome {
        self.reset();
        let status = self.run_long_poll(options).await;
        self.finish(status)
    }

    /// Run a continuous session on one connection until the termination document arrives or
    /// the server closes the stream.
    pub async fn continuous(&self) -> FeedOutcome {
        self.reset();
        let status = self.run_continuous().await;
        self.finish(status)
    }

    /// Run `long_poll` on its own task. A feed can wait indefinitely for its termination
    /// document, so it never takes a worker from a `WorkerPool`.
    pub fn spawn_long_poll(&self, options: LongPollOptions) -> JoinHandle<FeedOutcome> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.long_poll(&options).await })
    }

    /// Run `continuous` on its own task, outside any `WorkerPool`.
    pub fn spawn_continuous(&self) -> JoinHandle<FeedOutcome> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.continuous().await })
    }

    async fn run_long_poll(&self, options: &LongPollOptions) -> FeedStatus {
        let timeout_ms = u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX);

        loop {
            let since = self.last_sequence();
            let body = json!({
                "feed": "longpoll",
                "include_docs": true,
                "style": "all_docs",
                "heartbeat": LONGPOLL_HEARTBEAT_MS,
                "timeout": timeout_ms,
                "since": since,
            });

            let response = match self.post(&body).await {
                Ok(response) => response,
                Err(error) => return FeedStatus::Failed(error),
            };

            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(error) => return FeedStatus::Failed(ChangesFeedError::Stream(error)),
            };

            let changes: ChangesResponse = match serde_json::from_slice(&bytes) {
                Ok(changes) => changes,
                Err(error) => return FeedStatus::Failed(ChangesFeedError::Decode(error)),
            };

            log_duplicate_ids(&changes.results);
            let applied = self.apply(&changes.results);

            if let Some(last_seq) = changes.last_seq {
                debug!(url = %self.changes_url, %last_seq, "long poll advanced");
                self.state().last_sequence = last_seq;
            }

            if applied.terminated {
                info!(url = %self.changes_url, "termination doc found");
                return FeedStatus::Completed;
            }

            // A response with only bookkeeping records is not an answer to a single shot poll.
            let bookkeeping_only = !changes.results.is_empty() && applied.changes == 0;
            if options.mode == PollMode::SingleShot && !bookkeeping_only {
                return FeedStatus::Completed;
            }

            tokio::time::sleep(self.poll_delay).await;
        }
    }

    async fn run_continuous(&self) -> FeedStatus {
        let body = json!({"feed": "continuous", "include_docs": true});

        let response = match self.post(&body).await {
            Ok(response) => response,
            Err(error) => return FeedStatus::Failed(error),
        };

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => return FeedStatus::Failed(ChangesFeedError::Stream(error)),
            };
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();

                match self.apply_line(&line) {
                    Ok(true) => {
                        info!(url = %self.changes_url, "termination doc found, closing feed");
                        return FeedStatus::Completed;
                    }
                    Ok(false) => {}
                    Err(error) => return FeedStatus::Failed(error),
                }
            }
        }

        // The last record may not end with a newline.
        match self.apply_line(&buffer) {
            Ok(true) => FeedStatus::Completed,
            Ok(false) => {
                info!(url = %self.changes_url, "changes feed closed by server");
                FeedStatus::Closed
            }
            Err(error) => FeedStatus::Failed(error),
        }
    }

    /// Apply one continuous feed line. Blank lines are heartbeats.
    fn apply_line(&self, line: &[u8]) -> Result<bool, ChangesFeedError> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(false);
        }

        match serde_json::from_slice::<FeedLine>(line)? {
            FeedLine::Change(record) => {
                if let Some(seq) = &record.seq {
                    self.state().last_sequence = seq.clone();
                }
                Ok(self.apply(std::slice::from_ref(&record)).terminated)
            }
            FeedLine::LastSeq { last_seq } => {
                self.state().last_sequence = last_seq;
                Ok(false)
            }
        }
    }

    /// Record every non-bookkeeping change except the termination document.
    fn apply(&self, records: &[ChangeRecord]) -> Applied {
        let mut applied = Applied::default();
        let mut state = self.state();

        for record in records.iter().filter(|record| !record.is_bookkeeping()) {
            if self.is_termination(record) {
                applied.terminated = true;
                continue;
            }

            applied.changes += 1;

            match record.to_event() {
                Some(event) => {
                    debug!(doc_id = %event.doc_id, rev_id = %event.rev_id, "change");
                    state.record(event);
                }
                None => warn!(doc_id = record.doc_id(), "change without a revision"),
            }
        }

        applied
    }

    fn is_termination(&self, record: &ChangeRecord) -> bool {
        self.termination_doc_id
            .as_deref()
            .is_some_and(|termination| record.doc_id() == termination)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ChangesFeedError> {
        let mut request = self.client.post(&self.changes_url).json(body);
        if let Some((name, password)) = &self.credentials {
            request = request.basic_auth(name, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|source| ChangesFeedError::Request {
                url: self.changes_url.clone(),
                source,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ChangesFeedError::Status {
                url: self.changes_url.clone(),
                status,
                body,
            });
        }

        Ok(response)
    }

    fn reset(&self) {
        *self.state() = FeedState::default();
    }

    fn finish(&self, status: FeedStatus) -> FeedOutcome {
        if let FeedStatus::Failed(error) = &status {
            error!(url = %self.changes_url, "changes feed failed: {}", error);
        }

        let state = self.state();
        FeedOutcome {
            status,
            events: state.events.clone(),
            last_sequence: state.last_sequence.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A document listed twice in one response is logged, never treated as a failure.
fn log_duplicate_ids(records: &[ChangeRecord]) {
    let mut seen = HashSet::new();

    for record in records.iter().filter(|record| !record.is_bookkeeping()) {
        if !seen.insert(record.doc_id()) {
            error!(doc_id = record.doc_id(), "duplicate doc id in changes response");
        }
    }
}
