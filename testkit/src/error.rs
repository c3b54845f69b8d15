use std::path::PathBuf;
use std::time;

use http::StatusCode;
use thiserror::Error;

use crate::cbgt::WriterDiagnostics;
use crate::server_config::DeploymentMode;
use crate::topology::NodeRole;

/// Enumeration of errors that can occur while loading a `ClusterTopology`.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("cluster config not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read cluster config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse cluster config")]
    Parse(#[from] serde_json::Error),
    #[error("functional tests require at least 1 index reader")]
    NoReaders,
    #[error("running in {0} mode but no index writers are defined")]
    NoWriters(DeploymentMode),
    #[error("node {0} is configured as both an index reader and an index writer")]
    OverlappingRoles(String),
    #[error("no storage server is defined")]
    NoStorageServer,
}

/// Enumeration of errors that can occur while reading a gateway server configuration document.
#[derive(Error, Debug)]
pub enum ServerConfigError {
    #[error("failed to read server config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unterminated backtick literal in server config")]
    UnterminatedLiteral,
    #[error("failed to parse server config")]
    Parse(#[from] serde_json::Error),
}

/// Enumeration of errors returned by a single REST call, against a gateway or a storage node.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to construct http client")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether issuing the same request again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => is_retryable_status(*status),
            ApiError::Request { .. } => true,
            ApiError::Client(_) | ApiError::Decode { .. } => false,
        }
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Enumeration of errors raised by the admin surface of a storage server.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("storage nodes did not report healthy within {0:?}")]
    NotReady(time::Duration),
}

/// Enumeration of errors raised while running the process start/stop collaborator.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to launch {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("playbook {playbook} failed with exit code {code:?}")]
    PlaybookFailed { playbook: String, code: Option<i32> },
    #[error("failed to encode playbook variables")]
    Vars(#[from] serde_json::Error),
    #[error("no service is managed for {0} nodes")]
    UnsupportedRole(NodeRole),
}

/// Enumeration of errors raised by `BucketProvisioner`.
/// Every variant but `RetriesExhausted` describes a single failed attempt.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("deleted {deleted} of {attempted} buckets")]
    DeleteIncomplete { deleted: usize, attempted: usize },
    #[error("created {created} of {attempted} buckets")]
    CreateIncomplete { created: usize, attempted: usize },
    #[error("storage node has buckets {actual:?} after provisioning, expected {expected:?}")]
    Mismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("storage error during provisioning")]
    Storage(#[from] StorageError),
    #[error("bucket provisioning failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<ProvisionError>,
    },
}

/// Enumeration of outcomes of a failed shard distribution check.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("at least one index writer is required to validate pindex distribution")]
    NoWriters,
    #[error("pindex {pindex} is assigned to more than one node: {nodes:?}")]
    MultipleOwners { pindex: String, nodes: Vec<String> },
    #[error("{nodes} nodes own pindexes but {writers} index writers are configured")]
    NodeCountMismatch { nodes: usize, writers: usize },
    #[error("node {node} owns {count} pindexes but node {other} owns {other_count}")]
    Imbalanced {
        node: String,
        count: usize,
        other: String,
        other_count: usize,
    },
    #[error("failed to fetch the CBGT config")]
    Api(#[from] ApiError),
}

impl ValidationError {
    /// Fatal errors describe a state that waiting for a rebalance cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ValidationError::NoWriters | ValidationError::MultipleOwners { .. }
        )
    }
}

/// Enumeration of errors that abort `ClusterLifecycle::reset`.
#[derive(Error, Debug)]
pub enum ResetError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    ServerConfig(#[from] ServerConfigError),
    #[error("failed to clear {role} artifacts")]
    ClearArtifacts {
        role: NodeRole,
        #[source]
        source: RunnerError,
    },
    #[error("failed to start {role} services")]
    StartServices {
        role: NodeRole,
        #[source]
        source: RunnerError,
    },
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("storage server is not ready")]
    StorageNotReady(#[source] StorageError),
    #[error("failed to validate CBGT pindex distribution")]
    ShardValidation {
        diagnostics: Vec<WriterDiagnostics>,
        #[source]
        source: Option<ValidationError>,
    },
}

/// Enumeration of errors raised by `UserSession` document operations.
#[derive(Error, Debug)]
pub enum UserError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("response for {0} did not contain a revision")]
    MissingRev(String),
    #[error("bulk docs returned {returned} results for {expected} docs")]
    BulkMismatch { expected: usize, returned: usize },
    #[error("doc id {0} appears more than once in the changes feed")]
    DuplicateDocId(String),
    #[error("failed to decode document payload")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    ChangesFeed(#[from] ChangesFeedError),
}

/// Enumeration of ways a changes feed session can end abnormally.
#[derive(Error, Debug)]
pub enum ChangesFeedError {
    #[error("failed to construct http client for changes feed")]
    Client(#[source] reqwest::Error),
    #[error("changes request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("changes feed {url} responded with {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("changes feed stream was interrupted")]
    Stream(#[source] reqwest::Error),
    #[error("failed to decode changes feed payload")]
    Decode(#[from] serde_json::Error),
}

impl ChangesFeedError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ChangesFeedError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
