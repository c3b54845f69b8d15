use thiserror::Error;

use testkit::error::{ApiError, ResetError, StorageError, TopologyError};

/// Enumeration of errors that stop a cluster reset run.
#[derive(Error, Debug)]
pub enum ClusterResetError {
    #[error("invalid configuration")]
    Config(#[from] envconfig::Error),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to set up storage server admin client")]
    Storage(#[from] StorageError),
    #[error("failed to set up gateway admin client")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Reset(#[from] ResetError),
    #[error("nodes did not respond after reset: {}", .0.join(", "))]
    NodesDown(Vec<String>),
}
