//! Orchestration and verification for sync gateway test clusters.
//!
//! `ClusterLifecycle` brings a cluster back to a known state, `CbgtDistributionValidator`
//! checks shard placement in distributed index mode, and `ChangesFeedTracker` consumes the
//! changes feed on behalf of a simulated `UserSession`.
pub mod admin;
pub mod cbgt;
pub mod changes;
mod client;
pub mod error;
pub mod lifecycle;
pub mod provision;
pub mod runner;
pub mod server;
pub mod server_config;
pub mod settings;
pub mod topology;
pub mod user;

pub use admin::AdminClient;
pub use cbgt::CbgtDistributionValidator;
pub use changes::{ChangeEvent, ChangesFeedTracker, FeedOutcome, FeedStatus, Sequence};
pub use lifecycle::{ClusterLifecycle, ResetStage};
pub use provision::BucketProvisioner;
pub use runner::{PlaybookRunner, ServiceRunner};
pub use server::{ServerAdmin, StorageAdmin};
pub use server_config::{BucketSet, DeploymentMode, ServerConfig};
pub use settings::Settings;
pub use topology::{ClusterTopology, NodeRole, ServerNode};
pub use user::UserSession;
