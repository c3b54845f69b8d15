//! # Cluster lifecycle
//!
//! Brings a cluster back to a known state for a new server configuration. A reset walks
//! through `ResetStage`s in order and stops at the first failing stage; there is no partial
//! success.
use std::fmt;
use std::path::Path;

use tracing::{error, info, warn};

use crate::cbgt::{CbgtAdmin, CbgtDistributionValidator, WriterDiagnostics};
use crate::client::build_client;
use crate::error::{ApiError, ResetError};
use crate::provision::BucketProvisioner;
use crate::runner::{ServiceRunner, StartParams};
use crate::server::StorageAdmin;
use crate::server_config::{DeploymentMode, ServerConfig};
use crate::settings::Settings;
use crate::topology::{ClusterTopology, NodeRole, ServerNode};

const GATEWAY_ROLES: [NodeRole; 2] = [NodeRole::GatewayReader, NodeRole::GatewayWriter];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetStage {
    ServicesStopped,
    ArtifactsCleared,
    BucketsProvisioned,
    ServicesStarted,
    ShardsValidated,
    Ready,
}

impl fmt::Display for ResetStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stage = match self {
            ResetStage::ServicesStopped => "services stopped",
            ResetStage::ArtifactsCleared => "artifacts cleared",
            ResetStage::BucketsProvisioned => "buckets provisioned",
            ResetStage::ServicesStarted => "services started",
            ResetStage::ShardsValidated => "shards validated",
            ResetStage::Ready => "ready",
        };
        write!(f, "{}", stage)
    }
}

/// Owns a test cluster for the duration of a reset. Resets must not run concurrently against
/// the same cluster.
pub struct ClusterLifecycle<R, S, A> {
    topology: ClusterTopology,
    settings: Settings,
    runner: R,
    storage: S,
    provisioner: BucketProvisioner,
    validator: CbgtDistributionValidator<A>,
    stage: Option<ResetStage>,
}

impl<R, S, A> ClusterLifecycle<R, S, A>
where
    R: ServiceRunner,
    S: StorageAdmin,
    A: CbgtAdmin,
{
    pub fn new(
        topology: ClusterTopology,
        settings: Settings,
        runner: R,
        storage: S,
        provisioner: BucketProvisioner,
        validator: CbgtDistributionValidator<A>,
    ) -> Self {
        Self {
            topology,
            settings,
            runner,
            storage,
            provisioner,
            validator,
            stage: None,
        }
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// The last stage the most recent reset completed.
    pub fn stage(&self) -> Option<ResetStage> {
        self.stage
    }

    fn advance(&mut self, stage: ResetStage) {
        info!(%stage, "reset stage completed");
        self.stage = Some(stage);
    }

    /// Reset the cluster to run the server configuration at `config_path`.
    pub async fn reset(&mut self, config_path: &Path) -> Result<DeploymentMode, ResetError> {
        self.stage = None;

        let config = ServerConfig::load(config_path)?;
        let mode = config.mode();
        self.topology.validate_for(mode)?;

        let buckets = config.bucket_names();
        info!(%mode, config = %config_path.display(), "resetting cluster");

        for role in GATEWAY_ROLES {
            if let Err(stop_error) = self.runner.stop(role).await {
                warn!(%role, "failed to stop services: {}", stop_error);
            }
        }
        self.advance(ResetStage::ServicesStopped);

        for role in GATEWAY_ROLES {
            self.runner
                .clear_artifacts(role)
                .await
                .map_err(|source| ResetError::ClearArtifacts { role, source })?;
        }
        self.advance(ResetStage::ArtifactsCleared);

        self.provisioner
            .provision_buckets(&self.storage, &buckets)
            .await?;
        self.storage
            .wait_for_ready(self.settings.server_ready_timeout.0)
            .await
            .map_err(ResetError::StorageNotReady)?;
        self.advance(ResetStage::BucketsProvisioned);

        let params = StartParams::new(config_path, &self.topology);
        self.start(NodeRole::GatewayReader, &params).await?;
        if mode == DeploymentMode::DistributedIndex {
            self.start(NodeRole::GatewayWriter, &params).await?;
        }
        self.advance(ResetStage::ServicesStarted);

        if mode == DeploymentMode::DistributedIndex {
            self.validate_shards().await?;
            self.advance(ResetStage::ShardsValidated);
        } else {
            info!("running in channel cache mode");
        }

        self.advance(ResetStage::Ready);
        Ok(mode)
    }

    async fn start(&self, role: NodeRole, params: &StartParams) -> Result<(), ResetError> {
        self.runner
            .start(role, params)
            .await
            .map_err(|source| ResetError::StartServices { role, source })
    }

    async fn validate_shards(&self) -> Result<(), ResetError> {
        let source = match self.validator.validate_with_retry().await {
            Ok(true) => {
                info!("detected valid CBGT pindex distribution");
                return Ok(());
            }
            Ok(false) => None,
            Err(fatal) => Some(fatal),
        };

        let diagnostics = self.save_cbgt_diagnostics().await;
        Err(ResetError::ShardValidation {
            diagnostics,
            source,
        })
    }

    /// Fetch CBGT diagnostics from every writer node.
    pub async fn save_cbgt_diagnostics(&self) -> Vec<WriterDiagnostics> {
        self.validator.capture_diagnostics().await
    }

    /// Nodes whose public port does not answer. Writers are only checked in distributed
    /// index mode.
    pub async fn verify_alive(&self, mode: DeploymentMode) -> Result<Vec<ServerNode>, ApiError> {
        let client =
            build_client(Some(self.settings.http_request_timeout.0)).map_err(ApiError::Client)?;

        let mut nodes: Vec<&ServerNode> = self.topology.readers().iter().collect();
        if mode == DeploymentMode::DistributedIndex {
            nodes.extend(self.topology.writers());
        }

        let mut down = Vec::new();
        for node in nodes {
            let url = node.public_url(self.settings.public_port);

            match crate::client::send(client.get(&url)).await {
                Ok(response) => {
                    info!(node = %node.name, %url, status = %response.status(), "node is alive")
                }
                Err(error) => {
                    error!(node = %node.name, %url, "node is down: {}", error);
                    down.push(node.clone());
                }
            }
        }

        Ok(down)
    }
}
