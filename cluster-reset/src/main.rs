//! Reset a sync gateway test cluster to a server configuration.
use std::path::Path;

use envconfig::Envconfig;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use cluster_reset::config::Config;
use cluster_reset::error::ClusterResetError;
use testkit::{
    AdminClient, BucketProvisioner, CbgtDistributionValidator, ClusterLifecycle, ClusterTopology,
    PlaybookRunner, ServerAdmin,
};

#[tokio::main]
async fn main() -> Result<(), ClusterResetError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()?;

    let topology = ClusterTopology::load(config.cluster_config_path())?;
    let runner = PlaybookRunner::new(
        &config.ansible_playbook_bin,
        Path::new(&config.playbook_dir),
        topology.inventory(),
    );

    let storage_url = topology.storage_url(topology.primary_storage()?);
    let storage = ServerAdmin::new(&storage_url, &config.settings)?;

    let writers = topology
        .writers()
        .iter()
        .map(|node| AdminClient::for_node(node, &config.settings))
        .collect::<Result<Vec<_>, _>>()?;
    let validator = CbgtDistributionValidator::new(writers)
        .with_retry_policy(config.shard_retry.retry_policy());
    let provisioner = BucketProvisioner::new(config.provision_retry.retry_policy());

    let mut lifecycle = ClusterLifecycle::new(
        topology,
        config.settings.clone(),
        runner,
        storage,
        provisioner,
        validator,
    );

    let mode = lifecycle.reset(config.server_config_path()).await?;
    info!(%mode, "cluster reset complete");

    if config.verify_alive {
        let down = lifecycle.verify_alive(mode).await?;
        if !down.is_empty() {
            return Err(ClusterResetError::NodesDown(
                down.into_iter().map(|node| node.name).collect(),
            ));
        }
        info!("all gateway nodes are responding");
    }

    Ok(())
}
