//! Starting, stopping and wiping gateway processes on the cluster hosts.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::RunnerError;
use crate::topology::{ClusterTopology, NodeRole};

/// Variables handed to the start playbooks so they can render the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartParams {
    #[serde(rename = "sync_gateway_config_filepath")]
    pub config_path: PathBuf,
    pub server_port: u16,
    pub server_scheme: String,
    pub autoimport: String,
    pub xattrs: String,
}

impl StartParams {
    pub fn new(config_path: &Path, topology: &ClusterTopology) -> Self {
        let config_path =
            std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());

        let (autoimport, xattrs) = if topology.environment().xattrs_enabled {
            (
                r#""import_docs": "continuous","#.to_owned(),
                r#""enable_shared_bucket_access": true,"#.to_owned(),
            )
        } else {
            (String::new(), String::new())
        };

        Self {
            config_path,
            server_port: topology.server_port(),
            server_scheme: topology.server_scheme().to_owned(),
            autoimport,
            xattrs,
        }
    }
}

/// Process management for gateway nodes. Each call covers every node of `role`.
#[async_trait]
pub trait ServiceRunner: Send + Sync {
    async fn stop(&self, role: NodeRole) -> Result<(), RunnerError>;

    async fn clear_artifacts(&self, role: NodeRole) -> Result<(), RunnerError>;

    async fn start(&self, role: NodeRole, params: &StartParams) -> Result<(), RunnerError>;
}

/// `ServiceRunner` that shells out to `ansible-playbook` against the cluster inventory.
#[derive(Clone, Debug)]
pub struct PlaybookRunner {
    program: String,
    playbook_dir: PathBuf,
    inventory: PathBuf,
}

impl PlaybookRunner {
    pub fn new(program: &str, playbook_dir: &Path, inventory: &Path) -> Self {
        Self {
            program: program.to_owned(),
            playbook_dir: playbook_dir.to_path_buf(),
            inventory: inventory.to_path_buf(),
        }
    }

    fn args(&self, playbook: &str, extra_vars: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-i".to_owned(),
            self.inventory.display().to_string(),
            self.playbook_dir.join(playbook).display().to_string(),
        ];

        if let Some(vars) = extra_vars {
            args.push("--extra-vars".to_owned());
            args.push(vars.to_owned());
        }

        args
    }

    async fn run_playbook(
        &self,
        playbook: &str,
        extra_vars: Option<&str>,
    ) -> Result<(), RunnerError> {
        let args = self.args(playbook, extra_vars);
        debug!(program = %self.program, ?args, "running playbook");

        let status = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(RunnerError::PlaybookFailed {
                playbook: playbook.to_owned(),
                code: status.code(),
            });
        }

        info!(playbook, "playbook finished");
        Ok(())
    }
}

fn service_name(role: NodeRole) -> Result<&'static str, RunnerError> {
    match role {
        NodeRole::GatewayReader => Ok("sync-gateway"),
        NodeRole::GatewayWriter => Ok("sg-accel"),
        NodeRole::StorageServer => Err(RunnerError::UnsupportedRole(role)),
    }
}

#[async_trait]
impl ServiceRunner for PlaybookRunner {
    async fn stop(&self, role: NodeRole) -> Result<(), RunnerError> {
        let playbook = format!("stop-{}.yml", service_name(role)?);
        self.run_playbook(&playbook, None).await
    }

    async fn clear_artifacts(&self, role: NodeRole) -> Result<(), RunnerError> {
        let playbook = format!("delete-{}-artifacts.yml", service_name(role)?);
        self.run_playbook(&playbook, None).await
    }

    async fn start(&self, role: NodeRole, params: &StartParams) -> Result<(), RunnerError> {
        let playbook = format!("start-{}.yml", service_name(role)?);
        let vars = serde_json::to_string(params)?;
        self.run_playbook(&playbook, Some(&vars)).await
    }
}
