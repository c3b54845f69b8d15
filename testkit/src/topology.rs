use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TopologyError;
use crate::server_config::DeploymentMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    StorageServer,
    GatewayReader,
    GatewayWriter,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeRole::StorageServer => write!(f, "storage server"),
            NodeRole::GatewayReader => write!(f, "gateway reader"),
            NodeRole::GatewayWriter => write!(f, "gateway writer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNode {
    pub name: String,
    pub ip: String,
    pub role: NodeRole,
}

impl ServerNode {
    pub fn new(name: &str, ip: &str, role: NodeRole) -> Self {
        Self {
            name: name.to_owned(),
            ip: ip.to_owned(),
            role,
        }
    }

    pub fn admin_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.ip, port)
    }

    pub fn public_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.ip, port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub cbs_ssl_enabled: bool,
    #[serde(default)]
    pub xattrs_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct NodeDescriptor {
    name: String,
    ip: String,
}

/// On-disk shape of the cluster description written next to the inventory.
#[derive(Debug, Deserialize)]
struct ClusterDescription {
    #[serde(default)]
    couchbase_servers: Vec<NodeDescriptor>,
    #[serde(default)]
    sync_gateways: Vec<NodeDescriptor>,
    #[serde(default)]
    sg_accels: Vec<NodeDescriptor>,
    #[serde(default)]
    load_balancers: Vec<NodeDescriptor>,
    #[serde(default)]
    environment: Environment,
}

/// Static model of the nodes under test. Built once per run and never mutated.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    inventory: PathBuf,
    storage_servers: Vec<ServerNode>,
    readers: Vec<ServerNode>,
    writers: Vec<ServerNode>,
    environment: Environment,
}

impl ClusterTopology {
    /// Load the topology for an inventory. The node descriptions live in `<inventory>.json`.
    pub fn load(inventory: &Path) -> Result<Self, TopologyError> {
        let inventory = strip_json_extension(inventory);
        let description_path = description_path(&inventory);

        if !description_path.is_file() {
            return Err(TopologyError::NotFound(description_path));
        }

        let raw = std::fs::read_to_string(&description_path).map_err(|source| {
            TopologyError::Io {
                path: description_path.clone(),
                source,
            }
        })?;

        Self::from_json(inventory, &raw)
    }

    pub fn from_json(inventory: PathBuf, raw: &str) -> Result<Self, TopologyError> {
        let description: ClusterDescription = serde_json::from_str(raw)?;
        let load_balancer = description.load_balancers.first();

        let storage_servers = description
            .couchbase_servers
            .iter()
            .map(|node| ServerNode::new(&node.name, &node.ip, NodeRole::StorageServer))
            .collect();

        // Readers are addressed through the load balancer when there is one.
        let readers = description
            .sync_gateways
            .iter()
            .map(|node| {
                let ip = load_balancer.map_or(node.ip.as_str(), |lb| lb.ip.as_str());
                ServerNode::new(&node.name, ip, NodeRole::GatewayReader)
            })
            .collect();

        let writers = description
            .sg_accels
            .iter()
            .map(|node| ServerNode::new(&node.name, &node.ip, NodeRole::GatewayWriter))
            .collect();

        Ok(Self {
            inventory,
            storage_servers,
            readers,
            writers,
            environment: description.environment,
        })
    }

    /// Check the topology can run a cluster in `mode`.
    pub fn validate_for(&self, mode: DeploymentMode) -> Result<(), TopologyError> {
        if self.storage_servers.is_empty() {
            return Err(TopologyError::NoStorageServer);
        }

        if self.readers.is_empty() {
            return Err(TopologyError::NoReaders);
        }

        if mode == DeploymentMode::DistributedIndex && self.writers.is_empty() {
            return Err(TopologyError::NoWriters(mode));
        }

        let reader_names: HashSet<&str> = self.readers.iter().map(|n| n.name.as_str()).collect();
        if let Some(writer) = self
            .writers
            .iter()
            .find(|writer| reader_names.contains(writer.name.as_str()))
        {
            return Err(TopologyError::OverlappingRoles(writer.name.clone()));
        }

        Ok(())
    }

    /// Path of the inventory consumed by the service runner.
    pub fn inventory(&self) -> &Path {
        &self.inventory
    }

    pub fn storage_servers(&self) -> &[ServerNode] {
        &self.storage_servers
    }

    pub fn readers(&self) -> &[ServerNode] {
        &self.readers
    }

    pub fn writers(&self) -> &[ServerNode] {
        &self.writers
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The storage node buckets are provisioned on.
    pub fn primary_storage(&self) -> Result<&ServerNode, TopologyError> {
        self.storage_servers
            .first()
            .ok_or(TopologyError::NoStorageServer)
    }

    pub fn server_scheme(&self) -> &'static str {
        if self.environment.cbs_ssl_enabled {
            "https"
        } else {
            "http"
        }
    }

    pub fn server_port(&self) -> u16 {
        if self.environment.cbs_ssl_enabled {
            18091
        } else {
            8091
        }
    }

    pub fn storage_url(&self, node: &ServerNode) -> String {
        format!(
            "{}://{}:{}",
            self.server_scheme(),
            node.ip,
            self.server_port()
        )
    }
}

fn strip_json_extension(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "json") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

fn description_path(inventory: &Path) -> PathBuf {
    let mut path = inventory.as_os_str().to_owned();
    path.push(".json");
    PathBuf::from(path)
}
