//! Admin surface of the storage server that backs the gateways.
use std::time;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::{self, build_client};
use crate::error::{ApiError, StorageError};
use crate::settings::Settings;

/// Share of a node's memory handed out to buckets.
const RAM_MULTIPLIER: f64 = 0.80;
/// Memory kept aside for the query indexer, in MB.
const INDEXER_RAM_MB: i64 = 512;
/// Smallest quota the storage server accepts for a bucket, in MB.
const MIN_BUCKET_RAM_MB: u64 = 100;

const READY_POLL_INTERVAL: time::Duration = time::Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub hostname: String,
    pub status: String,
}

impl NodeStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Bucket management on a storage node. Every call maps onto a single REST request.
#[async_trait]
pub trait StorageAdmin: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError>;

    async fn delete_bucket(&self, name: &str) -> Result<(), StorageError>;

    async fn create_bucket(&self, name: &str, ram_quota_mb: u64) -> Result<(), StorageError>;

    /// Memory of the largest node in the cluster, in MB.
    async fn available_ram_mb(&self) -> Result<u64, StorageError>;

    async fn node_statuses(&self) -> Result<Vec<NodeStatus>, StorageError>;

    /// Poll node statuses until every node reports healthy or `timeout` elapses.
    async fn wait_for_ready(&self, timeout: time::Duration) -> Result<(), StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.node_statuses().await {
                Ok(nodes) if !nodes.is_empty() && nodes.iter().all(NodeStatus::is_healthy) => {
                    info!("all storage nodes are healthy");
                    return Ok(());
                }
                Ok(nodes) => {
                    for node in nodes.iter().filter(|node| !node.is_healthy()) {
                        debug!(
                            node = %node.hostname,
                            status = %node.status,
                            "storage node not healthy yet"
                        );
                    }
                }
                // Connections are refused while a node is warming up.
                Err(StorageError::Api(error)) if error.is_retryable() => {
                    debug!("storage node status unavailable: {}", error);
                }
                Err(error) => return Err(error),
            }

            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(StorageError::NotReady(timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

/// RAM quota for each of `bucket_count` buckets sharing a node with `total_ram_mb` of memory.
pub fn per_bucket_ram_mb(total_ram_mb: u64, bucket_count: usize) -> u64 {
    if bucket_count == 0 {
        return 0;
    }

    let effective = (total_ram_mb as f64 * RAM_MULTIPLIER) as i64 - INDEXER_RAM_MB;
    let per_bucket = effective / bucket_count as i64;

    u64::try_from(per_bucket)
        .unwrap_or(0)
        .max(MIN_BUCKET_RAM_MB)
}

#[derive(Debug, Deserialize)]
struct BucketEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SystemStats {
    #[serde(default)]
    mem_total: u64,
}

#[derive(Debug, Deserialize)]
struct PoolNode {
    #[serde(rename = "systemStats")]
    system_stats: Option<SystemStats>,
}

#[derive(Debug, Deserialize)]
struct PoolDetails {
    #[serde(default)]
    nodes: Vec<PoolNode>,
}

#[derive(Debug, Deserialize)]
struct PoolNodes {
    #[serde(default)]
    nodes: Vec<NodeStatus>,
}

/// `StorageAdmin` over the storage server's REST API.
#[derive(Clone, Debug)]
pub struct ServerAdmin {
    base_url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl ServerAdmin {
    pub fn new(base_url: &str, settings: &Settings) -> Result<Self, StorageError> {
        let client =
            build_client(Some(settings.http_request_timeout.0)).map_err(ApiError::Client)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            user: settings.server_admin_user.clone(),
            password: settings.server_admin_password.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.user, Some(&self.password))
    }
}

#[async_trait]
impl StorageAdmin for ServerAdmin {
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let buckets: Vec<BucketEntry> =
            client::send_json(self.request(reqwest::Method::GET, "/pools/default/buckets"))
                .await?;

        Ok(buckets.into_iter().map(|bucket| bucket.name).collect())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), StorageError> {
        let path = format!("/pools/default/buckets/{}", name);
        client::send(self.request(reqwest::Method::DELETE, &path)).await?;

        Ok(())
    }

    async fn create_bucket(&self, name: &str, ram_quota_mb: u64) -> Result<(), StorageError> {
        let ram_quota = ram_quota_mb.to_string();
        let form = [
            ("name", name),
            ("ramQuotaMB", ram_quota.as_str()),
            ("authType", "sasl"),
            ("proxyPort", "11211"),
            ("bucketType", "couchbase"),
            ("flushEnabled", "1"),
        ];

        client::send(
            self.request(reqwest::Method::POST, "/pools/default/buckets")
                .form(&form),
        )
        .await?;

        Ok(())
    }

    async fn available_ram_mb(&self) -> Result<u64, StorageError> {
        let pool: PoolDetails =
            client::send_json(self.request(reqwest::Method::GET, "/pools/default")).await?;

        // Some nodes report a mem_total of 0.
        let highest = pool
            .nodes
            .iter()
            .filter_map(|node| node.system_stats.as_ref())
            .map(|stats| stats.mem_total)
            .max()
            .unwrap_or(0);

        if highest == 0 {
            warn!(url = %self.base_url, "no storage node reported its total memory");
        }

        Ok(highest / (1024 * 1024))
    }

    async fn node_statuses(&self) -> Result<Vec<NodeStatus>, StorageError> {
        let nodes: PoolNodes =
            client::send_json(self.request(reqwest::Method::GET, "/pools/nodes")).await?;

        Ok(nodes.nodes)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use httpmock::prelude::*;
    use serde_json::json;

    fn admin(server: &MockServer) -> ServerAdmin {
        ServerAdmin::new(&server.base_url(), &Settings::default()).expect("client builds")
    }

    #[test]
    fn test_per_bucket_ram() {
        // (8192 * 0.8 - 512) / 2
        assert_eq!(per_bucket_ram_mb(8192, 2), 3020);
        assert_eq!(per_bucket_ram_mb(8192, 0), 0);
        assert_eq!(per_bucket_ram_mb(512, 3), MIN_BUCKET_RAM_MB);
    }

    #[tokio::test]
    async fn test_list_buckets() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/pools/default/buckets")
                .header_exists("authorization");
            then.status(200)
                .json_body(json!([{"name": "data-bucket"}, {"name": "index-bucket"}]));
        });

        let buckets = admin(&server).list_buckets().await.expect("lists buckets");

        mock.assert();
        assert_eq!(buckets, vec!["data-bucket", "index-bucket"]);
    }

    #[tokio::test]
    async fn test_create_bucket_posts_form() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/pools/default/buckets")
                .body_contains("name=data-bucket")
                .body_contains("ramQuotaMB=1024")
                .body_contains("bucketType=couchbase");
            then.status(202);
        });

        admin(&server)
            .create_bucket("data-bucket", 1024)
            .await
            .expect("creates bucket");

        mock.assert();
    }

    #[tokio::test]
    async fn test_delete_bucket_keeps_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(DELETE).path("/pools/default/buckets/stale-bucket");
            then.status(500).body("Unexpected server error, request logged.");
        });

        let error = admin(&server)
            .delete_bucket("stale-bucket")
            .await
            .expect_err("500 is an error");

        match error {
            StorageError::Api(api) => {
                assert_eq!(api.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR));
                assert!(api.is_retryable());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_available_ram_uses_largest_node() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pools/default");
            then.status(200).json_body(json!({
                "nodes": [
                    {"systemStats": {"mem_total": 0}},
                    {"systemStats": {"mem_total": 8589934592u64}},
                    {"systemStats": {"mem_total": 4294967296u64}}
                ]
            }));
        });

        let ram = admin(&server).available_ram_mb().await.expect("reads pool");

        assert_eq!(ram, 8192);
    }

    #[tokio::test]
    async fn test_wait_for_ready() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pools/nodes");
            then.status(200).json_body(json!({
                "nodes": [
                    {"hostname": "10.0.0.1:8091", "status": "healthy"},
                    {"hostname": "10.0.0.2:8091", "status": "healthy"}
                ]
            }));
        });

        admin(&server)
            .wait_for_ready(time::Duration::from_secs(5))
            .await
            .expect("nodes are healthy");
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/pools/nodes");
            then.status(200)
                .json_body(json!({"nodes": [{"hostname": "10.0.0.1:8091", "status": "warmup"}]}));
        });

        let result = admin(&server)
            .wait_for_ready(time::Duration::from_millis(500))
            .await;

        assert!(matches!(result, Err(StorageError::NotReady(_))));
    }
}
