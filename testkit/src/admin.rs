//! Client for a gateway node's admin REST API.
use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use testkit_common::pool::WorkerPool;
use tracing::{debug, info};

use crate::cbgt::{CbgtAdmin, CbgtConfig};
use crate::changes::{ChangeRecord, ChangesResponse, Sequence};
use crate::client::{self, build_client};
use crate::error::ApiError;
use crate::settings::Settings;
use crate::topology::ServerNode;
use crate::user::UserSession;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    #[serde(default)]
    pub update_seq: Option<Sequence>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllDocs {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub value: Option<AllDocsValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllDocsValue {
    pub rev: String,
}

impl AllDocs {
    pub fn ids(&self) -> Vec<&str> {
        self.rows.iter().map(|row| row.id.as_str()).collect()
    }
}

/// Channels and roles granted to a user at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserGrant {
    #[serde(rename = "admin_channels")]
    pub channels: Vec<String>,
    #[serde(rename = "admin_roles")]
    pub roles: Vec<String>,
}

impl UserGrant {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            roles: Vec::new(),
        }
    }
}

/// Stateless handle on one node's admin port. Cheap to clone and safe to share between tasks.
#[derive(Clone, Debug)]
pub struct AdminClient {
    node_name: String,
    admin_url: String,
    client: reqwest::Client,
    pool: WorkerPool,
}

impl AdminClient {
    pub fn new(node_name: &str, admin_url: &str, settings: &Settings) -> Result<Self, ApiError> {
        let client = build_client(Some(settings.http_request_timeout.0)).map_err(ApiError::Client)?;

        Ok(Self {
            node_name: node_name.to_owned(),
            admin_url: admin_url.trim_end_matches('/').to_owned(),
            client,
            pool: WorkerPool::new(settings.max_request_workers),
        })
    }

    pub fn for_node(node: &ServerNode, settings: &Settings) -> Result<Self, ApiError> {
        Self::new(&node.name, &node.admin_url(settings.admin_port), settings)
    }

    /// Share a pool with other components instead of the one sized from `Settings`.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn admin_url(&self) -> &str {
        &self.admin_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.admin_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!(%url, "GET");
        self.client.get(url)
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!(%url, "PUT");
        self.client.put(url)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = self.url(path);
        debug!(%url, "POST");
        self.client.post(url)
    }

    pub async fn create_db(&self, db: &str) -> Result<(), ApiError> {
        client::send(self.put(db)).await?;
        info!(db, node = %self.node_name, "created db");
        Ok(())
    }

    pub async fn delete_db(&self, db: &str) -> Result<(), ApiError> {
        let url = self.url(db);
        debug!(%url, "DELETE");
        client::send(self.client.delete(url)).await?;
        Ok(())
    }

    pub async fn get_dbs(&self) -> Result<Vec<String>, ApiError> {
        client::send_json(self.get("_all_dbs")).await
    }

    pub async fn get_db_info(&self, db: &str) -> Result<DbInfo, ApiError> {
        client::send_json(self.get(&format!("{}/", db))).await
    }

    pub async fn create_role(
        &self,
        db: &str,
        name: &str,
        channels: &[String],
    ) -> Result<(), ApiError> {
        let body = json!({"name": name, "admin_channels": channels});
        client::send(self.put(&format!("{}/_role/{}", db, name)).json(&body)).await?;
        Ok(())
    }

    pub async fn get_roles(&self, db: &str) -> Result<Vec<String>, ApiError> {
        client::send_json(self.get(&format!("{}/_role/", db))).await
    }

    pub async fn get_role(&self, db: &str, name: &str) -> Result<Value, ApiError> {
        client::send_json(self.get(&format!("{}/_role/{}", db, name))).await
    }

    /// Create or replace a user and return a session for it against `public_url`.
    pub async fn register_user(
        &self,
        public_url: &str,
        db: &str,
        name: &str,
        password: &str,
        grant: &UserGrant,
    ) -> Result<UserSession, ApiError> {
        let body = json!({
            "name": name,
            "password": password,
            "admin_channels": grant.channels,
            "admin_roles": grant.roles,
        });
        client::send(self.put(&format!("{}/_user/{}", db, name)).json(&body)).await?;

        Ok(UserSession::new(
            self.client.clone(),
            public_url,
            db,
            name,
            password,
            grant.channels.clone(),
            self.pool.clone(),
        ))
    }

    /// Register `number` users named `<prefix>_<i>`. Fails unless every registration succeeds.
    pub async fn register_bulk_users(
        &self,
        public_url: &str,
        db: &str,
        name_prefix: &str,
        number: usize,
        password: &str,
        grant: &UserGrant,
    ) -> Result<Vec<UserSession>, ApiError> {
        let names: Vec<String> = (0..number)
            .map(|i| format!("{}_{}", name_prefix, i))
            .collect();

        let results = self
            .pool
            .run_all(
                names
                    .iter()
                    .map(|name| self.register_user(public_url, db, name, password, grant)),
            )
            .await;

        let users = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        info!(db, count = users.len(), "registered users");
        Ok(users)
    }

    pub async fn get_users_info(&self, db: &str) -> Result<Vec<String>, ApiError> {
        client::send_json(self.get(&format!("{}/_user/", db))).await
    }

    pub async fn get_user_info(&self, db: &str, name: &str) -> Result<Value, ApiError> {
        client::send_json(self.get(&format!("{}/_user/{}", db, name))).await
    }

    pub async fn db_resync(&self, db: &str) -> Result<Value, ApiError> {
        client::send_json(self.post(&format!("{}/_resync", db))).await
    }

    /// Bring a db online, optionally after `delay` seconds.
    pub async fn bring_db_online(
        &self,
        db: &str,
        delay: Option<u64>,
    ) -> Result<StatusCode, ApiError> {
        let body = match delay {
            Some(delay) => json!({"delay": delay}),
            None => json!({}),
        };

        let response = client::send(self.post(&format!("{}/_online", db)).json(&body)).await?;
        Ok(response.status())
    }

    pub async fn take_db_offline(&self, db: &str) -> Result<StatusCode, ApiError> {
        let response = client::send(self.post(&format!("{}/_offline", db))).await?;
        Ok(response.status())
    }

    pub async fn get_db_config(&self, db: &str) -> Result<Value, ApiError> {
        client::send_json(self.get(&format!("{}/_config", db))).await
    }

    pub async fn put_db_config(&self, db: &str, config: &Value) -> Result<StatusCode, ApiError> {
        let response = client::send(self.put(&format!("{}/_config", db)).json(config)).await?;
        Ok(response.status())
    }

    pub async fn get_global_changes(&self, db: &str) -> Result<Vec<ChangeRecord>, ApiError> {
        let changes: ChangesResponse =
            client::send_json(self.get(&format!("{}/_changes", db))).await?;
        Ok(changes.results)
    }

    pub async fn get_active_tasks(&self) -> Result<Value, ApiError> {
        client::send_json(self.get("_active_tasks")).await
    }

    pub async fn get_all_docs(&self, db: &str) -> Result<AllDocs, ApiError> {
        client::send_json(self.get(&format!("{}/_all_docs", db))).await
    }
}

#[async_trait]
impl CbgtAdmin for AdminClient {
    fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn get_cbgt_config(&self) -> Result<CbgtConfig, ApiError> {
        client::send_json(self.get("_cbgt/api/cfg")).await
    }

    async fn get_cbgt_diagnostics(&self) -> Result<Value, ApiError> {
        client::send_json(self.get("_cbgt/api/diag")).await
    }
}
