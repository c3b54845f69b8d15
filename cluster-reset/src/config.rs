use std::path::Path;
use std::str::FromStr;

use envconfig::Envconfig;
use testkit::settings::EnvMsDuration;
use testkit::Settings;
use testkit_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Inventory of the cluster to reset. The topology is read from `<inventory>.json`.
    #[envconfig(from = "CLUSTER_CONFIG")]
    pub cluster_config: NonEmptyString,

    /// Gateway configuration template to reset the cluster to.
    #[envconfig(from = "SERVER_CONFIG")]
    pub server_config: NonEmptyString,

    #[envconfig(from = "PLAYBOOK_DIR", default = "provision/ansible/playbooks")]
    pub playbook_dir: String,

    #[envconfig(from = "ANSIBLE_PLAYBOOK_BIN", default = "ansible-playbook")]
    pub ansible_playbook_bin: String,

    #[envconfig(from = "VERIFY_ALIVE", default = "true")]
    pub verify_alive: bool,

    #[envconfig(nested = true)]
    pub settings: Settings,

    #[envconfig(nested = true)]
    pub provision_retry: ProvisionRetryConfig,

    #[envconfig(nested = true)]
    pub shard_retry: ShardRetryConfig,
}

impl Config {
    pub fn cluster_config_path(&self) -> &Path {
        Path::new(self.cluster_config.as_str())
    }

    pub fn server_config_path(&self) -> &Path {
        Path::new(self.server_config.as_str())
    }
}

#[derive(Envconfig, Clone)]
pub struct ProvisionRetryConfig {
    #[envconfig(from = "PROVISION_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,

    #[envconfig(from = "PROVISION_RETRY_INTERVAL", default = "5000")]
    pub interval: EnvMsDuration,
}

impl ProvisionRetryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, self.interval.0)
    }
}

#[derive(Envconfig, Clone)]
pub struct ShardRetryConfig {
    #[envconfig(from = "SHARD_VALIDATION_MAX_ATTEMPTS", default = "10")]
    pub max_attempts: u32,

    #[envconfig(from = "SHARD_VALIDATION_RETRY_INTERVAL", default = "5000")]
    pub interval: EnvMsDuration,
}

impl ShardRetryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, self.interval.0)
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[
            ("CLUSTER_CONFIG", "resources/cluster_configs/base_di"),
            ("SERVER_CONFIG", "resources/sync_gateway_configs/sync_gateway_default_di.json"),
        ]))
        .expect("valid config");

        assert_eq!(config.ansible_playbook_bin, "ansible-playbook");
        assert!(config.verify_alive);
        assert_eq!(config.settings.admin_port, 4985);

        let provision = config.provision_retry.retry_policy();
        assert_eq!(provision.max_attempts, 3);
        assert_eq!(provision.retry_interval(1), time::Duration::from_secs(5));

        let shards = config.shard_retry.retry_policy();
        assert_eq!(shards.max_attempts, 10);
        assert_eq!(shards.total_delay(), time::Duration::from_secs(45));
    }

    #[test]
    fn test_overrides() {
        let config = Config::init_from_hashmap(&env(&[
            ("CLUSTER_CONFIG", "base_cc"),
            ("SERVER_CONFIG", "cc.json"),
            ("PROVISION_MAX_ATTEMPTS", "5"),
            ("SHARD_VALIDATION_RETRY_INTERVAL", "100"),
            ("PUBLIC_PORT", "14984"),
        ]))
        .expect("valid config");

        assert_eq!(config.provision_retry.max_attempts, 5);
        assert_eq!(
            config.shard_retry.interval.0,
            time::Duration::from_millis(100)
        );
        assert_eq!(config.settings.public_port, 14984);
        assert_eq!(config.cluster_config_path(), Path::new("base_cc"));
    }

    #[test]
    fn test_empty_cluster_config_is_rejected() {
        let result = Config::init_from_hashmap(&env(&[
            ("CLUSTER_CONFIG", ""),
            ("SERVER_CONFIG", "cc.json"),
        ]));

        assert!(result.is_err());
    }
}
