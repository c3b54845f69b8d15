//! Parsing of gateway server configuration documents.
//!
//! The documents on disk are not quite JSON: they may embed sync functions as backtick
//! delimited literals and contain `{{ var }}` template placeholders. Both are resolved before
//! the document is decoded into typed structs.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::ServerConfigError;

/// Template variables known to appear outside of JSON strings, with the values that keep the
/// document parseable.
const TEMPLATE_DEFAULTS: &[(&str, &str)] = &[
    ("is_index_writer", "false"),
    ("autoimport", ""),
    ("xattrs", ""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Every gateway serves changes from its own channel cache.
    ChannelCache,
    /// Changes are indexed by writer nodes that own CBGT partitions.
    DistributedIndex,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeploymentMode::ChannelCache => write!(f, "cc"),
            DeploymentMode::DistributedIndex => write!(f, "di"),
        }
    }
}

/// Unique bucket names a server configuration needs on the storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSet(BTreeSet<String>);

impl BucketSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str) -> bool {
        self.0.insert(name.to_owned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for BucketSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        BucketSet(iter.into_iter().map(Into::into).collect())
    }
}

/// The subset of a gateway server configuration the harness reasons about.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Present only in distributed index mode.
    #[serde(default)]
    pub cluster_config: Option<ShardIndexConfig>,
    pub databases: BTreeMap<String, DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardIndexConfig {
    pub bucket: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub channel_index: Option<BucketRef>,
    #[serde(default)]
    pub shadow: Option<BucketRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketRef {
    #[serde(default)]
    pub bucket: String,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ServerConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ServerConfigError> {
        let json = convert_to_valid_json(raw)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn mode(&self) -> DeploymentMode {
        if self.cluster_config.is_some() {
            DeploymentMode::DistributedIndex
        } else {
            DeploymentMode::ChannelCache
        }
    }

    /// Every bucket referenced by the configuration. A bucket may serve more than one role.
    pub fn bucket_names(&self) -> BucketSet {
        let mut buckets = BucketSet::new();

        if let Some(shard_index) = &self.cluster_config {
            buckets.insert(&shard_index.bucket);
        }

        for database in self.databases.values() {
            if let Some(bucket) = &database.bucket {
                buckets.insert(bucket);

                if let Some(index) = &database.channel_index {
                    buckets.insert(&index.bucket);
                }
            }

            if let Some(shadow) = &database.shadow {
                if !shadow.bucket.is_empty() {
                    buckets.insert(&shadow.bucket);
                }
            }
        }

        buckets
    }
}

/// Turn a raw server configuration into parseable JSON.
///
/// Text between backticks is escaped into a JSON string literal. Template placeholders in the
/// remaining text are rendered with `TEMPLATE_DEFAULTS`.
pub fn convert_to_valid_json(raw: &str) -> Result<String, ServerConfigError> {
    let segments: Vec<&str> = raw.split('`').collect();

    // An odd number of backticks leaves the last literal open.
    if segments.len() % 2 == 0 {
        return Err(ServerConfigError::UnterminatedLiteral);
    }

    let mut output = String::with_capacity(raw.len());
    for (i, segment) in segments.iter().enumerate() {
        if i % 2 == 0 {
            output.push_str(&render_template(segment, TEMPLATE_DEFAULTS));
        } else {
            output.push('"');
            output.push_str(&escape_json_value(segment));
            output.push('"');
        }
    }

    Ok(output)
}

/// Escape a raw value so it can sit between double quotes in a JSON document.
pub fn escape_json_value(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());

    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }

    escaped
}

/// Replace `{{ name }}` placeholders. Unknown names render empty; an unclosed placeholder is
/// left untouched.
fn render_template(text: &str, vars: &[(&str, &str)]) -> String {
    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };

        rendered.push_str(&rest[..start]);

        let name = rest[start + 2..start + 2 + len].trim();
        if let Some((_, value)) = vars.iter().find(|(var, _)| *var == name) {
            rendered.push_str(value);
        }

        rest = &rest[start + 2 + len + 2..];
    }

    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    const DI_CONFIG: &str = r#"{
        "interface": ":4984",
        "adminInterface": "0.0.0.0:4985",
        "cluster_config": {
            "server": "http://{{ couchbase_server_primary_node }}:8091",
            "bucket": "data-bucket",
            "data_dir": "."
        },
        "databases": {
            "db": {
                "server": "http://{{ couchbase_server_primary_node }}:8091",
                "bucket": "data-bucket",
                "channel_index": {
                    "writer": {{ is_index_writer }},
                    "bucket": "index-bucket"
                },
                "sync": `function(doc, oldDoc) {
                    if (doc.type == "reject_me") {
                        throw({forbidden: "rejected \o/"});
                    }
                    channel(doc.channels);
                }`
            }
        }
    }"#;

    #[test]
    fn test_distributed_index_config() {
        let config = ServerConfig::parse(DI_CONFIG).expect("valid config");

        assert_eq!(config.mode(), DeploymentMode::DistributedIndex);
        assert_eq!(
            config.bucket_names(),
            BucketSet::from_iter(["data-bucket", "index-bucket"])
        );
    }

    #[test]
    fn test_channel_cache_config_with_shadow() {
        let raw = r#"{
            {{ autoimport }}
            {{ xattrs }}
            "databases": {
                "db1": {"bucket": "data-bucket", "shadow": {"bucket": "source-bucket"}},
                "db2": {"bucket": "data-bucket-2", "shadow": {"bucket": ""}},
                "db3": {"bucket": "data-bucket"}
            }
        }"#;
        let config = ServerConfig::parse(raw).expect("valid config");

        assert_eq!(config.mode(), DeploymentMode::ChannelCache);
        assert_eq!(
            config.bucket_names(),
            BucketSet::from_iter(["data-bucket", "data-bucket-2", "source-bucket"])
        );
    }

    #[test]
    fn test_channel_index_requires_database_bucket() {
        let raw = r#"{"databases": {"db": {"channel_index": {"bucket": "orphan-index"}}}}"#;
        let config = ServerConfig::parse(raw).expect("valid config");

        assert!(config.bucket_names().is_empty());
    }

    #[test]
    fn test_sync_function_becomes_string_literal() {
        let raw = "{\"sync\": `function(doc) {\n\tif (doc.a == \"b\\c\") {}\n}`}";
        let json = convert_to_valid_json(raw).expect("terminated literal");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(
            value["sync"],
            "function(doc) {\n\tif (doc.a == \"b\\c\") {}\n}"
        );
    }

    #[test]
    fn test_unterminated_literal() {
        let result = convert_to_valid_json("{\"sync\": `function(doc) {}}");

        assert!(matches!(result, Err(ServerConfigError::UnterminatedLiteral)));
    }

    #[test]
    fn test_template_rendering() {
        let vars = [("is_index_writer", "true")];

        assert_eq!(
            render_template("\"writer\": {{is_index_writer}}, {{ unknown }}x", &vars),
            "\"writer\": true, x"
        );
        assert_eq!(render_template("left {{ open", &vars), "left {{ open");
    }

    #[test]
    fn test_missing_databases_is_an_error() {
        let result = ServerConfig::parse(r#"{"interface": ":4984"}"#);

        assert!(matches!(result, Err(ServerConfigError::Parse(_))));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(DeploymentMode::ChannelCache.to_string(), "cc");
        assert_eq!(DeploymentMode::DistributedIndex.to_string(), "di");
    }
}
