//! Server configuration.
//!
//! Settings come from a TOML file and are overridden by environment
//! variables prefixed with `JACKAL__`, nested keys separated by `__`:
//!
//! ```text
//! JACKAL__LOG__LEVEL=debug
//! JACKAL__XMPP__HOSTS=jackal.im,jackal.org
//! JACKAL__XMPP__OFFLINE__QUEUE_SIZE=500
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use jackal_xmpp::CoreConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "JACKAL";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,jackal_server=debug,jackal_xmpp=debug".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub log: LogConfig,
    pub xmpp: CoreConfig,
}

impl ServerConfig {
    /// Load from `path` (optional) with environment overrides applied.
    pub fn load(path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(environment());
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(source: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("Invalid configuration")
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("xmpp.hosts")
        .with_list_parse_key("xmpp.pubsub.hosts")
        .with_list_parse_key("xmpp.pubsub.features")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackal_xmpp::pubsub::Feature;
    use jackal_xmpp::ResourceConflict;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.xmpp.hosts, vec!["localhost".to_string()]);
        assert_eq!(config.xmpp.offline.queue_size, 200);
    }

    #[test]
    fn test_full_document() {
        let config = ServerConfig::from_toml(
            r#"
            [log]
            level = "warn"
            format = "json"

            [xmpp]
            hosts = ["jackal.im"]
            resource_conflict = "reject"

            [xmpp.offline]
            queue_size = 10

            [xmpp.pubsub]
            hosts = ["pubsub.jackal.im"]
            features = ["create-nodes", "publish"]
            "#,
        )
        .unwrap();

        assert_eq!(config.log.level, "warn");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.xmpp.hosts, vec!["jackal.im".to_string()]);
        assert_eq!(config.xmpp.resource_conflict, ResourceConflict::Reject);
        assert_eq!(config.xmpp.offline.queue_size, 10);
        assert!(config.xmpp.pubsub.features.contains(Feature::Publish));
        assert!(!config.xmpp.pubsub.features.contains(Feature::DeleteNodes));
    }

    #[test]
    fn test_unknown_resource_conflict_policy_is_rejected() {
        let result = ServerConfig::from_toml(
            r#"
            [xmpp]
            resource_conflict = "evict"
            "#,
        );
        assert!(result.is_err());
    }
}
