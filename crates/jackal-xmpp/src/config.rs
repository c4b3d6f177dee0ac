//! Typed configuration consumed by the server core.
//!
//! The assembly root deserializes this record from whatever source it
//! likes (the `jackal-server` binary uses TOML plus environment overrides);
//! every field has a default so partial documents are accepted.

use std::time::Duration;

use serde::Deserialize;

use crate::pubsub::{NodeOptions, PubSubFeatures};

/// What to do when a client binds a resource that is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConflict {
    /// Refuse the new binding; the new stream stays open.
    Override,
    /// Close the new stream with a `policy-violation` stream error.
    Reject,
    /// Close the existing stream with a `conflict` stream error and bind
    /// the new one.
    #[default]
    Replace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Domains this server is authoritative for.
    pub hosts: Vec<String>,
    pub resource_conflict: ResourceConflict,
    pub roster: RosterConfig,
    pub offline: OfflineConfig,
    pub queue: QueueConfig,
    pub components: ComponentsConfig,
    pub pubsub: PubSubConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            resource_conflict: ResourceConflict::default(),
            roster: RosterConfig::default(),
            offline: OfflineConfig::default(),
            queue: QueueConfig::default(),
            components: ComponentsConfig::default(),
            pubsub: PubSubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Enable roster versioning (RFC 6121 Section 2.6).
    pub versioning: bool,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self { versioning: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum number of queued messages per user.
    pub queue_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { queue_size: 200 }
    }
}

/// Owner-keyed operation queue tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub depth: usize,
    pub operation_timeout_ms: u64,
}

impl QueueConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 32,
            operation_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComponentsConfig {
    /// How long `stop` may take before a component is abandoned.
    pub stop_timeout_ms: u64,
}

impl ComponentsConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Component hosts served by the publish-subscribe service.
    pub hosts: Vec<String>,
    pub features: PubSubFeatures,
    pub default_node_options: NodeOptions,
    /// Allow `<default/>` configuration retrieval.
    pub config_retrieval_enabled: bool,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            features: PubSubFeatures::all(),
            default_node_options: NodeOptions::default(),
            config_retrieval_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{AccessModel, Feature};

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.resource_conflict, ResourceConflict::Replace);
        assert!(config.roster.versioning);
        assert_eq!(config.queue.depth, 32);
        assert_eq!(config.queue.operation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_document() {
        let config: CoreConfig = toml::from_str(
            r#"
            hosts = ["jackal.im"]
            resource_conflict = "reject"

            [offline]
            queue_size = 5

            [pubsub]
            hosts = ["pubsub.jackal.im"]
            features = ["create-nodes", "config-node", "delete-nodes"]
            config_retrieval_enabled = false

            [pubsub.default_node_options]
            access_model = "whitelist"
            max_items = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.hosts, vec!["jackal.im".to_string()]);
        assert_eq!(config.resource_conflict, ResourceConflict::Reject);
        assert_eq!(config.offline.queue_size, 5);
        assert!(config.roster.versioning);
        assert!(config.pubsub.features.contains(Feature::CreateNodes));
        assert!(!config.pubsub.features.contains(Feature::PurgeNodes));
        assert!(!config.pubsub.config_retrieval_enabled);
        assert_eq!(
            config.pubsub.default_node_options.access_model,
            AccessModel::Whitelist
        );
        assert_eq!(config.pubsub.default_node_options.max_items, 3);
        assert!(config.pubsub.default_node_options.deliver_notifications);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let res: Result<CoreConfig, _> = toml::from_str(
            r#"
            [pubsub]
            features = ["teleportation"]
            "#,
        );
        assert!(res.is_err());
    }
}
