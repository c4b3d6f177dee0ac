//! PubSub node model: options, affiliations, subscriptions and items.

use std::fmt;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use serde::Deserialize;

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    Open,
    /// Entities with a presence subscription to the owner.
    #[default]
    Presence,
    /// Entities in one of the allowed roster groups of the owner.
    Roster,
    /// Subscriptions need owner approval and start as pending.
    Authorize,
    /// Only explicitly affiliated JIDs can access.
    Whitelist,
}

impl AccessModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Authorize => "authorize",
            AccessModel::Whitelist => "whitelist",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "authorize" => Some(AccessModel::Authorize),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publish model for a PubSub node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishModel {
    /// Owners and publishers can publish.
    #[default]
    Publishers,
    /// Subscribers can publish as well.
    Subscribers,
    /// Anyone can publish.
    Open,
}

impl PublishModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishModel::Publishers => "publishers",
            PublishModel::Subscribers => "subscribers",
            PublishModel::Open => "open",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublishModel::Publishers),
            "subscribers" => Some(PublishModel::Subscribers),
            "open" => Some(PublishModel::Open),
            _ => None,
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When to send the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendLastPublishedItem {
    Never,
    /// Send on subscription only.
    #[default]
    OnSub,
    /// Send on subscription and when the subscriber comes online.
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
            SendLastPublishedItem::OnSubAndPresence => "on_sub_and_presence",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            "on_sub_and_presence" => Some(SendLastPublishedItem::OnSubAndPresence),
            _ => None,
        }
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type used for event notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Normal,
    #[default]
    Headline,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Normal => "normal",
            NotificationType::Headline => "headline",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(NotificationType::Normal),
            "headline" => Some(NotificationType::Headline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeType {
    #[default]
    Leaf,
    Collection,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Leaf => "leaf",
            NodeType::Collection => "collection",
        }
    }
}

/// Configurable node options (`pubsub#node_config`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeOptions {
    pub title: String,
    pub deliver_notifications: bool,
    pub deliver_payloads: bool,
    pub notify_config: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub notify_sub: bool,
    pub persist_items: bool,
    /// Maximum number of persisted items, 0 for unlimited.
    pub max_items: u32,
    /// Seconds after which items expire, 0 for never.
    pub item_expire: u64,
    pub access_model: AccessModel,
    pub publish_model: PublishModel,
    pub roster_groups_allowed: Vec<String>,
    pub send_last_published_item: SendLastPublishedItem,
    pub notification_type: NotificationType,
    /// Only deliver notifications to available resources.
    pub presence_based_delivery: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            deliver_notifications: true,
            deliver_payloads: true,
            notify_config: true,
            notify_delete: true,
            notify_retract: true,
            notify_sub: false,
            persist_items: true,
            max_items: 10,
            item_expire: 0,
            access_model: AccessModel::Presence,
            publish_model: PublishModel::Publishers,
            roster_groups_allowed: Vec::new(),
            send_last_published_item: SendLastPublishedItem::OnSub,
            notification_type: NotificationType::Headline,
            presence_based_delivery: false,
        }
    }
}

impl NodeOptions {
    /// Options for a node everyone can read.
    pub fn open() -> Self {
        Self {
            access_model: AccessModel::Open,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub host: String,
    pub name: String,
    pub node_type: NodeType,
    pub options: NodeOptions,
}

impl Node {
    pub fn new(host: impl Into<String>, name: impl Into<String>, options: NodeOptions) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
            node_type: NodeType::Leaf,
            options,
        }
    }
}

/// Long-term relationship of an entity to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    #[default]
    None,
    Owner,
    Publisher,
    PublishOnly,
    Member,
    Outcast,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::None => "none",
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::PublishOnly => "publish-only",
            Affiliation::Member => "member",
            Affiliation::Outcast => "outcast",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Affiliation::None),
            "owner" => Some(Affiliation::Owner),
            "publisher" => Some(Affiliation::Publisher),
            "publish-only" => Some(Affiliation::PublishOnly),
            "member" => Some(Affiliation::Member),
            "outcast" => Some(Affiliation::Outcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeAffiliation {
    pub host: String,
    pub node: String,
    pub jid: BareJid,
    pub affiliation: Affiliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    None,
    Pending,
    Subscribed,
    Unconfigured,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unconfigured => "unconfigured",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SubscriptionState::None),
            "pending" => Some(SubscriptionState::Pending),
            "subscribed" => Some(SubscriptionState::Subscribed),
            "unconfigured" => Some(SubscriptionState::Unconfigured),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSubscription {
    pub host: String,
    pub node: String,
    /// Subscription id (`subid`).
    pub id: String,
    pub jid: Jid,
    pub state: SubscriptionState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeItem {
    pub host: String,
    pub node: String,
    pub id: String,
    pub publisher: Jid,
    pub payload: Option<Element>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_model_parse() {
        assert_eq!(AccessModel::from_str("open"), Some(AccessModel::Open));
        assert_eq!(AccessModel::from_str("presence"), Some(AccessModel::Presence));
        assert_eq!(AccessModel::from_str("roster"), Some(AccessModel::Roster));
        assert_eq!(AccessModel::from_str("authorize"), Some(AccessModel::Authorize));
        assert_eq!(AccessModel::from_str("whitelist"), Some(AccessModel::Whitelist));
        assert_eq!(AccessModel::from_str("invalid"), None);
    }

    #[test]
    fn test_enumerations_render_wire_values() {
        assert_eq!(AccessModel::Open.to_string(), "open");
        assert_eq!(PublishModel::Subscribers.to_string(), "subscribers");
        assert_eq!(SendLastPublishedItem::OnSubAndPresence.to_string(), "on_sub_and_presence");
        assert_eq!(Affiliation::PublishOnly.as_str(), "publish-only");
        assert_eq!(Affiliation::from_str("publish-only"), Some(Affiliation::PublishOnly));
        assert_eq!(SubscriptionState::from_str("pending"), Some(SubscriptionState::Pending));
    }

    #[test]
    fn test_node_options_defaults() {
        let options = NodeOptions::default();
        assert!(options.deliver_notifications);
        assert!(options.notify_config);
        assert_eq!(options.access_model, AccessModel::Presence);
        assert_eq!(options.notification_type, NotificationType::Headline);
        assert_eq!(NodeOptions::open().access_model, AccessModel::Open);
    }
}
