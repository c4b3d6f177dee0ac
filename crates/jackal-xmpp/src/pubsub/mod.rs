//! XEP-0060: Publish-Subscribe
//!
//! A publish-subscribe service served on one or more component domains.
//!
//! ## Overview
//!
//! - Owners create nodes, configure them through data forms and manage
//!   affiliations and subscriptions
//! - Publishers publish and retract items; subscribers receive event
//!   notifications fanned out from the service
//! - Every feature can be switched off per deployment; a disabled feature
//!   answers `feature-not-implemented` with a `pubsub#errors` condition
//!
//! ## Supported Features
//!
//! - Instant nodes, create-and-configure, auto-create on publish
//! - Access models: open, presence, roster, authorize, whitelist
//! - Persistent items with `max_items` and `item_expire`
//! - Last published item on subscribe and on presence
//! - Presence-based delivery and filtered notifications (XEP-0115)
//!
//! ## XML Namespaces
//!
//! - `http://jabber.org/protocol/pubsub` - Main PubSub namespace
//! - `http://jabber.org/protocol/pubsub#event` - Event notifications
//! - `http://jabber.org/protocol/pubsub#owner` - Node owner operations
//! - `http://jabber.org/protocol/pubsub#errors` - PubSub-specific errors

pub mod component;
pub mod features;
pub mod form;
pub mod node;
pub mod service;
pub mod stanzas;

pub use component::PubSubComponent;
pub use features::{has_privileges, Feature, PubSubFeatures};
pub use form::{form_to_options, options_to_form};
pub use node::{
    AccessModel, Affiliation, Node, NodeAffiliation, NodeItem, NodeOptions, NodeSubscription,
    NodeType, NotificationType, PublishModel, SendLastPublishedItem, SubscriptionState,
};
pub use service::{AllowAll, EntityValidation, EntityValidator, PubSubService};
pub use stanzas::{is_pubsub_iq, parse_pubsub_iq, PubSubRequest};
