//! Persistence abstraction.
//!
//! The core owns no storage dialect. Everything durable goes through the
//! [`Repository`] trait family below; [`memory::InMemoryRepository`] is the
//! reference backend used by the server binary and the test-suite.
//!
//! Multi-step mutations run inside a [`Transaction`] obtained from
//! [`Repository::begin`], usually through [`in_transaction`]:
//!
//! ```ignore
//! in_transaction(repo.as_ref(), move |tx| Box::pin(async move {
//!     tx.upsert_node(&node).await?;
//!     tx.upsert_affiliation(&owner).await?;
//!     Ok(())
//! })).await?;
//! ```

pub mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use jid::{BareJid, Jid};
use tracing::warn;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::pubsub::{Node, NodeAffiliation, NodeItem, NodeSubscription};
use crate::roster::{RosterItem, RosterVersion};
use crate::XmppError;

/// A registered local account.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    /// Opaque credential material owned by the authentication layer.
    pub credentials: Option<String>,
    pub last_presence: Option<Presence>,
    pub logout_status: Option<String>,
    pub logout_time: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            credentials: None,
            last_presence: None,
            logout_status: None,
            logout_time: None,
        }
    }
}

/// A pending inbound subscription request awaiting the contact's answer.
#[derive(Debug, Clone)]
pub struct RosterNotification {
    /// Username of the local contact being asked.
    pub contact: String,
    /// Bare JID of the requester.
    pub jid: BareJid,
    /// The original `subscribe` presence.
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockListItem {
    pub username: String,
    /// Bare, full or domain-only address.
    pub jid: Jid,
}

#[derive(Debug, Clone)]
pub struct OfflineMessage {
    /// Store-assigned, increasing per store.
    pub id: u64,
    pub message: Message,
}

/// XEP-0115 capabilities entry, content addressed by `(node, ver)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub node: String,
    pub ver: String,
    pub features: Vec<String>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn upsert_user(&self, user: &User) -> Result<(), XmppError>;
    async fn delete_user(&self, username: &str) -> Result<(), XmppError>;
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError>;
    async fn user_exists(&self, username: &str) -> Result<bool, XmppError>;
}

#[async_trait]
pub trait RosterRepository: Send + Sync {
    /// Insert or replace an item; returns the owner's new roster version.
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<u64, XmppError>;
    /// Delete an item; returns the owner's new roster version.
    async fn delete_roster_item(&self, username: &str, jid: &BareJid) -> Result<u64, XmppError>;
    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, XmppError>;
    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, XmppError>;
    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &BareJid,
    ) -> Result<Option<RosterItem>, XmppError>;
    async fn fetch_roster_version(&self, username: &str) -> Result<RosterVersion, XmppError>;
    async fn fetch_roster_groups(&self, username: &str) -> Result<Vec<String>, XmppError>;

    async fn upsert_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), XmppError>;
    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &BareJid,
    ) -> Result<(), XmppError>;
    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &BareJid,
    ) -> Result<Option<RosterNotification>, XmppError>;
    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, XmppError>;
}

#[async_trait]
pub trait BlockListRepository: Send + Sync {
    /// Insert items; already present items are left untouched.
    async fn insert_blocklist_items(&self, items: &[BlockListItem]) -> Result<(), XmppError>;
    async fn delete_blocklist_items(&self, items: &[BlockListItem]) -> Result<(), XmppError>;
    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<BlockListItem>, XmppError>;
}

#[async_trait]
pub trait OfflineRepository: Send + Sync {
    async fn insert_offline_message(
        &self,
        username: &str,
        message: &Message,
    ) -> Result<u64, XmppError>;
    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError>;
    /// Queued messages in FIFO order.
    async fn fetch_offline_messages(&self, username: &str)
        -> Result<Vec<OfflineMessage>, XmppError>;
    async fn delete_offline_messages(&self, username: &str, ids: &[u64]) -> Result<(), XmppError>;
    async fn delete_all_offline_messages(&self, username: &str) -> Result<(), XmppError>;
}

#[async_trait]
pub trait CapabilitiesRepository: Send + Sync {
    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), XmppError>;
    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, XmppError>;
    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<Capabilities>, XmppError>;
}

#[async_trait]
pub trait PubSubRepository: Send + Sync {
    async fn upsert_node(&self, node: &Node) -> Result<(), XmppError>;
    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<Node>, XmppError>;
    async fn fetch_nodes(&self, host: &str) -> Result<Vec<Node>, XmppError>;
    async fn node_exists(&self, host: &str, name: &str) -> Result<bool, XmppError>;
    async fn delete_node(&self, host: &str, name: &str) -> Result<(), XmppError>;
    /// Delete every node of `host` together with its dependent rows.
    async fn delete_nodes(&self, host: &str) -> Result<(), XmppError>;

    async fn upsert_affiliation(&self, affiliation: &NodeAffiliation) -> Result<(), XmppError>;
    async fn fetch_affiliation(
        &self,
        host: &str,
        name: &str,
        jid: &BareJid,
    ) -> Result<Option<NodeAffiliation>, XmppError>;
    async fn fetch_affiliations(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<NodeAffiliation>, XmppError>;
    async fn fetch_affiliations_by_jid(
        &self,
        host: &str,
        jid: &BareJid,
    ) -> Result<Vec<NodeAffiliation>, XmppError>;
    async fn delete_affiliation(
        &self,
        host: &str,
        name: &str,
        jid: &BareJid,
    ) -> Result<(), XmppError>;
    async fn delete_affiliations(&self, host: &str, name: &str) -> Result<(), XmppError>;

    async fn upsert_subscription(&self, subscription: &NodeSubscription) -> Result<(), XmppError>;
    async fn fetch_subscription(
        &self,
        host: &str,
        name: &str,
        jid: &Jid,
    ) -> Result<Option<NodeSubscription>, XmppError>;
    async fn fetch_subscriptions(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<NodeSubscription>, XmppError>;
    async fn fetch_subscriptions_by_jid(
        &self,
        host: &str,
        jid: &Jid,
    ) -> Result<Vec<NodeSubscription>, XmppError>;
    async fn delete_subscription(&self, host: &str, name: &str, jid: &Jid)
        -> Result<(), XmppError>;
    async fn delete_subscriptions(&self, host: &str, name: &str) -> Result<(), XmppError>;

    async fn upsert_item(&self, item: &NodeItem) -> Result<(), XmppError>;
    async fn fetch_item(
        &self,
        host: &str,
        name: &str,
        id: &str,
    ) -> Result<Option<NodeItem>, XmppError>;
    /// Items in publication order, oldest first.
    async fn fetch_items(&self, host: &str, name: &str) -> Result<Vec<NodeItem>, XmppError>;
    async fn delete_item(&self, host: &str, name: &str, id: &str) -> Result<(), XmppError>;
    async fn delete_items(&self, host: &str, name: &str) -> Result<(), XmppError>;
    /// Keep only the `keep` most recent items.
    async fn delete_oldest_items(&self, host: &str, name: &str, keep: usize)
        -> Result<(), XmppError>;
}

/// Unit of work exposing every repository operation plus commit/rollback.
#[async_trait]
pub trait Transaction:
    UserRepository
    + RosterRepository
    + BlockListRepository
    + OfflineRepository
    + CapabilitiesRepository
    + PubSubRepository
{
    async fn commit(self: Box<Self>) -> Result<(), XmppError>;
    async fn rollback(self: Box<Self>) -> Result<(), XmppError>;
}

#[async_trait]
pub trait Repository:
    UserRepository
    + RosterRepository
    + BlockListRepository
    + OfflineRepository
    + CapabilitiesRepository
    + PubSubRepository
{
    async fn begin(&self) -> Result<Box<dyn Transaction>, XmppError>;
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// `f` must not have side effects outside the transaction handle.
pub async fn in_transaction<T, F>(repo: &dyn Repository, f: F) -> Result<T, XmppError>
where
    T: Send,
    F: for<'t> FnOnce(&'t dyn Transaction) -> BoxFuture<'t, Result<T, XmppError>> + Send,
{
    let tx = repo.begin().await?;
    let outcome = f(tx.as_ref()).await;
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(e)
        }
    }
}
