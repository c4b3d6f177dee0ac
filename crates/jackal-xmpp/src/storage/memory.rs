//! In-memory repository backend.
//!
//! All state lives in one cloneable [`MemoryStore`] behind a tokio `RwLock`.
//! A transaction takes the write lock for its whole lifetime, works on a
//! staged copy and swaps it in on commit; dropping or rolling back discards
//! the copy. Writers outside the transaction wait on the lock, so no update
//! is ever lost by a commit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use xmpp_parsers::message::Message;

use super::{
    BlockListItem, BlockListRepository, Capabilities, CapabilitiesRepository, OfflineMessage,
    OfflineRepository, PubSubRepository, Repository, RosterNotification, RosterRepository,
    Transaction, User, UserRepository,
};
use crate::pubsub::{Node, NodeAffiliation, NodeItem, NodeSubscription};
use crate::roster::{RosterItem, RosterVersion};
use crate::XmppError;

#[derive(Debug, Clone, Default)]
struct MemoryStore {
    users: HashMap<String, User>,
    roster_items: HashMap<String, BTreeMap<String, RosterItem>>,
    roster_versions: HashMap<String, RosterVersion>,
    roster_notifications: HashMap<String, Vec<RosterNotification>>,
    blocklists: HashMap<String, Vec<BlockListItem>>,
    offline: HashMap<String, VecDeque<OfflineMessage>>,
    next_offline_id: u64,
    capabilities: HashMap<(String, String), Capabilities>,
    nodes: BTreeMap<(String, String), Node>,
    affiliations: Vec<NodeAffiliation>,
    subscriptions: Vec<NodeSubscription>,
    items: Vec<NodeItem>,
}

impl MemoryStore {
    fn bump_version(&mut self, username: &str, deletion: bool) -> u64 {
        let version = self.roster_versions.entry(username.to_string()).or_default();
        version.version += 1;
        if deletion {
            version.deletion_version = version.version;
        }
        version.version
    }

    fn remove_node_rows(&mut self, host: &str, name: &str) {
        self.items.retain(|i| !(i.host == host && i.node == name));
        self.subscriptions
            .retain(|s| !(s.host == host && s.node == name));
        self.affiliations
            .retain(|a| !(a.host == host && a.node == name));
    }
}

struct Staged {
    target: OwnedRwLockWriteGuard<MemoryStore>,
    copy: MemoryStore,
}

enum Backing {
    Shared(Arc<RwLock<MemoryStore>>),
    Staged(Mutex<Staged>),
}

/// Reference [`Repository`] implementation keeping everything in process
/// memory. Cloning shares the underlying store.
pub struct InMemoryRepository {
    backing: Backing,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryRepository {
    fn clone(&self) -> Self {
        match &self.backing {
            Backing::Shared(store) => Self {
                backing: Backing::Shared(Arc::clone(store)),
            },
            // Transactions are handed out boxed and never cloned by the core;
            // a cloned transaction handle falls back to an empty store.
            Backing::Staged(_) => Self::new(),
        }
    }
}

impl std::fmt::Debug for InMemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Shared(_) => "shared",
            Backing::Staged(_) => "transaction",
        };
        f.debug_struct("InMemoryRepository")
            .field("backing", &kind)
            .finish()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            backing: Backing::Shared(Arc::new(RwLock::new(MemoryStore::default()))),
        }
    }

    async fn read<R>(&self, f: impl FnOnce(&MemoryStore) -> R) -> R {
        match &self.backing {
            Backing::Shared(store) => f(&*store.read().await),
            Backing::Staged(staged) => f(&staged.lock().await.copy),
        }
    }

    async fn write<R>(&self, f: impl FnOnce(&mut MemoryStore) -> R) -> R {
        match &self.backing {
            Backing::Shared(store) => f(&mut *store.write().await),
            Backing::Staged(staged) => f(&mut staged.lock().await.copy),
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn upsert_user(&self, user: &User) -> Result<(), XmppError> {
        self.write(|s| {
            s.users.insert(user.username.clone(), user.clone());
        })
        .await;
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.users.remove(username);
        })
        .await;
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError> {
        Ok(self.read(|s| s.users.get(username).cloned()).await)
    }

    async fn user_exists(&self, username: &str) -> Result<bool, XmppError> {
        Ok(self.read(|s| s.users.contains_key(username)).await)
    }
}

#[async_trait]
impl RosterRepository for InMemoryRepository {
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<u64, XmppError> {
        let version = self
            .write(|s| {
                let version = s.bump_version(&item.username, false);
                let mut stored = item.clone();
                stored.version = version;
                s.roster_items
                    .entry(item.username.clone())
                    .or_default()
                    .insert(item.jid.to_string(), stored);
                version
            })
            .await;
        Ok(version)
    }

    async fn delete_roster_item(&self, username: &str, jid: &BareJid) -> Result<u64, XmppError> {
        let version = self
            .write(|s| {
                if let Some(items) = s.roster_items.get_mut(username) {
                    items.remove(&jid.to_string());
                }
                s.bump_version(username, true)
            })
            .await;
        Ok(version)
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, XmppError> {
        Ok(self
            .read(|s| {
                s.roster_items
                    .get(username)
                    .map(|items| items.values().cloned().collect())
                    .unwrap_or_default()
            })
            .await)
    }

    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, XmppError> {
        Ok(self
            .read(|s| {
                s.roster_items
                    .get(username)
                    .map(|items| {
                        items
                            .values()
                            .filter(|i| i.groups.iter().any(|g| groups.contains(g)))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await)
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &BareJid,
    ) -> Result<Option<RosterItem>, XmppError> {
        Ok(self
            .read(|s| {
                s.roster_items
                    .get(username)
                    .and_then(|items| items.get(&jid.to_string()).cloned())
            })
            .await)
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<RosterVersion, XmppError> {
        Ok(self
            .read(|s| s.roster_versions.get(username).copied().unwrap_or_default())
            .await)
    }

    async fn fetch_roster_groups(&self, username: &str) -> Result<Vec<String>, XmppError> {
        Ok(self
            .read(|s| {
                let mut groups: Vec<String> = s
                    .roster_items
                    .get(username)
                    .map(|items| items.values().flat_map(|i| i.groups.clone()).collect())
                    .unwrap_or_default();
                groups.sort();
                groups.dedup();
                groups
            })
            .await)
    }

    async fn upsert_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), XmppError> {
        self.write(|s| {
            let pending = s
                .roster_notifications
                .entry(notification.contact.clone())
                .or_default();
            match pending.iter_mut().find(|n| n.jid == notification.jid) {
                Some(existing) => *existing = notification.clone(),
                None => pending.push(notification.clone()),
            }
        })
        .await;
        Ok(())
    }

    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &BareJid,
    ) -> Result<(), XmppError> {
        self.write(|s| {
            if let Some(pending) = s.roster_notifications.get_mut(contact) {
                pending.retain(|n| &n.jid != jid);
            }
        })
        .await;
        Ok(())
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &BareJid,
    ) -> Result<Option<RosterNotification>, XmppError> {
        Ok(self
            .read(|s| {
                s.roster_notifications
                    .get(contact)
                    .and_then(|pending| pending.iter().find(|n| &n.jid == jid).cloned())
            })
            .await)
    }

    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, XmppError> {
        Ok(self
            .read(|s| s.roster_notifications.get(contact).cloned().unwrap_or_default())
            .await)
    }
}

#[async_trait]
impl BlockListRepository for InMemoryRepository {
    async fn insert_blocklist_items(&self, items: &[BlockListItem]) -> Result<(), XmppError> {
        self.write(|s| {
            for item in items {
                let list = s.blocklists.entry(item.username.clone()).or_default();
                if !list.contains(item) {
                    list.push(item.clone());
                }
            }
        })
        .await;
        Ok(())
    }

    async fn delete_blocklist_items(&self, items: &[BlockListItem]) -> Result<(), XmppError> {
        self.write(|s| {
            for item in items {
                if let Some(list) = s.blocklists.get_mut(&item.username) {
                    list.retain(|i| i != item);
                }
            }
        })
        .await;
        Ok(())
    }

    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<BlockListItem>, XmppError> {
        Ok(self
            .read(|s| s.blocklists.get(username).cloned().unwrap_or_default())
            .await)
    }
}

#[async_trait]
impl OfflineRepository for InMemoryRepository {
    async fn insert_offline_message(
        &self,
        username: &str,
        message: &Message,
    ) -> Result<u64, XmppError> {
        let id = self
            .write(|s| {
                s.next_offline_id += 1;
                let id = s.next_offline_id;
                s.offline
                    .entry(username.to_string())
                    .or_default()
                    .push_back(OfflineMessage {
                        id,
                        message: message.clone(),
                    });
                id
            })
            .await;
        Ok(id)
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError> {
        Ok(self
            .read(|s| s.offline.get(username).map(VecDeque::len).unwrap_or(0))
            .await)
    }

    async fn fetch_offline_messages(
        &self,
        username: &str,
    ) -> Result<Vec<OfflineMessage>, XmppError> {
        Ok(self
            .read(|s| {
                s.offline
                    .get(username)
                    .map(|queue| queue.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .await)
    }

    async fn delete_offline_messages(&self, username: &str, ids: &[u64]) -> Result<(), XmppError> {
        self.write(|s| {
            if let Some(queue) = s.offline.get_mut(username) {
                queue.retain(|m| !ids.contains(&m.id));
                if queue.is_empty() {
                    s.offline.remove(username);
                }
            }
        })
        .await;
        Ok(())
    }

    async fn delete_all_offline_messages(&self, username: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.offline.remove(username);
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl CapabilitiesRepository for InMemoryRepository {
    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), XmppError> {
        self.write(|s| {
            s.capabilities
                .insert((caps.node.clone(), caps.ver.clone()), caps.clone());
        })
        .await;
        Ok(())
    }

    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, XmppError> {
        Ok(self
            .read(|s| {
                s.capabilities
                    .contains_key(&(node.to_string(), ver.to_string()))
            })
            .await)
    }

    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<Capabilities>, XmppError> {
        Ok(self
            .read(|s| {
                s.capabilities
                    .get(&(node.to_string(), ver.to_string()))
                    .cloned()
            })
            .await)
    }
}

#[async_trait]
impl PubSubRepository for InMemoryRepository {
    async fn upsert_node(&self, node: &Node) -> Result<(), XmppError> {
        self.write(|s| {
            s.nodes
                .insert((node.host.clone(), node.name.clone()), node.clone());
        })
        .await;
        Ok(())
    }

    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<Node>, XmppError> {
        Ok(self
            .read(|s| s.nodes.get(&(host.to_string(), name.to_string())).cloned())
            .await)
    }

    async fn fetch_nodes(&self, host: &str) -> Result<Vec<Node>, XmppError> {
        Ok(self
            .read(|s| {
                s.nodes
                    .values()
                    .filter(|n| n.host == host)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn node_exists(&self, host: &str, name: &str) -> Result<bool, XmppError> {
        Ok(self
            .read(|s| s.nodes.contains_key(&(host.to_string(), name.to_string())))
            .await)
    }

    async fn delete_node(&self, host: &str, name: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.nodes.remove(&(host.to_string(), name.to_string()));
            s.remove_node_rows(host, name);
        })
        .await;
        Ok(())
    }

    async fn delete_nodes(&self, host: &str) -> Result<(), XmppError> {
        self.write(|s| {
            let names: Vec<String> = s
                .nodes
                .keys()
                .filter(|(h, _)| h == host)
                .map(|(_, n)| n.clone())
                .collect();
            for name in names {
                s.nodes.remove(&(host.to_string(), name.clone()));
                s.remove_node_rows(host, &name);
            }
        })
        .await;
        Ok(())
    }

    async fn upsert_affiliation(&self, affiliation: &NodeAffiliation) -> Result<(), XmppError> {
        self.write(|s| {
            match s.affiliations.iter_mut().find(|a| {
                a.host == affiliation.host
                    && a.node == affiliation.node
                    && a.jid == affiliation.jid
            }) {
                Some(existing) => *existing = affiliation.clone(),
                None => s.affiliations.push(affiliation.clone()),
            }
        })
        .await;
        Ok(())
    }

    async fn fetch_affiliation(
        &self,
        host: &str,
        name: &str,
        jid: &BareJid,
    ) -> Result<Option<NodeAffiliation>, XmppError> {
        Ok(self
            .read(|s| {
                s.affiliations
                    .iter()
                    .find(|a| a.host == host && a.node == name && &a.jid == jid)
                    .cloned()
            })
            .await)
    }

    async fn fetch_affiliations(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<NodeAffiliation>, XmppError> {
        Ok(self
            .read(|s| {
                s.affiliations
                    .iter()
                    .filter(|a| a.host == host && a.node == name)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn fetch_affiliations_by_jid(
        &self,
        host: &str,
        jid: &BareJid,
    ) -> Result<Vec<NodeAffiliation>, XmppError> {
        Ok(self
            .read(|s| {
                s.affiliations
                    .iter()
                    .filter(|a| a.host == host && &a.jid == jid)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn delete_affiliation(
        &self,
        host: &str,
        name: &str,
        jid: &BareJid,
    ) -> Result<(), XmppError> {
        self.write(|s| {
            s.affiliations
                .retain(|a| !(a.host == host && a.node == name && &a.jid == jid));
        })
        .await;
        Ok(())
    }

    async fn delete_affiliations(&self, host: &str, name: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.affiliations
                .retain(|a| !(a.host == host && a.node == name));
        })
        .await;
        Ok(())
    }

    async fn upsert_subscription(&self, subscription: &NodeSubscription) -> Result<(), XmppError> {
        self.write(|s| {
            match s.subscriptions.iter_mut().find(|x| {
                x.host == subscription.host
                    && x.node == subscription.node
                    && x.jid == subscription.jid
            }) {
                Some(existing) => *existing = subscription.clone(),
                None => s.subscriptions.push(subscription.clone()),
            }
        })
        .await;
        Ok(())
    }

    async fn fetch_subscription(
        &self,
        host: &str,
        name: &str,
        jid: &Jid,
    ) -> Result<Option<NodeSubscription>, XmppError> {
        Ok(self
            .read(|s| {
                s.subscriptions
                    .iter()
                    .find(|x| x.host == host && x.node == name && &x.jid == jid)
                    .cloned()
            })
            .await)
    }

    async fn fetch_subscriptions(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<NodeSubscription>, XmppError> {
        Ok(self
            .read(|s| {
                s.subscriptions
                    .iter()
                    .filter(|x| x.host == host && x.node == name)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn fetch_subscriptions_by_jid(
        &self,
        host: &str,
        jid: &Jid,
    ) -> Result<Vec<NodeSubscription>, XmppError> {
        Ok(self
            .read(|s| {
                s.subscriptions
                    .iter()
                    .filter(|x| x.host == host && &x.jid == jid)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn delete_subscription(
        &self,
        host: &str,
        name: &str,
        jid: &Jid,
    ) -> Result<(), XmppError> {
        self.write(|s| {
            s.subscriptions
                .retain(|x| !(x.host == host && x.node == name && &x.jid == jid));
        })
        .await;
        Ok(())
    }

    async fn delete_subscriptions(&self, host: &str, name: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.subscriptions
                .retain(|x| !(x.host == host && x.node == name));
        })
        .await;
        Ok(())
    }

    async fn upsert_item(&self, item: &NodeItem) -> Result<(), XmppError> {
        self.write(|s| {
            // Republishing an id moves it to the newest position.
            s.items
                .retain(|i| !(i.host == item.host && i.node == item.node && i.id == item.id));
            s.items.push(item.clone());
        })
        .await;
        Ok(())
    }

    async fn fetch_item(
        &self,
        host: &str,
        name: &str,
        id: &str,
    ) -> Result<Option<NodeItem>, XmppError> {
        Ok(self
            .read(|s| {
                s.items
                    .iter()
                    .find(|i| i.host == host && i.node == name && i.id == id)
                    .cloned()
            })
            .await)
    }

    async fn fetch_items(&self, host: &str, name: &str) -> Result<Vec<NodeItem>, XmppError> {
        Ok(self
            .read(|s| {
                s.items
                    .iter()
                    .filter(|i| i.host == host && i.node == name)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn delete_item(&self, host: &str, name: &str, id: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.items
                .retain(|i| !(i.host == host && i.node == name && i.id == id));
        })
        .await;
        Ok(())
    }

    async fn delete_items(&self, host: &str, name: &str) -> Result<(), XmppError> {
        self.write(|s| {
            s.items.retain(|i| !(i.host == host && i.node == name));
        })
        .await;
        Ok(())
    }

    async fn delete_oldest_items(
        &self,
        host: &str,
        name: &str,
        keep: usize,
    ) -> Result<(), XmppError> {
        self.write(|s| {
            let total = s
                .items
                .iter()
                .filter(|i| i.host == host && i.node == name)
                .count();
            let mut excess = total.saturating_sub(keep);
            s.items.retain(|i| {
                if excess > 0 && i.host == host && i.node == name {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryRepository {
    async fn commit(self: Box<Self>) -> Result<(), XmppError> {
        match self.backing {
            Backing::Staged(staged) => {
                let Staged { mut target, copy } = staged.into_inner();
                *target = copy;
                Ok(())
            }
            Backing::Shared(_) => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), XmppError> {
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn begin(&self) -> Result<Box<dyn Transaction>, XmppError> {
        match &self.backing {
            Backing::Shared(store) => {
                let target = Arc::clone(store).write_owned().await;
                let copy = target.clone();
                Ok(Box::new(InMemoryRepository {
                    backing: Backing::Staged(Mutex::new(Staged { target, copy })),
                }))
            }
            Backing::Staged(_) => Err(XmppError::internal(
                "nested transactions are not supported",
            )),
        }
    }
}
