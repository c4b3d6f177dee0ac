//! XEP-0060 publish-subscribe service.
//!
//! One service instance backs every pubsub host; the per-host
//! [`super::PubSubComponent`] hands it IQs. Node state lives in the
//! repository. Notifications are fanned out with bounded parallelism under
//! the requesting session's context, so a disconnect stops delivery.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::presence::Type as PresenceType;

use super::features::{has_privileges, Feature, PubSubFeatures};
use super::form::{form_to_options, options_to_form};
use super::node::{
    AccessModel, Affiliation, Node, NodeAffiliation, NodeItem, NodeOptions, NodeSubscription,
    PublishModel, SendLastPublishedItem, SubscriptionState,
};
use super::stanzas::{
    affiliation_element, build_event_message, item_element, items_element, parse_pubsub_iq,
    pubsub_error, pubsub_payload, subscription_element, unsupported, PubSubRequest,
};
use crate::config::PubSubConfig;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::ns::{PUBSUB, PUBSUB_EVENT, PUBSUB_OWNER};
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::storage::{in_transaction, Repository};
use crate::xep::xep0004::FormType;
use crate::xep::CapabilitiesCache;
use crate::{Context, Stanza, XmppError};

/// Maximum notifications in flight per fan-out.
const FANOUT_CONCURRENCY: usize = 16;

/// Outcome of an [`EntityValidator`] check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityValidation {
    Ok,
    NotRegistered,
    NotAllowed,
}

/// Site policy deciding whether an entity may use a pubsub feature at all.
#[async_trait]
pub trait EntityValidator: Send + Sync {
    async fn validate(&self, jid: &Jid, feature: Feature) -> EntityValidation;
}

/// Validator admitting every entity.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl EntityValidator for AllowAll {
    async fn validate(&self, _jid: &Jid, _feature: Feature) -> EntityValidation {
        EntityValidation::Ok
    }
}

pub struct PubSubService {
    hosts: Vec<String>,
    features: PubSubFeatures,
    default_options: NodeOptions,
    config_retrieval_enabled: bool,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    validator: Arc<dyn EntityValidator>,
    caps: Option<Arc<CapabilitiesCache>>,
    /// Available resources per account.
    active: DashMap<BareJid, HashSet<FullJid>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl std::fmt::Debug for PubSubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubService")
            .field("hosts", &self.hosts)
            .field("features", &self.features)
            .field("active_accounts", &self.active.len())
            .finish()
    }
}

impl PubSubService {
    pub fn new(
        config: &PubSubConfig,
        hosts: Vec<String>,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            hosts,
            features: config.features,
            default_options: config.default_node_options.clone(),
            config_retrieval_enabled: config.config_retrieval_enabled,
            repository,
            router,
            events,
            validator: Arc::new(AllowAll),
            caps: None,
            active: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Use entity capabilities for filtered notifications.
    pub fn with_capabilities(mut self, caps: Arc<CapabilitiesCache>) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Feature URIs advertised through disco#info.
    pub fn disco_features(&self) -> Vec<String> {
        std::iter::once(PUBSUB.to_string())
            .chain(self.features.iter().map(|f| f.uri()))
            .collect()
    }

    /// Start tracking session availability through `events`.
    pub fn attach(self: &Arc<Self>) {
        let handler = Arc::new(PubSubEvents(Arc::downgrade(self)));
        let ids = vec![
            self.events.subscribe(EventKind::PresenceReceived, handler.clone()),
            self.events.subscribe(EventKind::SessionUnbound, handler),
        ];
        if let Ok(mut slot) = self.subscriptions.lock() {
            slot.extend(ids);
        }
    }

    pub fn detach(&self) {
        let ids = self
            .subscriptions
            .lock()
            .map(|mut slot| std::mem::take(&mut *slot))
            .unwrap_or_default();
        for id in ids {
            self.events.unsubscribe(id);
        }
        self.active.clear();
    }

    /// Mark `jid` available. Returns `true` when it was not tracked yet.
    pub fn register_session(&self, jid: &FullJid) -> bool {
        self.active
            .entry(jid.to_bare())
            .or_default()
            .insert(jid.clone())
    }

    /// Forget `jid`; the account entry goes away with its last resource.
    pub fn unregister_session(&self, jid: &FullJid) {
        let bare = jid.to_bare();
        if let Some(mut resources) = self.active.get_mut(&bare) {
            resources.remove(jid);
        }
        self.active.remove_if(&bare, |_, resources| resources.is_empty());
    }

    pub fn active_sessions(&self, bare: &BareJid) -> Vec<FullJid> {
        self.active
            .get(bare)
            .map(|resources| resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn require(&self, feature: Feature) -> Result<(), XmppError> {
        if self.features.contains(feature) {
            Ok(())
        } else {
            Err(unsupported(feature))
        }
    }

    /// Handle a pubsub IQ addressed to `host` and route the result.
    #[instrument(skip(self, ctx, iq), fields(id = %iq.id))]
    pub async fn process_iq(&self, ctx: &Context, host: &str, iq: &Iq) -> Result<(), XmppError> {
        let requester = iq
            .from
            .clone()
            .ok_or_else(|| XmppError::bad_request(None))?;
        let request = parse_pubsub_iq(iq)?;
        let feature = request.feature();
        if !matches!(request, PubSubRequest::Default) {
            self.require(feature)?;
        }
        match self.validator.validate(&requester, feature).await {
            EntityValidation::Ok => {}
            EntityValidation::NotRegistered => return Err(XmppError::registration_required(None)),
            EntityValidation::NotAllowed => return Err(XmppError::not_allowed(None)),
        }
        debug!(host, node = ?request.node(), feature = %feature, "PubSub request");

        let payload = self.execute(ctx, host, &requester, request).await?;
        self.router
            .route(ctx, Stanza::Iq(iq_result(iq, payload)))
            .await
    }

    async fn execute(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        request: PubSubRequest,
    ) -> Result<Option<Element>, XmppError> {
        match request {
            PubSubRequest::Create { node, config } => {
                self.create(host, requester, node, config).await
            }
            PubSubRequest::Subscribe { node, jid } => {
                self.subscribe(ctx, host, requester, &node, jid).await
            }
            PubSubRequest::Unsubscribe { node, jid, subid } => {
                self.unsubscribe(host, requester, &node, &jid, subid.as_deref()).await
            }
            PubSubRequest::Publish { node, item_id, payload } => {
                self.publish(ctx, host, requester, &node, item_id, payload).await
            }
            PubSubRequest::Retract { node, item_ids, notify } => {
                self.retract(ctx, host, requester, &node, &item_ids, notify).await
            }
            PubSubRequest::Items { node, max_items, item_ids } => {
                self.items(host, requester, &node, max_items, &item_ids).await
            }
            PubSubRequest::Subscriptions { node } => {
                self.user_subscriptions(host, requester, node).await
            }
            PubSubRequest::Affiliations { node } => {
                self.user_affiliations(host, requester, node).await
            }
            PubSubRequest::ConfigureGet { node } => {
                self.configure_get(host, requester, &node).await
            }
            PubSubRequest::ConfigureSet { node, form } => {
                self.configure_set(ctx, host, requester, &node, form).await
            }
            PubSubRequest::Default => self.default_configuration(),
            PubSubRequest::Delete { node } => self.delete(ctx, host, requester, &node).await,
            PubSubRequest::Purge { node } => self.purge(ctx, host, requester, &node).await,
            PubSubRequest::OwnerAffiliationsGet { node } => {
                self.owner_affiliations(host, requester, &node).await
            }
            PubSubRequest::OwnerAffiliationsSet { node, affiliations } => {
                self.set_affiliations(host, requester, &node, affiliations).await
            }
            PubSubRequest::OwnerSubscriptionsGet { node } => {
                self.owner_subscriptions(host, requester, &node).await
            }
            PubSubRequest::OwnerSubscriptionsSet { node, subscriptions } => {
                self.set_subscriptions(host, requester, &node, subscriptions).await
            }
        }
    }

    async fn node(&self, host: &str, name: &str) -> Result<Node, XmppError> {
        self.repository
            .fetch_node(host, name)
            .await?
            .ok_or_else(|| XmppError::item_not_found(None))
    }

    async fn affiliation(
        &self,
        host: &str,
        name: &str,
        jid: &Jid,
    ) -> Result<Affiliation, XmppError> {
        Ok(self
            .repository
            .fetch_affiliation(host, name, &jid.to_bare())
            .await?
            .map(|a| a.affiliation)
            .unwrap_or_default())
    }

    /// Fetch `name` and fail with `forbidden` unless `requester` may use
    /// `feature` on it.
    async fn privileged_node(
        &self,
        host: &str,
        name: &str,
        requester: &Jid,
        feature: Feature,
    ) -> Result<Node, XmppError> {
        let node = self.node(host, name).await?;
        let affiliation = self.affiliation(host, name, requester).await?;
        if !has_privileges(affiliation, feature) {
            return Err(XmppError::forbidden(None));
        }
        Ok(node)
    }

    /// Whether a local owner of `node` shares presence with `jid`, optionally
    /// restricted to the given roster groups.
    async fn owner_shares_presence(
        &self,
        node: &Node,
        jid: &BareJid,
        groups: Option<&[String]>,
    ) -> Result<bool, XmppError> {
        let owners = self.repository.fetch_affiliations(&node.host, &node.name).await?;
        for owner in owners.iter().filter(|a| a.affiliation == Affiliation::Owner) {
            let Some(username) = owner.jid.node() else {
                continue;
            };
            if !self.router.hosts().is_local(owner.jid.domain().as_str()) {
                continue;
            }
            let item = self
                .repository
                .fetch_roster_item(username.as_str(), jid)
                .await?;
            let shares = item.is_some_and(|item| {
                item.sends_presence()
                    && groups.map_or(true, |allowed| {
                        item.groups.iter().any(|g| allowed.contains(g))
                    })
            });
            if shares {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Access model check for subscribing to and reading `node`.
    async fn check_access(
        &self,
        node: &Node,
        requester: &Jid,
        affiliation: Affiliation,
    ) -> Result<(), XmppError> {
        match affiliation {
            Affiliation::Owner | Affiliation::Publisher | Affiliation::Member => return Ok(()),
            Affiliation::Outcast => return Err(XmppError::forbidden(None)),
            _ => {}
        }
        let bare = requester.to_bare();
        match node.options.access_model {
            AccessModel::Open | AccessModel::Authorize => Ok(()),
            AccessModel::Presence => {
                if self.owner_shares_presence(node, &bare, None).await? {
                    Ok(())
                } else {
                    Err(pubsub_error(
                        XmppError::not_authorized(None),
                        "presence-subscription-required",
                    ))
                }
            }
            AccessModel::Roster => {
                let groups = &node.options.roster_groups_allowed;
                if self.owner_shares_presence(node, &bare, Some(groups)).await? {
                    Ok(())
                } else {
                    Err(pubsub_error(XmppError::not_authorized(None), "not-in-roster-group"))
                }
            }
            AccessModel::Whitelist => {
                Err(pubsub_error(XmppError::not_allowed(None), "closed-node"))
            }
        }
    }

    /// Where notifications for `subscriber` go.
    async fn delivery_targets(&self, node: &Node, subscriber: &Jid) -> Vec<Jid> {
        if !node.options.presence_based_delivery {
            return vec![subscriber.clone()];
        }
        let resources = match subscriber.clone().try_into_full() {
            Ok(full) => self
                .active_sessions(&full.to_bare())
                .into_iter()
                .filter(|r| *r == full)
                .collect(),
            Err(bare) => self.active_sessions(&bare),
        };

        let mut targets = Vec::with_capacity(resources.len());
        for resource in resources {
            let jid = Jid::from(resource);
            if self.wants_notifications(&node.name, &jid).await {
                targets.push(jid);
            }
        }
        targets
    }

    /// Filtered notifications: an entity advertising capabilities receives
    /// events only for nodes it lists as `<node>+notify`.
    async fn wants_notifications(&self, node: &str, jid: &Jid) -> bool {
        let filtered = self.features.contains(Feature::FilteredNotifications);
        let Some(caps) = self.caps.as_ref().filter(|_| filtered) else {
            return true;
        };
        match caps.features_for(jid).await {
            Ok(features) if !features.is_empty() => {
                let wanted = format!("{}+notify", node);
                features.iter().any(|f| *f == wanted)
            }
            _ => true,
        }
    }

    async fn send_notifications(
        &self,
        ctx: &Context,
        node: &Node,
        targets: Vec<Jid>,
        event: Element,
    ) {
        let Ok(from) = node.host.parse::<Jid>() else {
            warn!(host = %node.host, "Invalid pubsub host address");
            return;
        };
        let notification_type = node.options.notification_type;
        let count = targets.len();
        stream::iter(targets)
            .for_each_concurrent(FANOUT_CONCURRENCY, |to| {
                let message = build_event_message(&from, &to, notification_type, event.clone());
                async move {
                    if let Err(e) = self.router.route(ctx, Stanza::Message(message)).await {
                        warn!(to = %to, error = %e, "Failed to deliver pubsub notification");
                    }
                }
            })
            .await;
        debug!(node = %node.name, count, "Notifications sent");
    }

    /// Notify every `subscribed` subscriber of `node`.
    async fn notify_subscribers(
        &self,
        ctx: &Context,
        node: &Node,
        subscriptions: &[NodeSubscription],
        event: Element,
    ) {
        let mut targets = Vec::new();
        let subscribed = subscriptions
            .iter()
            .filter(|s| s.state == SubscriptionState::Subscribed);
        for subscription in subscribed {
            targets.extend(self.delivery_targets(node, &subscription.jid).await);
        }
        self.send_notifications(ctx, node, targets, event).await;
    }

    async fn notify_all(
        &self,
        ctx: &Context,
        node: &Node,
        event: Element,
    ) -> Result<(), XmppError> {
        let subscriptions = self
            .repository
            .fetch_subscriptions(&node.host, &node.name)
            .await?;
        self.notify_subscribers(ctx, node, &subscriptions, event).await;
        Ok(())
    }

    /// Item notifications: explicit subscribers plus, with auto-subscribe,
    /// the implicit ones.
    async fn notify_items(
        &self,
        ctx: &Context,
        node: &Node,
        event: Element,
    ) -> Result<(), XmppError> {
        let subscriptions = self
            .repository
            .fetch_subscriptions(&node.host, &node.name)
            .await?;
        let mut targets = Vec::new();
        let subscribed = subscriptions
            .iter()
            .filter(|s| s.state == SubscriptionState::Subscribed);
        for subscription in subscribed {
            targets.extend(self.delivery_targets(node, &subscription.jid).await);
        }
        for contact in self.implicit_subscribers(node).await? {
            let bare = contact.to_bare();
            if subscriptions.iter().any(|s| s.jid.to_bare() == bare) {
                continue;
            }
            targets.extend(self.delivery_targets(node, &contact).await);
        }
        self.send_notifications(ctx, node, targets, event).await;
        Ok(())
    }

    /// Contacts receiving a local owner's presence. With auto-subscribe they
    /// get item notifications of `presence` nodes without subscribing.
    async fn implicit_subscribers(&self, node: &Node) -> Result<Vec<Jid>, XmppError> {
        if !self.features.contains(Feature::AutoSubscribe)
            || node.options.access_model != AccessModel::Presence
        {
            return Ok(Vec::new());
        }
        let owners = self
            .repository
            .fetch_affiliations(&node.host, &node.name)
            .await?;
        let mut contacts: Vec<Jid> = Vec::new();
        for owner in owners.iter().filter(|a| a.affiliation == Affiliation::Owner) {
            let Some(username) = owner.jid.node() else {
                continue;
            };
            if !self.router.hosts().is_local(owner.jid.domain().as_str()) {
                continue;
            }
            for item in self.repository.fetch_roster_items(username.as_str()).await? {
                let contact = Jid::from(item.jid.clone());
                if item.sends_presence() && !contacts.contains(&contact) {
                    contacts.push(contact);
                }
            }
        }
        Ok(contacts)
    }

    async fn create_node(&self, node: Node, owner: BareJid) -> Result<(), XmppError> {
        let affiliation = NodeAffiliation {
            host: node.host.clone(),
            node: node.name.clone(),
            jid: owner.clone(),
            affiliation: Affiliation::Owner,
        };
        let subscription = NodeSubscription {
            host: node.host.clone(),
            node: node.name.clone(),
            id: Uuid::new_v4().to_string(),
            jid: Jid::from(owner),
            state: SubscriptionState::Subscribed,
        };
        in_transaction(self.repository.as_ref(), move |tx| {
            Box::pin(async move {
                if tx.node_exists(&node.host, &node.name).await? {
                    return Err(XmppError::conflict(Some("Node already exists".to_string())));
                }
                tx.upsert_node(&node).await?;
                tx.upsert_affiliation(&affiliation).await?;
                tx.upsert_subscription(&subscription).await?;
                Ok(())
            })
        })
        .await
    }

    async fn create(
        &self,
        host: &str,
        requester: &Jid,
        name: Option<String>,
        config: Option<crate::xep::DataForm>,
    ) -> Result<Option<Element>, XmppError> {
        let instant = name.is_none();
        if instant {
            self.require(Feature::InstantNodes)?;
        }
        let mut options = self.default_options.clone();
        if let Some(form) = config {
            self.require(Feature::CreateAndConfigure)?;
            if form.type_ == FormType::Submit {
                options = form_to_options(&form, &options)?;
            }
        }

        let name = name.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.create_node(Node::new(host, name.clone(), options), requester.to_bare())
            .await?;
        info!(host, node = %name, owner = %requester.to_bare(), "Node created");

        Ok(instant.then(|| {
            pubsub_payload(PUBSUB, Element::builder("create", PUBSUB).attr("node", name).build())
        }))
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
        jid: Jid,
    ) -> Result<Option<Element>, XmppError> {
        if jid.to_bare() != requester.to_bare() {
            return Err(pubsub_error(XmppError::bad_request(None), "invalid-jid"));
        }
        let node = self.node(host, name).await?;
        let affiliation = self.affiliation(host, name, requester).await?;
        if !has_privileges(affiliation, Feature::Subscribe) {
            return Err(XmppError::forbidden(None));
        }
        self.check_access(&node, requester, affiliation).await?;

        let subscription = match self.repository.fetch_subscription(host, name, &jid).await? {
            Some(existing) => existing,
            None => {
                let state = if node.options.access_model == AccessModel::Authorize
                    && affiliation != Affiliation::Owner
                {
                    SubscriptionState::Pending
                } else {
                    SubscriptionState::Subscribed
                };
                let subscription = NodeSubscription {
                    host: host.to_string(),
                    node: name.to_string(),
                    id: Uuid::new_v4().to_string(),
                    jid: jid.clone(),
                    state,
                };
                self.repository.upsert_subscription(&subscription).await?;
                info!(host, node = name, jid = %jid, state = state.as_str(), "Subscribed");
                if node.options.notify_sub {
                    let event = subscription_element(PUBSUB_EVENT, &subscription, true);
                    self.notify_owners(ctx, &node, event).await?;
                }
                subscription
            }
        };

        if subscription.state == SubscriptionState::Subscribed
            && node.options.send_last_published_item != SendLastPublishedItem::Never
        {
            self.send_last_item(ctx, &node, &jid).await?;
        }

        Ok(Some(pubsub_payload(PUBSUB, subscription_element(PUBSUB, &subscription, true))))
    }

    async fn notify_owners(
        &self,
        ctx: &Context,
        node: &Node,
        event: Element,
    ) -> Result<(), XmppError> {
        let owners: Vec<Jid> = self
            .repository
            .fetch_affiliations(&node.host, &node.name)
            .await?
            .into_iter()
            .filter(|a| a.affiliation == Affiliation::Owner)
            .map(|a| Jid::from(a.jid))
            .collect();
        self.send_notifications(ctx, node, owners, event).await;
        Ok(())
    }

    async fn send_last_item(&self, ctx: &Context, node: &Node, to: &Jid) -> Result<(), XmppError> {
        let items = self.live_items(node).await?;
        let Some(last) = items.last() else {
            return Ok(());
        };
        let event = items_element(
            PUBSUB_EVENT,
            &node.name,
            std::slice::from_ref(last),
            node.options.deliver_payloads,
        );
        self.send_notifications(ctx, node, vec![to.clone()], event).await;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
        jid: &Jid,
        subid: Option<&str>,
    ) -> Result<Option<Element>, XmppError> {
        let _node = self.node(host, name).await?;
        let affiliation = self.affiliation(host, name, requester).await?;
        if jid.to_bare() != requester.to_bare() && affiliation != Affiliation::Owner {
            return Err(XmppError::forbidden(None));
        }
        let Some(subscription) = self.repository.fetch_subscription(host, name, jid).await? else {
            return Err(pubsub_error(XmppError::unexpected_request(None), "not-subscribed"));
        };
        if subid.is_some_and(|id| id != subscription.id) {
            return Err(pubsub_error(XmppError::not_acceptable(None), "invalid-subid"));
        }
        self.repository.delete_subscription(host, name, jid).await?;
        info!(host, node = name, jid = %jid, "Unsubscribed");
        Ok(None)
    }

    async fn publish(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
        item_id: Option<String>,
        payload: Option<Element>,
    ) -> Result<Option<Element>, XmppError> {
        let node = match self.repository.fetch_node(host, name).await? {
            Some(node) => node,
            None if self.features.contains(Feature::AutoCreate) => {
                let node = Node::new(host, name, self.default_options.clone());
                self.create_node(node.clone(), requester.to_bare()).await?;
                info!(host, node = name, "Node auto-created on publish");
                node
            }
            None => return Err(XmppError::item_not_found(None)),
        };

        let affiliation = self.affiliation(host, name, requester).await?;
        let allowed = match node.options.publish_model {
            PublishModel::Publishers => has_privileges(affiliation, Feature::Publish),
            PublishModel::Subscribers => {
                has_privileges(affiliation, Feature::Publish)
                    || self
                        .repository
                        .fetch_subscription(host, name, &Jid::from(requester.to_bare()))
                        .await?
                        .is_some_and(|s| s.state == SubscriptionState::Subscribed)
            }
            PublishModel::Open => affiliation != Affiliation::Outcast,
        };
        if !allowed {
            return Err(XmppError::forbidden(None));
        }

        let item = NodeItem {
            host: host.to_string(),
            node: name.to_string(),
            id: item_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            publisher: requester.clone(),
            payload,
            created_at: Utc::now(),
        };
        if node.options.persist_items && self.features.contains(Feature::PersistentItems) {
            self.repository.upsert_item(&item).await?;
            if node.options.max_items > 0 {
                self.repository
                    .delete_oldest_items(host, name, node.options.max_items as usize)
                    .await?;
            }
        }
        debug!(host, node = name, item = %item.id, "Item published");

        if node.options.deliver_notifications {
            let event = items_element(
                PUBSUB_EVENT,
                name,
                std::slice::from_ref(&item),
                node.options.deliver_payloads,
            );
            self.notify_items(ctx, &node, event).await?;
        }
        self.events
            .publish(
                ctx,
                Event::PubSubItemPublished {
                    host: host.to_string(),
                    node: name.to_string(),
                    item_id: item.id.clone(),
                    publisher: requester.clone(),
                },
            )
            .await;

        let publish = Element::builder("publish", PUBSUB)
            .attr("node", name)
            .append(item_element(PUBSUB, &item, false))
            .build();
        Ok(Some(pubsub_payload(PUBSUB, publish)))
    }

    async fn retract(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
        item_ids: &[String],
        notify: bool,
    ) -> Result<Option<Element>, XmppError> {
        let node = self.node(host, name).await?;
        let affiliation = self.affiliation(host, name, requester).await?;

        for id in item_ids {
            let Some(item) = self.repository.fetch_item(host, name, id).await? else {
                return Err(XmppError::item_not_found(None));
            };
            let own_item = item.publisher.to_bare() == requester.to_bare();
            if !own_item && !has_privileges(affiliation, Feature::RetractItems) {
                return Err(XmppError::forbidden(None));
            }
        }
        for id in item_ids {
            self.repository.delete_item(host, name, id).await?;
        }
        debug!(host, node = name, count = item_ids.len(), "Items retracted");

        if notify && node.options.deliver_notifications && node.options.notify_retract {
            let event = item_ids
                .iter()
                .fold(Element::builder("items", PUBSUB_EVENT).attr("node", name), |b, id| {
                    b.append(Element::builder("retract", PUBSUB_EVENT).attr("id", id).build())
                })
                .build();
            self.notify_all(ctx, &node, event).await?;
        }
        Ok(None)
    }

    /// Items not past their expiry, oldest first.
    async fn live_items(&self, node: &Node) -> Result<Vec<NodeItem>, XmppError> {
        let items = self.repository.fetch_items(&node.host, &node.name).await?;
        if node.options.item_expire == 0 {
            return Ok(items);
        }
        // An expiry too large to represent never elapses.
        let Some(ttl) = i64::try_from(node.options.item_expire)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            return Ok(items);
        };
        let now = Utc::now();
        Ok(items
            .into_iter()
            .filter(|i| i.created_at.checked_add_signed(ttl).map_or(true, |at| at > now))
            .collect())
    }

    async fn items(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
        max_items: Option<usize>,
        item_ids: &[String],
    ) -> Result<Option<Element>, XmppError> {
        let node = self.node(host, name).await?;
        let affiliation = self.affiliation(host, name, requester).await?;
        self.check_access(&node, requester, affiliation).await?;
        if node.options.access_model == AccessModel::Authorize
            && !matches!(
                affiliation,
                Affiliation::Owner | Affiliation::Publisher | Affiliation::Member
            )
        {
            let subscribed = self
                .repository
                .fetch_subscription(host, name, &Jid::from(requester.to_bare()))
                .await?
                .is_some_and(|s| s.state == SubscriptionState::Subscribed);
            if !subscribed {
                return Err(pubsub_error(XmppError::not_authorized(None), "not-subscribed"));
            }
        }

        let mut items = self.live_items(&node).await?;
        if !item_ids.is_empty() {
            items.retain(|i| item_ids.contains(&i.id));
        }
        if let Some(max) = max_items {
            let skip = items.len().saturating_sub(max);
            items.drain(..skip);
        }
        Ok(Some(pubsub_payload(PUBSUB, items_element(PUBSUB, name, &items, true))))
    }

    async fn user_subscriptions(
        &self,
        host: &str,
        requester: &Jid,
        node: Option<String>,
    ) -> Result<Option<Element>, XmppError> {
        let subscriptions = self
            .repository
            .fetch_subscriptions_by_jid(host, &Jid::from(requester.to_bare()))
            .await?;
        let list = subscriptions
            .iter()
            .filter(|s| node.as_deref().map_or(true, |n| s.node == n))
            .fold(Element::builder("subscriptions", PUBSUB), |b, s| {
                b.append(subscription_element(PUBSUB, s, true))
            })
            .build();
        Ok(Some(pubsub_payload(PUBSUB, list)))
    }

    async fn user_affiliations(
        &self,
        host: &str,
        requester: &Jid,
        node: Option<String>,
    ) -> Result<Option<Element>, XmppError> {
        let affiliations = self
            .repository
            .fetch_affiliations_by_jid(host, &requester.to_bare())
            .await?;
        let list = affiliations
            .iter()
            .filter(|a| node.as_deref().map_or(true, |n| a.node == n))
            .fold(Element::builder("affiliations", PUBSUB), |b, a| {
                b.append(affiliation_element(PUBSUB, a, false))
            })
            .build();
        Ok(Some(pubsub_payload(PUBSUB, list)))
    }

    async fn configure_get(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
    ) -> Result<Option<Element>, XmppError> {
        let node = self.privileged_node(host, name, requester, Feature::ConfigNode).await?;
        let configure = Element::builder("configure", PUBSUB_OWNER)
            .attr("node", name)
            .append(options_to_form(&node.options, FormType::Form).to_element())
            .build();
        Ok(Some(pubsub_payload(PUBSUB_OWNER, configure)))
    }

    async fn configure_set(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
        form: crate::xep::DataForm,
    ) -> Result<Option<Element>, XmppError> {
        let mut node = self.privileged_node(host, name, requester, Feature::ConfigNode).await?;
        match form.type_ {
            FormType::Cancel => return Ok(None),
            FormType::Submit => {}
            _ => return Err(XmppError::bad_request(Some("Expected a submitted form".to_string()))),
        }

        node.options = form_to_options(&form, &node.options)?;
        self.repository.upsert_node(&node).await?;
        info!(host, node = name, "Node configured");

        if node.options.deliver_notifications && node.options.notify_config {
            let mut configuration =
                Element::builder("configuration", PUBSUB_EVENT).attr("node", name);
            if node.options.deliver_payloads {
                let form = options_to_form(&node.options, FormType::Result);
                configuration = configuration.append(form.to_element());
            }
            self.notify_all(ctx, &node, configuration.build()).await?;
        }
        Ok(None)
    }

    fn default_configuration(&self) -> Result<Option<Element>, XmppError> {
        if !self.features.contains(Feature::ConfigNode) || !self.config_retrieval_enabled {
            return Err(unsupported(Feature::RetrieveDefault));
        }
        let default = Element::builder("default", PUBSUB_OWNER)
            .append(options_to_form(&self.default_options, FormType::Form).to_element())
            .build();
        Ok(Some(pubsub_payload(PUBSUB_OWNER, default)))
    }

    async fn delete(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
    ) -> Result<Option<Element>, XmppError> {
        let node = self.privileged_node(host, name, requester, Feature::DeleteNodes).await?;
        let subscriptions = self.repository.fetch_subscriptions(host, name).await?;

        let (h, n) = (host.to_string(), name.to_string());
        in_transaction(self.repository.as_ref(), move |tx| {
            Box::pin(async move {
                tx.delete_items(&h, &n).await?;
                tx.delete_subscriptions(&h, &n).await?;
                tx.delete_affiliations(&h, &n).await?;
                tx.delete_node(&h, &n).await?;
                Ok(())
            })
        })
        .await?;
        info!(host, node = name, "Node deleted");

        if node.options.deliver_notifications && node.options.notify_delete {
            let event = Element::builder("delete", PUBSUB_EVENT).attr("node", name).build();
            self.notify_subscribers(ctx, &node, &subscriptions, event).await;
        }
        Ok(None)
    }

    async fn purge(
        &self,
        ctx: &Context,
        host: &str,
        requester: &Jid,
        name: &str,
    ) -> Result<Option<Element>, XmppError> {
        let node = self.privileged_node(host, name, requester, Feature::PurgeNodes).await?;
        self.repository.delete_items(host, name).await?;
        info!(host, node = name, "Node purged");

        if node.options.deliver_notifications && node.options.notify_retract {
            let event = Element::builder("purge", PUBSUB_EVENT).attr("node", name).build();
            self.notify_all(ctx, &node, event).await?;
        }
        Ok(None)
    }

    async fn owner_affiliations(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
    ) -> Result<Option<Element>, XmppError> {
        self.privileged_node(host, name, requester, Feature::ModifyAffiliations)
            .await?;
        let list = self
            .repository
            .fetch_affiliations(host, name)
            .await?
            .iter()
            .fold(Element::builder("affiliations", PUBSUB_OWNER).attr("node", name), |b, a| {
                b.append(affiliation_element(PUBSUB_OWNER, a, true))
            })
            .build();
        Ok(Some(pubsub_payload(PUBSUB_OWNER, list)))
    }

    async fn set_affiliations(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
        affiliations: Vec<(BareJid, Affiliation)>,
    ) -> Result<Option<Element>, XmppError> {
        self.privileged_node(host, name, requester, Feature::ModifyAffiliations)
            .await?;
        let requester = requester.to_bare();
        if affiliations.iter().any(|(jid, _)| *jid == requester) {
            return Err(XmppError::not_acceptable(Some(
                "Owners cannot change their own affiliation".to_string(),
            )));
        }
        for (jid, affiliation) in affiliations {
            if affiliation == Affiliation::None {
                self.repository.delete_affiliation(host, name, &jid).await?;
            } else {
                self.repository
                    .upsert_affiliation(&NodeAffiliation {
                        host: host.to_string(),
                        node: name.to_string(),
                        jid,
                        affiliation,
                    })
                    .await?;
            }
        }
        Ok(None)
    }

    async fn owner_subscriptions(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
    ) -> Result<Option<Element>, XmppError> {
        self.privileged_node(host, name, requester, Feature::ManageSubscriptions)
            .await?;
        let list = self
            .repository
            .fetch_subscriptions(host, name)
            .await?
            .iter()
            .fold(Element::builder("subscriptions", PUBSUB_OWNER).attr("node", name), |b, s| {
                b.append(subscription_element(PUBSUB_OWNER, s, false))
            })
            .build();
        Ok(Some(pubsub_payload(PUBSUB_OWNER, list)))
    }

    async fn set_subscriptions(
        &self,
        host: &str,
        requester: &Jid,
        name: &str,
        subscriptions: Vec<(Jid, SubscriptionState)>,
    ) -> Result<Option<Element>, XmppError> {
        self.privileged_node(host, name, requester, Feature::ManageSubscriptions)
            .await?;
        for (jid, state) in subscriptions {
            if state == SubscriptionState::None {
                self.repository.delete_subscription(host, name, &jid).await?;
                continue;
            }
            let id = self
                .repository
                .fetch_subscription(host, name, &jid)
                .await?
                .map(|s| s.id)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            self.repository
                .upsert_subscription(&NodeSubscription {
                    host: host.to_string(),
                    node: name.to_string(),
                    id,
                    jid,
                    state,
                })
                .await?;
        }
        Ok(None)
    }

    /// Deliver last published items to a resource that just became
    /// available, for nodes configured with `on_sub_and_presence`.
    async fn deliver_on_presence(&self, ctx: &Context, jid: &FullJid) -> Result<(), XmppError> {
        let bare = Jid::from(jid.to_bare());
        let to = Jid::from(jid.clone());
        for host in &self.hosts {
            let subscriptions = self.repository.fetch_subscriptions_by_jid(host, &bare).await?;
            let subscribed = subscriptions
                .iter()
                .filter(|s| s.state == SubscriptionState::Subscribed);
            for subscription in subscribed {
                let Some(node) = self.repository.fetch_node(host, &subscription.node).await? else {
                    continue;
                };
                let on_presence = SendLastPublishedItem::OnSubAndPresence;
                if node.options.send_last_published_item == on_presence {
                    self.send_last_item(ctx, &node, &to).await?;
                }
            }
        }
        Ok(())
    }
}

struct PubSubEvents(Weak<PubSubService>);

#[async_trait]
impl EventHandler for PubSubEvents {
    async fn handle(&self, ctx: &Context, event: &Event) -> Result<(), XmppError> {
        let Some(service) = self.0.upgrade() else {
            return Ok(());
        };
        match event {
            Event::PresenceReceived { jid, presence } => {
                if presence.type_ == PresenceType::Unavailable {
                    service.unregister_session(jid);
                } else if service.register_session(jid) {
                    service.deliver_on_presence(ctx, jid).await?;
                }
                Ok(())
            }
            Event::SessionUnbound { jid, .. } => {
                service.unregister_session(jid);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentHub;
    use crate::config::ResourceConflict;
    use crate::hosts::HostRegistry;
    use crate::registry::{C2sSession, Outbound, SessionTable};
    use crate::storage::{InMemoryRepository, PubSubRepository};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xmpp_parsers::iq::IqType;

    const HOST: &str = "pubsub.shakespeare.lit";

    struct Fixture {
        service: Arc<PubSubService>,
        repository: Arc<InMemoryRepository>,
        sessions: Arc<SessionTable>,
        ctx: Context,
    }

    fn fixture(features: PubSubFeatures) -> Fixture {
        let repository = Arc::new(InMemoryRepository::new());
        let sessions = Arc::new(SessionTable::new());
        let router = Arc::new(Router::new(
            Arc::new(HostRegistry::new(["denmark.lit", "shakespeare.lit"])),
            Arc::clone(&sessions),
            Arc::new(ComponentHub::new(Duration::from_secs(1))),
            repository.clone(),
        ));
        let config = PubSubConfig {
            features,
            ..PubSubConfig::default()
        };
        let service = Arc::new(PubSubService::new(
            &config,
            vec![HOST.to_string()],
            repository.clone(),
            router,
            Arc::new(EventBus::new()),
        ));
        Fixture {
            service,
            repository,
            sessions,
            ctx: Context::background(),
        }
    }

    impl Fixture {
        fn bind(&self, jid: &str) -> mpsc::Receiver<Outbound> {
            let (tx, rx) = mpsc::channel(32);
            let session = Arc::new(C2sSession::new(jid.parse().unwrap(), tx, &self.ctx));
            self.sessions.bind(session, ResourceConflict::Replace).unwrap();
            rx
        }

        async fn send(&self, from: &str, set: bool, xml: &str) -> Result<(), XmppError> {
            let payload: Element = xml.parse().unwrap();
            let iq = Iq {
                from: Some(from.parse().unwrap()),
                to: Some(HOST.parse().unwrap()),
                id: "ps".to_string(),
                payload: if set { IqType::Set(payload) } else { IqType::Get(payload) },
            };
            self.service.process_iq(&self.ctx, HOST, &iq).await
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Stanza> {
        let mut out = Vec::new();
        while let Ok(Outbound::Stanza(stanza)) = rx.try_recv() {
            out.push(stanza);
        }
        out
    }

    const CREATE: &str =
        "<pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='princely_musings'/></pubsub>";

    #[tokio::test]
    async fn test_create_is_transactional_and_conflicts() {
        let f = fixture(PubSubFeatures::all());
        let mut hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();

        let owner: BareJid = "hamlet@denmark.lit".parse().unwrap();
        let affiliation = f
            .repository
            .fetch_affiliation(HOST, "princely_musings", &owner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(affiliation.affiliation, Affiliation::Owner);
        let subscription = f
            .repository
            .fetch_subscription(HOST, "princely_musings", &Jid::from(owner))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.state, SubscriptionState::Subscribed);

        match drain(&mut hamlet).as_slice() {
            [Stanza::Iq(result)] => assert!(matches!(result.payload, IqType::Result(None))),
            other => panic!("unexpected {:?}", other),
        }

        let err = f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::Conflict));
    }

    #[tokio::test]
    async fn test_disabled_feature_reports_unsupported() {
        let f = fixture(PubSubFeatures::from(Feature::ConfigNode));
        let err = f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::FeatureNotImplemented));
        let stanza_error = err.to_stanza_error();
        let unsupported = stanza_error.other.expect("application condition");
        assert_eq!(unsupported.attr("feature"), Some("create-nodes"));
    }

    #[tokio::test]
    async fn test_instant_node_returns_generated_name() {
        let f = fixture(PubSubFeatures::all());
        let mut hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub'><create/></pubsub>",
        )
        .await
        .unwrap();
        match drain(&mut hamlet).as_slice() {
            [Stanza::Iq(result)] => match &result.payload {
                IqType::Result(Some(pubsub)) => {
                    let create = pubsub.get_child("create", PUBSUB).unwrap();
                    let name = create.attr("node").unwrap();
                    assert!(f.repository.node_exists(HOST, name).await.unwrap());
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_owner_cannot_delete() {
        let f = fixture(PubSubFeatures::all());
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();
        let err = f
            .send(
                "bernardo@denmark.lit/castle",
                true,
                "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><delete node='princely_musings'/></pubsub>",
            )
            .await
            .unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::Forbidden));
    }

    #[tokio::test]
    async fn test_default_requires_retrieval_toggle() {
        let mut f = fixture(PubSubFeatures::all());
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send(
            "hamlet@denmark.lit/elsinore",
            false,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><default/></pubsub>",
        )
        .await
        .unwrap();

        Arc::get_mut(&mut f.service).unwrap().config_retrieval_enabled = false;
        let err = f
            .send(
                "hamlet@denmark.lit/elsinore",
                false,
                "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><default/></pubsub>",
            )
            .await
            .unwrap_err();
        let unsupported = err.to_stanza_error().other.expect("application condition");
        assert_eq!(unsupported.attr("feature"), Some("retrieve-default"));
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers_and_trims() {
        let f = fixture(PubSubFeatures::all());
        let mut hamlet = f.bind("hamlet@denmark.lit/elsinore");
        let mut bernardo = f.bind("bernardo@denmark.lit/castle");
        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='princely_musings'/>\
             <configure><x xmlns='jabber:x:data' type='submit'>\
             <field var='pubsub#access_model'><value>open</value></field>\
             <field var='pubsub#max_items'><value>1</value></field>\
             <field var='pubsub#send_last_published_item'><value>never</value></field>\
             </x></configure></pubsub>",
        )
        .await
        .unwrap();
        f.send(
            "bernardo@denmark.lit/castle",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub'>\
             <subscribe node='princely_musings' jid='bernardo@denmark.lit'/></pubsub>",
        )
        .await
        .unwrap();
        drain(&mut hamlet);
        drain(&mut bernardo);

        for id in ["one", "two"] {
            f.send(
                "hamlet@denmark.lit/elsinore",
                true,
                &format!(
                    "<pubsub xmlns='http://jabber.org/protocol/pubsub'><publish node='princely_musings'>\
                     <item id='{}'><entry xmlns='http://www.w3.org/2005/Atom'/></item></publish></pubsub>",
                    id
                ),
            )
            .await
            .unwrap();
        }

        let notifications: Vec<_> = drain(&mut bernardo)
            .into_iter()
            .filter_map(|s| match s {
                Stanza::Message(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(notifications.len(), 2);
        let items = notifications[1].payloads[0].get_child("items", PUBSUB_EVENT).unwrap();
        let item = items.get_child("item", PUBSUB_EVENT).unwrap();
        assert_eq!(item.attr("id"), Some("two"));
        assert!(item.children().next().is_some());

        let stored = f.repository.fetch_items(HOST, "princely_musings").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "two");
    }

    #[tokio::test]
    async fn test_presence_access_model_requires_subscription() {
        let f = fixture(PubSubFeatures::all());
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();
        let err = f
            .send(
                "bernardo@denmark.lit/castle",
                true,
                "<pubsub xmlns='http://jabber.org/protocol/pubsub'>\
                 <subscribe node='princely_musings' jid='bernardo@denmark.lit'/></pubsub>",
            )
            .await
            .unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::NotAuthorized));
    }

    const OPEN_NODE: &str =
        "<pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='princely_musings'/>\
         <configure><x xmlns='jabber:x:data' type='submit'>\
         <field var='pubsub#access_model'><value>open</value></field>\
         <field var='pubsub#send_last_published_item'><value>never</value></field>\
         </x></configure></pubsub>";

    const PUBLISH: &str =
        "<pubsub xmlns='http://jabber.org/protocol/pubsub'><publish node='princely_musings'>\
         <item id='one'><entry xmlns='http://www.w3.org/2005/Atom'/></item></publish></pubsub>";

    fn messages(stanzas: Vec<Stanza>) -> usize {
        stanzas.iter().filter(|s| matches!(s, Stanza::Message(_))).count()
    }

    async fn add_contact(f: &Fixture, contact: &str, subscription: crate::roster::Subscription) {
        use crate::storage::RosterRepository;
        let item = crate::roster::RosterItem::new("hamlet", contact.parse().unwrap())
            .with_subscription(subscription);
        f.repository.upsert_roster_item(&item).await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_subscribe_notifies_presence_contacts() {
        use crate::roster::Subscription;
        let f = fixture(PubSubFeatures::all());
        let mut hamlet = f.bind("hamlet@denmark.lit/elsinore");
        let mut bernardo = f.bind("bernardo@denmark.lit/castle");
        let mut horatio = f.bind("horatio@denmark.lit/gate");
        add_contact(&f, "bernardo@denmark.lit", Subscription::From).await;
        add_contact(&f, "horatio@denmark.lit", Subscription::To).await;

        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();
        f.send("hamlet@denmark.lit/elsinore", true, PUBLISH).await.unwrap();

        assert_eq!(messages(drain(&mut bernardo)), 1);
        assert_eq!(messages(drain(&mut horatio)), 0);
        // The owner is subscribed explicitly and notified once.
        assert_eq!(messages(drain(&mut hamlet)), 1);
        let subscriptions = f
            .repository
            .fetch_subscriptions(HOST, "princely_musings")
            .await
            .unwrap();
        assert_eq!(subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn test_without_auto_subscribe_contacts_are_not_notified() {
        use crate::roster::Subscription;
        let f = fixture(PubSubFeatures::all().without(Feature::AutoSubscribe));
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        let mut bernardo = f.bind("bernardo@denmark.lit/castle");
        add_contact(&f, "bernardo@denmark.lit", Subscription::Both).await;

        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();
        f.send("hamlet@denmark.lit/elsinore", true, PUBLISH).await.unwrap();
        assert_eq!(messages(drain(&mut bernardo)), 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_item_expire_keeps_items() {
        let f = fixture(PubSubFeatures::all());
        let mut hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();

        for expire in [9_000_000_000_000_000, u64::MAX] {
            let mut node = f
                .repository
                .fetch_node(HOST, "princely_musings")
                .await
                .unwrap()
                .unwrap();
            node.options.item_expire = expire;
            f.repository.upsert_node(&node).await.unwrap();
            f.send("hamlet@denmark.lit/elsinore", true, PUBLISH).await.unwrap();
            drain(&mut hamlet);

            f.send(
                "hamlet@denmark.lit/elsinore",
                false,
                "<pubsub xmlns='http://jabber.org/protocol/pubsub'><items node='princely_musings'/></pubsub>",
            )
            .await
            .unwrap();
            let result = drain(&mut hamlet)
                .into_iter()
                .find_map(|s| match s {
                    Stanza::Iq(iq) => match iq.payload {
                        IqType::Result(Some(payload)) => Some(payload),
                        _ => None,
                    },
                    _ => None,
                })
                .expect("items result");
            let items = result.get_child("items", PUBSUB).unwrap();
            assert_eq!(items.children().count(), 1);
        }

        let err = f
            .send(
                "hamlet@denmark.lit/elsinore",
                true,
                "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><configure node='princely_musings'>\
                 <x xmlns='jabber:x:data' type='submit'>\
                 <field var='pubsub#item_expire'><value>10000000000000000</value></field>\
                 </x></configure></pubsub>",
            )
            .await
            .unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::NotAcceptable));
    }

    #[tokio::test]
    async fn test_deliver_notifications_off_silences_purge_and_delete() {
        let f = fixture(PubSubFeatures::all());
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        let mut bernardo = f.bind("bernardo@denmark.lit/castle");
        f.send("hamlet@denmark.lit/elsinore", true, OPEN_NODE).await.unwrap();
        f.send(
            "bernardo@denmark.lit/castle",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub'>\
             <subscribe node='princely_musings' jid='bernardo@denmark.lit'/></pubsub>",
        )
        .await
        .unwrap();
        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><configure node='princely_musings'>\
             <x xmlns='jabber:x:data' type='submit'>\
             <field var='pubsub#deliver_notifications'><value>0</value></field>\
             </x></configure></pubsub>",
        )
        .await
        .unwrap();
        drain(&mut bernardo);

        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><purge node='princely_musings'/></pubsub>",
        )
        .await
        .unwrap();
        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><delete node='princely_musings'/></pubsub>",
        )
        .await
        .unwrap();
        assert_eq!(messages(drain(&mut bernardo)), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_dependent_rows() {
        let f = fixture(PubSubFeatures::all());
        let _hamlet = f.bind("hamlet@denmark.lit/elsinore");
        f.send("hamlet@denmark.lit/elsinore", true, CREATE).await.unwrap();
        f.send("hamlet@denmark.lit/elsinore", true, PUBLISH).await.unwrap();
        f.send(
            "hamlet@denmark.lit/elsinore",
            true,
            "<pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><delete node='princely_musings'/></pubsub>",
        )
        .await
        .unwrap();

        let owner: BareJid = "hamlet@denmark.lit".parse().unwrap();
        let repo = &f.repository;
        assert!(repo.fetch_nodes(HOST).await.unwrap().is_empty());
        assert!(repo.fetch_affiliations(HOST, "princely_musings").await.unwrap().is_empty());
        assert!(repo.fetch_subscriptions(HOST, "princely_musings").await.unwrap().is_empty());
        assert!(repo.fetch_items(HOST, "princely_musings").await.unwrap().is_empty());
        assert!(repo.fetch_affiliations_by_jid(HOST, &owner).await.unwrap().is_empty());
        let subscriber = Jid::from(owner);
        assert!(repo.fetch_subscriptions_by_jid(HOST, &subscriber).await.unwrap().is_empty());
    }

    #[test]
    fn test_unregister_removes_account_entry() {
        let f = fixture(PubSubFeatures::all());
        let balcony: FullJid = "ortuman@jackal.im/balcony".parse().unwrap();
        let yard: FullJid = "ortuman@jackal.im/yard".parse().unwrap();
        assert!(f.service.register_session(&balcony));
        assert!(!f.service.register_session(&balcony));
        f.service.register_session(&yard);

        f.service.unregister_session(&balcony);
        assert_eq!(f.service.active_sessions(&balcony.to_bare()), vec![yard.clone()]);
        f.service.unregister_session(&yard);
        assert!(f.service.active.is_empty());
    }
}
