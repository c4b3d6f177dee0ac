//! Roster IQ handling and presence subscription flows.
//!
//! Every mutation of a user's roster runs in that user's slot of the owner
//! queue. A flow touching two local users runs the initiating side first
//! and the peer side afterwards, as two separate queue operations; the
//! transitions in [`crate::presence::subscription`] are idempotent, so no
//! cross-user atomicity is needed.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, info, instrument};
use uuid::Uuid;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use super::{
    build_roster_push, build_roster_result, format_version, parse_roster_get, parse_roster_set,
    parse_version, RosterItem, Subscription,
};
use crate::config::CoreConfig;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::modules::Module;
use crate::presence::subscription::{self as sm, SubscribeDisposition, Transition};
use crate::presence::{
    build_probe, build_unavailable_presence, is_available, parse_presence, PresenceAction,
    SubscriptionType,
};
use crate::queue::OwnerQueue;
use crate::registry::{C2sSession, INITIAL_PRESENCE_SENT, ROSTER_REQUESTED};
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::storage::{Repository, RosterNotification};
use crate::{ns, Context, Stanza, XmppError};

/// Roster versioning stream feature advertised when versioning is enabled.
const ROSTER_VERSIONING_FEATURE: &str = "urn:xmpp:features:rosterver";

pub struct RosterModule {
    versioning: bool,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    queue: OwnerQueue,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for RosterModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterModule")
            .field("versioning", &self.versioning)
            .field("queue", &self.queue)
            .finish()
    }
}

impl RosterModule {
    pub fn new(
        config: &CoreConfig,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            versioning: config.roster.versioning,
            repository,
            router,
            events,
            queue: OwnerQueue::new("roster", &config.queue),
            subscription: Mutex::new(None),
        }
    }

    /// Handle a presence sent by `session` that is not plainly routable:
    /// subscription control, probes and roster broadcasts.
    ///
    /// Directed presences are routed unchanged.
    #[instrument(skip(self, ctx, session, presence), fields(jid = %session.jid(), type_ = ?presence.type_))]
    pub async fn process_presence(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let user = session.bare_jid();
        match parse_presence(&presence)? {
            PresenceAction::Subscription { kind, to } => match kind {
                SubscriptionType::Subscribe => self.subscribe(ctx, &user, &to, presence).await,
                SubscriptionType::Subscribed => self.subscribed(ctx, &user, &to, presence).await,
                SubscriptionType::Unsubscribe => {
                    self.unsubscribe(ctx, &user, &to, presence).await
                }
                SubscriptionType::Unsubscribed => {
                    self.unsubscribed(ctx, &user, &to, presence).await
                }
            },
            PresenceAction::Probe { to } => self.probe(ctx, session.address(), &user, &to).await,
            PresenceAction::Broadcast => self.broadcast(ctx, session, presence).await,
            PresenceAction::Directed => self.router.route(ctx, Stanza::Presence(presence)).await,
        }
    }

    /// Username of `jid` when it addresses a local account.
    fn local_username(&self, jid: &BareJid) -> Option<String> {
        let node = jid.node()?;
        self.router
            .hosts()
            .is_local(jid.domain().as_str())
            .then(|| node.to_string())
    }

    fn owner(jid: &BareJid) -> Result<String, XmppError> {
        jid.node()
            .map(|n| n.to_string())
            .ok_or_else(|| XmppError::bad_request(Some("Roster owner must be an account".into())))
    }

    /// Persist the item carried by `transition` and push it to the owner's
    /// interested resources. Returns whether the event goes on.
    async fn apply(
        &self,
        ctx: &Context,
        owner: &BareJid,
        transition: Transition,
    ) -> Result<bool, XmppError> {
        if let Some(mut item) = transition.updated {
            item.version = self.repository.upsert_roster_item(&item).await?;
            debug!(
                owner = %owner,
                jid = %item.jid,
                subscription = %item.subscription,
                ask = item.ask,
                "Roster item updated"
            );
            self.push_item(ctx, owner, &item).await;
        }
        Ok(transition.forward)
    }

    /// Send a roster push for `item` to every resource of `owner` that
    /// requested the roster.
    async fn push_item(&self, ctx: &Context, owner: &BareJid, item: &RosterItem) {
        let ver = self.versioning.then(|| format_version(item.version));
        for session in self.router.sessions().sessions_for(owner) {
            if !session.has_flag(ROSTER_REQUESTED) {
                continue;
            }
            let push = build_roster_push(
                &Uuid::new_v4().to_string(),
                session.jid(),
                item,
                ver.as_deref(),
            );
            self.router.must_route(ctx, Stanza::Iq(push)).await;
        }
    }

    fn readdress(presence: &Presence, from: &BareJid, to: &BareJid) -> Presence {
        let mut p = presence.clone();
        p.from = Some(Jid::from(from.clone()));
        p.to = Some(Jid::from(to.clone()));
        p
    }

    /// Route the available presences of `from`'s resources to `to`.
    async fn route_online_presences(&self, ctx: &Context, from: &BareJid, to: Jid) {
        for mut presence in self
            .router
            .sessions()
            .online_presences_matching(&Jid::from(from.clone()))
        {
            presence.to = Some(to.clone());
            self.router.must_route(ctx, Stanza::Presence(presence)).await;
        }
    }

    /// Route an unavailable presence from each resource of `from` to `to`.
    async fn route_unavailable_presences(&self, ctx: &Context, from: &BareJid, to: &BareJid) {
        for session in self.router.sessions().sessions_for(from) {
            if !session.is_available() {
                continue;
            }
            let presence = build_unavailable_presence(session.address(), Jid::from(to.clone()));
            self.router.must_route(ctx, Stanza::Presence(presence)).await;
        }
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        user: &BareJid,
        contact: &BareJid,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let username = Self::owner(user)?;
        let forward = self
            .queue
            .run(ctx, &username, async {
                let current = self.repository.fetch_roster_item(&username, contact).await?;
                let transition = sm::user_sends_subscribe(&username, contact, current.as_ref());
                self.apply(ctx, user, transition).await
            })
            .await?;
        if !forward {
            return Ok(());
        }

        let outbound = Self::readdress(&presence, user, contact);
        let Some(contact_name) = self.local_username(contact) else {
            return self.router.route(ctx, Stanza::Presence(outbound)).await;
        };

        let disposition = self
            .queue
            .run(ctx, &contact_name, async {
                let current = self
                    .repository
                    .fetch_roster_item(&contact_name, user)
                    .await?;
                let disposition = sm::contact_receives_subscribe(current.as_ref());
                if disposition == SubscribeDisposition::Notify {
                    let notification = RosterNotification {
                        contact: contact_name.clone(),
                        jid: user.clone(),
                        presence: outbound.clone(),
                    };
                    self.repository
                        .upsert_roster_notification(&notification)
                        .await?;
                }
                Ok(disposition)
            })
            .await?;

        match disposition {
            SubscribeDisposition::Notify => {
                self.router
                    .must_route(ctx, Stanza::Presence(outbound))
                    .await;
                Ok(())
            }
            SubscribeDisposition::AutoApprove => {
                debug!(contact = %contact, "Subscription pre-approved");
                let approval = Self::readdress(&Presence::new(PresenceType::Subscribed), contact, user);
                self.receive_subscribed(ctx, contact, user, approval).await
            }
        }
    }

    async fn subscribed(
        &self,
        ctx: &Context,
        contact: &BareJid,
        user: &BareJid,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let contact_name = Self::owner(contact)?;
        let user_name = self.local_username(user);
        let forward = self
            .queue
            .run(ctx, &contact_name, async {
                let notification = self
                    .repository
                    .fetch_roster_notification(&contact_name, user)
                    .await?;
                let asked = match &user_name {
                    Some(name) => self
                        .repository
                        .fetch_roster_item(name, contact)
                        .await?
                        .map(|item| item.ask)
                        .unwrap_or(false),
                    None => false,
                };
                let current = self
                    .repository
                    .fetch_roster_item(&contact_name, user)
                    .await?;
                let transition = sm::contact_sends_subscribed(
                    &contact_name,
                    user,
                    current.as_ref(),
                    notification.is_some() || asked,
                );
                if notification.is_some() {
                    self.repository
                        .delete_roster_notification(&contact_name, user)
                        .await?;
                }
                self.apply(ctx, contact, transition).await
            })
            .await?;
        if !forward {
            return Ok(());
        }

        let outbound = Self::readdress(&presence, contact, user);
        match user_name {
            Some(_) => self.receive_subscribed(ctx, contact, user, outbound).await,
            None => self.router.route(ctx, Stanza::Presence(outbound)).await,
        }
    }

    /// `user` receives `subscribed` from `contact`.
    async fn receive_subscribed(
        &self,
        ctx: &Context,
        contact: &BareJid,
        user: &BareJid,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let username = Self::owner(user)?;
        let forward = self
            .queue
            .run(ctx, &username, async {
                let current = self.repository.fetch_roster_item(&username, contact).await?;
                self.apply(ctx, user, sm::user_receives_subscribed(current.as_ref()))
                    .await
            })
            .await?;
        if !forward {
            return Ok(());
        }
        self.router
            .must_route(ctx, Stanza::Presence(presence))
            .await;
        self.route_online_presences(ctx, contact, Jid::from(user.clone()))
            .await;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        ctx: &Context,
        user: &BareJid,
        contact: &BareJid,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let username = Self::owner(user)?;
        let was_receiving = self
            .queue
            .run(ctx, &username, async {
                let current = self.repository.fetch_roster_item(&username, contact).await?;
                let was_receiving = current.as_ref().is_some_and(RosterItem::receives_presence);
                self.apply(ctx, user, sm::user_sends_unsubscribe(current.as_ref()))
                    .await?;
                Ok(was_receiving)
            })
            .await?;

        let outbound = Self::readdress(&presence, user, contact);
        let Some(contact_name) = self.local_username(contact) else {
            return self.router.route(ctx, Stanza::Presence(outbound)).await;
        };
        self.queue
            .run(ctx, &contact_name, async {
                let current = self
                    .repository
                    .fetch_roster_item(&contact_name, user)
                    .await?;
                self.apply(ctx, contact, sm::contact_receives_unsubscribe(current.as_ref()))
                    .await
            })
            .await?;
        self.router
            .must_route(ctx, Stanza::Presence(outbound))
            .await;
        if was_receiving {
            self.route_unavailable_presences(ctx, contact, user).await;
        }
        Ok(())
    }

    async fn unsubscribed(
        &self,
        ctx: &Context,
        contact: &BareJid,
        user: &BareJid,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let contact_name = Self::owner(contact)?;
        let was_sending = self
            .queue
            .run(ctx, &contact_name, async {
                self.repository
                    .delete_roster_notification(&contact_name, user)
                    .await?;
                let current = self
                    .repository
                    .fetch_roster_item(&contact_name, user)
                    .await?;
                let was_sending = current.as_ref().is_some_and(RosterItem::sends_presence);
                self.apply(ctx, contact, sm::contact_sends_unsubscribed(current.as_ref()))
                    .await?;
                Ok(was_sending)
            })
            .await?;

        let outbound = Self::readdress(&presence, contact, user);
        let Some(username) = self.local_username(user) else {
            return self.router.route(ctx, Stanza::Presence(outbound)).await;
        };
        self.queue
            .run(ctx, &username, async {
                let current = self.repository.fetch_roster_item(&username, contact).await?;
                self.apply(ctx, user, sm::user_receives_unsubscribed(current.as_ref()))
                    .await
            })
            .await?;
        self.router
            .must_route(ctx, Stanza::Presence(outbound))
            .await;
        if was_sending {
            self.route_unavailable_presences(ctx, contact, user).await;
        }
        Ok(())
    }

    /// Answer a probe from `prober` about `target`.
    async fn probe(
        &self,
        ctx: &Context,
        prober: Jid,
        prober_bare: &BareJid,
        target: &BareJid,
    ) -> Result<(), XmppError> {
        let Some(target_name) = self.local_username(target) else {
            let probe = build_probe(prober_bare, target);
            return self.router.route(ctx, Stanza::Presence(probe)).await;
        };

        let item = self
            .repository
            .fetch_roster_item(&target_name, prober_bare)
            .await?;
        if !item.as_ref().is_some_and(RosterItem::sends_presence) {
            debug!(target = %target, "Probe from unsubscribed entity");
            let mut reply = Presence::new(PresenceType::Unsubscribed);
            reply.from = Some(Jid::from(target.clone()));
            reply.to = Some(prober);
            return self.router.route(ctx, Stanza::Presence(reply)).await;
        }

        let online = self
            .router
            .sessions()
            .online_presences_matching(&Jid::from(target.clone()));
        if !online.is_empty() {
            for mut presence in online {
                presence.to = Some(prober.clone());
                self.router.must_route(ctx, Stanza::Presence(presence)).await;
            }
            return Ok(());
        }

        let last = self
            .repository
            .fetch_user(&target_name)
            .await?
            .and_then(|user| user.last_presence);
        let mut reply = last.unwrap_or_else(|| Presence::new(PresenceType::Unavailable));
        reply.from = Some(Jid::from(target.clone()));
        reply.to = Some(prober);
        self.router.route(ctx, Stanza::Presence(reply)).await
    }

    /// Broadcast an available/unavailable presence of `session` to its
    /// subscribers and the user's other resources.
    async fn broadcast(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        mut presence: Presence,
    ) -> Result<(), XmppError> {
        let user = session.bare_jid();
        let username = Self::owner(&user)?;
        presence.from = Some(session.address());
        presence.to = None;

        self.queue
            .run(ctx, &username, async {
                self.router
                    .sessions()
                    .set_presence(session, presence.clone());
                if let Some(mut record) = self.repository.fetch_user(&username).await? {
                    record.last_presence = Some(presence.clone());
                    self.repository.upsert_user(&record).await?;
                }

                let items = self.repository.fetch_roster_items(&username).await?;
                for item in items.iter().filter(|item| item.sends_presence()) {
                    let mut outbound = presence.clone();
                    outbound.to = Some(Jid::from(item.jid.clone()));
                    self.router.must_route(ctx, Stanza::Presence(outbound)).await;
                }
                for other in self.router.sessions().sessions_for(&user) {
                    if other.id() == session.id() {
                        continue;
                    }
                    let mut outbound = presence.clone();
                    outbound.to = Some(other.address());
                    self.router.must_route(ctx, Stanza::Presence(outbound)).await;
                }

                if is_available(&presence) && !session.test_and_set_flag(INITIAL_PRESENCE_SENT) {
                    self.deliver_initial_presences(ctx, session, &items).await?;
                }
                Ok(())
            })
            .await?;

        self.events
            .publish(
                ctx,
                Event::PresenceReceived {
                    jid: session.jid().clone(),
                    presence,
                },
            )
            .await;
        Ok(())
    }

    /// Pending subscription requests first, then the presences of every
    /// contact the user is subscribed to.
    async fn deliver_initial_presences(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        items: &[RosterItem],
    ) -> Result<(), XmppError> {
        let notifications = self
            .repository
            .fetch_roster_notifications(session.username())
            .await?;
        for notification in notifications {
            session.send(Stanza::Presence(notification.presence))?;
        }

        let user = session.bare_jid();
        for item in items.iter().filter(|item| item.receives_presence()) {
            if self.local_username(&item.jid).is_some() {
                self.route_online_presences(ctx, &item.jid, session.address())
                    .await;
            } else {
                let probe = build_probe(&user, &item.jid);
                self.router.must_route(ctx, Stanza::Presence(probe)).await;
            }
        }
        Ok(())
    }

    async fn handle_get(&self, ctx: &Context, iq: &Iq, from: &FullJid) -> Result<(), XmppError> {
        let get = parse_roster_get(iq)?;
        let username = Self::owner(&from.to_bare())?;

        self.queue
            .run(ctx, &username, async {
                let items = self.repository.fetch_roster_items(&username).await?;
                let version = self.repository.fetch_roster_version(&username).await?;
                if let Some(session) = self.router.sessions().session(from) {
                    session.set_flag(ROSTER_REQUESTED);
                }

                let client_ver = get
                    .ver
                    .as_deref()
                    .and_then(parse_version)
                    .filter(|_| self.versioning);
                match client_ver {
                    Some(ver) if ver >= version.deletion_version && ver <= version.version => {
                        debug!(ver, current = version.version, "Sending incremental roster");
                        self.router
                            .route(ctx, Stanza::Iq(iq_result(iq, None)))
                            .await?;
                        let mut newer: Vec<RosterItem> =
                            items.into_iter().filter(|item| item.version > ver).collect();
                        newer.sort_by_key(|item| item.version);
                        for item in newer {
                            let push = build_roster_push(
                                &Uuid::new_v4().to_string(),
                                from,
                                &item,
                                Some(&format_version(item.version)),
                            );
                            self.router.must_route(ctx, Stanza::Iq(push)).await;
                        }
                        Ok(())
                    }
                    _ => {
                        let ver = self.versioning.then(|| format_version(version.version));
                        let result = build_roster_result(iq, &items, ver.as_deref());
                        self.router.route(ctx, Stanza::Iq(result)).await
                    }
                }
            })
            .await
    }

    async fn handle_set(&self, ctx: &Context, iq: &Iq, from: &FullJid) -> Result<(), XmppError> {
        let user = from.to_bare();
        let username = Self::owner(&user)?;
        let requested = parse_roster_set(&username, iq)?;
        let contact = requested.jid.clone();

        let removed = self
            .queue
            .run(ctx, &username, async {
                let current = self.repository.fetch_roster_item(&username, &contact).await?;
                if requested.subscription.is_remove() {
                    let Some(existing) = current else {
                        return Err(XmppError::item_not_found(Some(format!(
                            "No roster item for {}",
                            contact
                        ))));
                    };
                    let version = self
                        .repository
                        .delete_roster_item(&username, &contact)
                        .await?;
                    self.repository
                        .delete_roster_notification(&username, &contact)
                        .await?;
                    let mut pushed = existing.clone().with_subscription(Subscription::Remove);
                    pushed.ask = false;
                    pushed.version = version;
                    self.push_item(ctx, &user, &pushed).await;
                    self.router
                        .route(ctx, Stanza::Iq(iq_result(iq, None)))
                        .await?;
                    return Ok(Some(existing));
                }

                let mut item = current.unwrap_or_else(|| RosterItem::new(&username, contact.clone()));
                item.name = requested.name.clone();
                item.groups = requested.groups.clone();
                item.version = self.repository.upsert_roster_item(&item).await?;
                self.push_item(ctx, &user, &item).await;
                self.router
                    .route(ctx, Stanza::Iq(iq_result(iq, None)))
                    .await?;
                Ok(None)
            })
            .await?;

        // Removing a contact cancels the subscriptions in both directions.
        if let Some(existing) = removed {
            info!(username = %username, contact = %contact, "Roster item removed");
            if existing.receives_presence() || existing.ask {
                let p = Presence::new(PresenceType::Unsubscribe);
                self.unsubscribe(ctx, &user, &contact, p).await?;
            }
            if existing.sends_presence() {
                let p = Presence::new(PresenceType::Unsubscribed);
                self.unsubscribed(ctx, &user, &contact, p).await?;
                self.route_unavailable_presences(ctx, &user, &contact).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Module for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn server_features(&self) -> Vec<String> {
        let mut features = vec![ns::ROSTER.to_string()];
        if self.versioning {
            features.push(ROSTER_VERSIONING_FEATURE.to_string());
        }
        features
    }

    fn matches_namespace(&self, ns: &str, _server_target: bool) -> bool {
        ns == ns::ROSTER
    }

    async fn process_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        let from = iq
            .from
            .clone()
            .and_then(|jid| jid.try_into_full().ok())
            .ok_or_else(|| XmppError::bad_request(Some("Roster request without resource".into())))?;
        if let Some(to) = &iq.to {
            if to.node().is_some() && to.to_bare() != from.to_bare() {
                return Err(XmppError::forbidden(Some(
                    "Cannot access another user's roster".to_string(),
                )));
            }
        }

        match &iq.payload {
            IqType::Get(_) => self.handle_get(ctx, iq, &from).await,
            IqType::Set(_) => self.handle_set(ctx, iq, &from).await,
            _ => Ok(()),
        }
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        let id = self.events.subscribe(
            EventKind::UserDeleted,
            Arc::new(RosterCleanup {
                repository: Arc::clone(&self.repository),
            }),
        );
        if let Ok(mut slot) = self.subscription.lock() {
            *slot = Some(id);
        }
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), XmppError> {
        let id = self.subscription.lock().ok().and_then(|mut slot| slot.take());
        if let Some(id) = id {
            self.events.unsubscribe(id);
        }
        Ok(())
    }
}

/// Drops the roster of deleted users.
struct RosterCleanup {
    repository: Arc<dyn Repository>,
}

#[async_trait]
impl EventHandler for RosterCleanup {
    async fn handle(&self, _ctx: &Context, event: &Event) -> Result<(), XmppError> {
        let Event::UserDeleted { username } = event else {
            return Ok(());
        };
        for item in self.repository.fetch_roster_items(username).await? {
            self.repository
                .delete_roster_item(username, &item.jid)
                .await?;
        }
        for notification in self.repository.fetch_roster_notifications(username).await? {
            self.repository
                .delete_roster_notification(username, &notification.jid)
                .await?;
        }
        debug!(username = %username, "Roster deleted");
        Ok(())
    }
}
