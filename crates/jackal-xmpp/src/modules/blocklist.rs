//! XEP-0191 blocking command.
//!
//! Blocking an address hides the blocker's contacts behind it: each online
//! resource matching the address that shares presence with the owner is
//! announced as unavailable before the block takes effect. Unblocking sends
//! the resources' current presence again. After every mutation the router's
//! cached list is reloaded so delivery enforces the new list immediately.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, info};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::presence::Presence;

use super::Module;
use crate::config::CoreConfig;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::presence::build_unavailable_presence;
use crate::queue::OwnerQueue;
use crate::registry::{C2sSession, BLOCKLIST_REQUESTED};
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::storage::{BlockListItem, Repository};
use crate::xep::xep0191::{
    build_block_push, build_blocklist_response, build_unblock_push, parse_blocking_request,
    BlockingRequest,
};
use crate::{ns, Context, Stanza, XmppError};

pub struct BlockListModule {
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    queue: OwnerQueue,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl std::fmt::Debug for BlockListModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockListModule")
            .field("queue", &self.queue)
            .finish()
    }
}

impl BlockListModule {
    pub fn new(
        config: &CoreConfig,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            repository,
            router,
            events,
            queue: OwnerQueue::new("blocklist", &config.queue),
            subscription: Mutex::new(None),
        }
    }

    async fn get_blocklist(&self, iq: &Iq, from: &FullJid, username: &str) -> Result<Iq, XmppError> {
        let items = self.repository.fetch_blocklist_items(username).await?;
        if let Some(session) = self.router.sessions().session(from) {
            session.set_flag(BLOCKLIST_REQUESTED);
        }
        let jids: Vec<Jid> = items.into_iter().map(|item| item.jid).collect();
        Ok(build_blocklist_response(iq, &jids))
    }

    /// Online resources matching `pattern` whose owner shares presence with
    /// `owner`.
    async fn presence_sharing_sessions(
        &self,
        owner: &BareJid,
        pattern: &Jid,
    ) -> Result<Vec<Arc<C2sSession>>, XmppError> {
        let mut sessions = Vec::new();
        for session in self.router.sessions().streams_matching(pattern) {
            if !session.is_available() || session.bare_jid() == *owner {
                continue;
            }
            let item = self
                .repository
                .fetch_roster_item(session.username(), owner)
                .await?;
            if item.is_some_and(|item| item.sends_presence()) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn block(
        &self,
        ctx: &Context,
        iq: &Iq,
        owner: &BareJid,
        username: &str,
        jids: Vec<Jid>,
    ) -> Result<(), XmppError> {
        self.queue
            .run(ctx, username, async {
                let existing: Vec<Jid> = self
                    .repository
                    .fetch_blocklist_items(username)
                    .await?
                    .into_iter()
                    .map(|item| item.jid)
                    .collect();
                let added: Vec<Jid> = jids
                    .iter()
                    .filter(|jid| !existing.contains(jid))
                    .cloned()
                    .collect();

                // Must go out before the router starts dropping traffic from
                // the blocked resources.
                for jid in &added {
                    for session in self.presence_sharing_sessions(owner, jid).await? {
                        let presence =
                            build_unavailable_presence(session.address(), Jid::from(owner.clone()));
                        self.router.must_route(ctx, Stanza::Presence(presence)).await;
                    }
                }

                let items: Vec<BlockListItem> = added
                    .iter()
                    .map(|jid| BlockListItem {
                        username: username.to_string(),
                        jid: jid.clone(),
                    })
                    .collect();
                self.repository.insert_blocklist_items(&items).await?;
                self.router.reload_blocklist(username).await?;

                self.router
                    .route(ctx, Stanza::Iq(iq_result(iq, None)))
                    .await?;
                self.push(ctx, owner, |to| build_block_push(to, &jids)).await;
                info!(owner = %owner, added = added.len(), "Addresses blocked");
                Ok(())
            })
            .await?;

        self.events
            .publish(ctx, Event::BlockListUpdated { jid: owner.clone() })
            .await;
        Ok(())
    }

    async fn unblock(
        &self,
        ctx: &Context,
        iq: &Iq,
        owner: &BareJid,
        username: &str,
        jids: Vec<Jid>,
    ) -> Result<(), XmppError> {
        self.queue
            .run(ctx, username, async {
                let existing = self.repository.fetch_blocklist_items(username).await?;
                let removed: Vec<BlockListItem> = existing
                    .into_iter()
                    .filter(|item| jids.is_empty() || jids.contains(&item.jid))
                    .collect();

                self.repository.delete_blocklist_items(&removed).await?;
                self.router.reload_blocklist(username).await?;

                for item in &removed {
                    for session in self.presence_sharing_sessions(owner, &item.jid).await? {
                        let Some(mut presence): Option<Presence> = session.presence() else {
                            continue;
                        };
                        presence.from = Some(session.address());
                        presence.to = Some(Jid::from(owner.clone()));
                        self.router.must_route(ctx, Stanza::Presence(presence)).await;
                    }
                }

                self.router
                    .route(ctx, Stanza::Iq(iq_result(iq, None)))
                    .await?;
                self.push(ctx, owner, |to| build_unblock_push(to, &jids)).await;
                info!(owner = %owner, removed = removed.len(), "Addresses unblocked");
                Ok(())
            })
            .await?;

        self.events
            .publish(ctx, Event::BlockListUpdated { jid: owner.clone() })
            .await;
        Ok(())
    }

    /// Push a blocking change to every resource that read the blocklist.
    async fn push<F>(&self, ctx: &Context, owner: &BareJid, build: F)
    where
        F: Fn(&Jid) -> Iq,
    {
        for session in self.router.sessions().sessions_for(owner) {
            if session.has_flag(BLOCKLIST_REQUESTED) {
                let push = build(&session.address());
                self.router.must_route(ctx, Stanza::Iq(push)).await;
            }
        }
    }
}

#[async_trait]
impl Module for BlockListModule {
    fn name(&self) -> &'static str {
        "blocklist"
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::BLOCKING.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::BLOCKING.to_string()]
    }

    fn matches_namespace(&self, ns: &str, _server_target: bool) -> bool {
        ns == ns::BLOCKING
    }

    async fn process_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        let from = iq
            .from
            .clone()
            .and_then(|jid| jid.try_into_full().ok())
            .ok_or_else(|| XmppError::bad_request(Some("Blocking request without resource".into())))?;
        let owner = from.to_bare();
        if let Some(to) = &iq.to {
            if to.node().is_some() && to.to_bare() != owner {
                return Err(XmppError::forbidden(None));
            }
        }
        let username = from
            .node()
            .map(|n| n.to_string())
            .ok_or_else(|| XmppError::bad_request(None))?;

        match parse_blocking_request(iq)? {
            BlockingRequest::GetBlocklist => {
                let reply = self.get_blocklist(iq, &from, &username).await?;
                self.router.route(ctx, Stanza::Iq(reply)).await
            }
            BlockingRequest::Block(jids) => self.block(ctx, iq, &owner, &username, jids).await,
            BlockingRequest::Unblock(jids) => {
                self.unblock(ctx, iq, &owner, &username, jids).await
            }
        }
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        let id = self.events.subscribe(
            EventKind::UserDeleted,
            Arc::new(BlockListCleanup {
                repository: Arc::clone(&self.repository),
                router: Arc::clone(&self.router),
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

struct BlockListCleanup {
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
}

#[async_trait]
impl EventHandler for BlockListCleanup {
    async fn handle(&self, _ctx: &Context, event: &Event) -> Result<(), XmppError> {
        let Event::UserDeleted { username } = event else {
            return Ok(());
        };
        let items = self.repository.fetch_blocklist_items(username).await?;
        self.repository.delete_blocklist_items(&items).await?;
        self.router.reload_blocklist(username).await?;
        debug!(username = %username, "Block list deleted");
        Ok(())
    }
}
