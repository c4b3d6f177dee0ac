//! Stanza routing.
//!
//! This module provides the [`Router`] which delivers every stanza to its
//! destination: a registered component, the module layer (IQs addressed to
//! the server or to an account), or the sessions bound for a local address.
//!
//! # Routing Logic
//!
//! For each stanza, the router:
//! 1. Drops it if either endpoint is on the other side's block list
//! 2. Hands it to the component registered for the destination domain
//! 3. For local domains, dispatches server/account IQs to the modules and
//!    delivers everything else to the matching sessions
//! 4. Rejects remote domains with `remote-server-not-found`

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use jid::Jid;
use tracing::{debug, instrument, warn};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::Message;

use crate::address::matches_pattern;
use crate::components::ComponentHub;
use crate::hosts::HostRegistry;
use crate::registry::SessionTable;
use crate::stanza::{is_request, iq_error};
use crate::storage::Repository;
use crate::{Context, Stanza, XmppError};

/// Receives IQs addressed to the server or to a local account.
#[async_trait]
pub trait IqDispatcher: Send + Sync {
    /// Returns `false` when nothing handled the IQ.
    async fn dispatch_iq(&self, ctx: &Context, iq: Iq, server_target: bool)
        -> Result<bool, XmppError>;
}

/// Stores messages for recipients without a bound session.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn store(&self, ctx: &Context, message: Message) -> Result<(), XmppError>;
}

pub struct Router {
    hosts: Arc<HostRegistry>,
    sessions: Arc<SessionTable>,
    components: Arc<ComponentHub>,
    repository: Arc<dyn Repository>,
    /// Blocked addresses per local username, loaded on first use.
    blocklists: RwLock<HashMap<String, Arc<Vec<Jid>>>>,
    dispatcher: OnceLock<Weak<dyn IqDispatcher>>,
    offline: OnceLock<Weak<dyn OfflineStore>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("hosts", &self.hosts.hosts())
            .field("sessions", &self.sessions.session_count())
            .finish()
    }
}

impl Router {
    pub fn new(
        hosts: Arc<HostRegistry>,
        sessions: Arc<SessionTable>,
        components: Arc<ComponentHub>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            hosts,
            sessions,
            components,
            repository,
            blocklists: RwLock::new(HashMap::new()),
            dispatcher: OnceLock::new(),
            offline: OnceLock::new(),
        }
    }

    /// Attach the module layer. Only the first call has an effect.
    pub fn set_iq_dispatcher(&self, dispatcher: Weak<dyn IqDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Attach the offline storage hook. Only the first call has an effect.
    pub fn set_offline_store(&self, store: Weak<dyn OfflineStore>) {
        let _ = self.offline.set(store);
    }

    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn components(&self) -> &Arc<ComponentHub> {
        &self.components
    }

    /// Deliver `stanza` to its destination.
    pub fn route<'a>(
        &'a self,
        ctx: &'a Context,
        stanza: Stanza,
    ) -> BoxFuture<'a, Result<(), XmppError>> {
        Box::pin(async move { ctx.run(self.route_stanza(ctx, stanza)).await })
    }

    /// Like [`Router::route`], but failures are logged instead of returned.
    pub async fn must_route(&self, ctx: &Context, stanza: Stanza) {
        let name = stanza.name();
        let to = stanza.to().map(|j| j.to_string());
        if let Err(e) = self.route(ctx, stanza).await {
            warn!(stanza = name, to = ?to, error = %e, "Failed to route stanza");
        }
    }

    /// Refresh the cached block list of `username` from the repository.
    pub async fn reload_blocklist(&self, username: &str) -> Result<(), XmppError> {
        let list = self.load_blocklist(username).await?;
        if let Ok(mut blocklists) = self.blocklists.write() {
            blocklists.insert(username.to_string(), list);
        }
        debug!(username, "Block list reloaded");
        Ok(())
    }

    /// Whether `jid` is blocked by local user `username`.
    pub async fn is_blocked(&self, username: &str, jid: &Jid) -> Result<bool, XmppError> {
        let list = self.blocklist(username).await?;
        Ok(list.iter().any(|blocked| matches_pattern(blocked, jid)))
    }

    async fn blocklist(&self, username: &str) -> Result<Arc<Vec<Jid>>, XmppError> {
        let cached = self
            .blocklists
            .read()
            .ok()
            .and_then(|blocklists| blocklists.get(username).cloned());
        if let Some(list) = cached {
            return Ok(list);
        }
        let list = self.load_blocklist(username).await?;
        if let Ok(mut blocklists) = self.blocklists.write() {
            blocklists
                .entry(username.to_string())
                .or_insert_with(|| Arc::clone(&list));
        }
        Ok(list)
    }

    async fn load_blocklist(&self, username: &str) -> Result<Arc<Vec<Jid>>, XmppError> {
        let items = self.repository.fetch_blocklist_items(username).await?;
        Ok(Arc::new(items.into_iter().map(|item| item.jid).collect()))
    }

    /// Username of `jid` if it addresses a local account.
    fn local_username<'j>(&self, jid: &'j Jid) -> Option<&'j str> {
        let node = jid.node()?;
        self.hosts
            .is_local_jid(jid)
            .then_some(node.as_str())
    }

    fn is_server_address(&self, jid: &Jid) -> bool {
        jid.node().is_none() && self.hosts.is_local_jid(jid)
    }

    async fn is_blocked_pair(&self, from: Option<&Jid>, to: &Jid) -> Result<bool, XmppError> {
        let Some(from) = from else {
            return Ok(false);
        };
        // Traffic within one account or with the local server itself is
        // never subject to block lists.
        if from.to_bare() == to.to_bare()
            || self.is_server_address(from)
            || self.is_server_address(to)
        {
            return Ok(false);
        }
        if let Some(recipient) = self.local_username(to) {
            if self.is_blocked(recipient, from).await? {
                return Ok(true);
            }
        }
        if let Some(sender) = self.local_username(from) {
            if self.is_blocked(sender, to).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[instrument(skip(self, ctx, stanza), fields(stanza = stanza.name(), to = ?stanza.to().map(|j| j.to_string())))]
    async fn route_stanza(&self, ctx: &Context, stanza: Stanza) -> Result<(), XmppError> {
        let Some(to) = stanza.to().cloned() else {
            return Err(XmppError::bad_request(Some(
                "Stanza has no destination".to_string(),
            )));
        };

        if self.is_blocked_pair(stanza.from(), &to).await? {
            debug!("Stanza dropped by block list");
            return Ok(());
        }

        let domain = to.domain().as_str();
        if let Some(component) = self.components.component(domain) {
            return component.process(ctx, stanza).await;
        }

        if !self.hosts.is_local(domain) {
            return Err(XmppError::remote_server_not_found(Some(format!(
                "No route to {}",
                domain
            ))));
        }

        match stanza {
            Stanza::Iq(iq) if to.node().is_none() => {
                self.dispatch_or_reject(ctx, iq, true).await
            }
            Stanza::Iq(iq) if to.resource().is_none() && is_request(&iq) => {
                self.dispatch_or_reject(ctx, iq, false).await
            }
            stanza => self.deliver_local(ctx, stanza, &to).await,
        }
    }

    async fn dispatch_or_reject(
        &self,
        ctx: &Context,
        iq: Iq,
        server_target: bool,
    ) -> Result<(), XmppError> {
        let dispatcher = self.dispatcher.get().and_then(Weak::upgrade);
        let handled = match dispatcher {
            Some(dispatcher) => dispatcher.dispatch_iq(ctx, iq.clone(), server_target).await?,
            None => false,
        };
        if handled || !is_request(&iq) {
            return Ok(());
        }
        debug!(id = %iq.id, "No handler for IQ");
        let reply = iq_error(&iq, &XmppError::service_unavailable(None));
        self.route(ctx, Stanza::Iq(reply)).await
    }

    async fn deliver_local(&self, ctx: &Context, stanza: Stanza, to: &Jid) -> Result<(), XmppError> {
        let mut targets = self.sessions.streams_matching(to);

        // A message to an unavailable resource goes to the account instead.
        if targets.is_empty() && to.resource().is_some() {
            if let Stanza::Message(_) = stanza {
                targets = self.sessions.streams_matching(&Jid::from(to.to_bare()));
            }
        }

        if targets.is_empty() {
            return match stanza {
                Stanza::Message(message) => {
                    let store = self.offline.get().and_then(Weak::upgrade);
                    match store {
                        Some(store) => store.store(ctx, message).await,
                        None => Err(XmppError::service_unavailable(None)),
                    }
                }
                Stanza::Iq(iq) if is_request(&iq) => Err(XmppError::service_unavailable(None)),
                _ => {
                    debug!("No session for stanza, dropping");
                    Ok(())
                }
            };
        }

        let mut outcome = Ok(());
        for session in targets {
            if let Err(e) = session.send(stanza.clone()) {
                outcome = Err(e);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConflict;
    use crate::registry::{C2sSession, Outbound};
    use crate::storage::{BlockListItem, BlockListRepository, InMemoryRepository};
    use crate::StanzaErrorCondition;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xmpp_parsers::iq::IqType;
    use xmpp_parsers::presence::{Presence, Type as PresenceType};

    struct Fixture {
        router: Router,
        repository: Arc<InMemoryRepository>,
        sessions: Arc<SessionTable>,
        ctx: Context,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(InMemoryRepository::new());
        let sessions = Arc::new(SessionTable::new());
        let router = Router::new(
            Arc::new(HostRegistry::new(["jackal.im"])),
            Arc::clone(&sessions),
            Arc::new(ComponentHub::new(Duration::from_secs(1))),
            repository.clone(),
        );
        Fixture {
            router,
            repository,
            sessions,
            ctx: Context::background(),
        }
    }

    fn bind(f: &Fixture, jid: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(C2sSession::new(jid.parse().unwrap(), tx, &f.ctx));
        f.sessions.bind(session, ResourceConflict::Replace).unwrap();
        rx
    }

    fn message(from: &str, to: &str) -> Stanza {
        let mut message = Message::new(Some(to.parse().unwrap()));
        message.from = Some(from.parse().unwrap());
        Stanza::Message(message)
    }

    #[tokio::test]
    async fn test_delivers_to_every_matching_session() {
        let f = fixture();
        let mut balcony = bind(&f, "ortuman@jackal.im/balcony");
        let mut yard = bind(&f, "ortuman@jackal.im/yard");

        f.router
            .route(&f.ctx, message("noelia@jackal.im/chamber", "ortuman@jackal.im"))
            .await
            .unwrap();
        assert!(matches!(balcony.try_recv(), Ok(Outbound::Stanza(Stanza::Message(_)))));
        assert!(matches!(yard.try_recv(), Ok(Outbound::Stanza(Stanza::Message(_)))));
    }

    #[tokio::test]
    async fn test_message_to_unbound_resource_falls_back_to_bare() {
        let f = fixture();
        let mut balcony = bind(&f, "ortuman@jackal.im/balcony");
        f.router
            .route(&f.ctx, message("noelia@jackal.im/chamber", "ortuman@jackal.im/gone"))
            .await
            .unwrap();
        assert!(balcony.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remote_domain_is_not_found() {
        let f = fixture();
        let err = f
            .router
            .route(&f.ctx, message("ortuman@jackal.im/balcony", "romeo@montague.lit"))
            .await
            .unwrap_err();
        assert_eq!(err.condition(), Some(StanzaErrorCondition::RemoteServerNotFound));
    }

    #[tokio::test]
    async fn test_presence_without_session_is_dropped() {
        let f = fixture();
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some("ortuman@jackal.im/balcony".parse().unwrap());
        presence.to = Some("noelia@jackal.im".parse().unwrap());
        assert!(f.router.route(&f.ctx, presence.into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_iq_without_modules_is_service_unavailable() {
        let f = fixture();
        let mut balcony = bind(&f, "ortuman@jackal.im/balcony");
        let iq = Iq {
            from: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            to: Some("jackal.im".parse().unwrap()),
            id: "q1".to_string(),
            payload: IqType::Get(minidom::Element::builder("query", "urn:unknown").build()),
        };
        f.router.route(&f.ctx, Stanza::Iq(iq)).await.unwrap();

        match balcony.try_recv() {
            Ok(Outbound::Stanza(Stanza::Iq(reply))) => {
                assert_eq!(reply.id, "q1");
                assert!(matches!(reply.payload, IqType::Error(_)));
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_sender_is_dropped() {
        let f = fixture();
        let mut balcony = bind(&f, "ortuman@jackal.im/balcony");
        f.repository
            .insert_blocklist_items(&[BlockListItem {
                username: "ortuman".to_string(),
                jid: "jackal.im/jail".parse().unwrap(),
            }])
            .await
            .unwrap();
        f.router.reload_blocklist("ortuman").await.unwrap();

        f.router
            .route(&f.ctx, message("romeo@jackal.im/jail", "ortuman@jackal.im"))
            .await
            .unwrap();
        assert!(balcony.try_recv().is_err());

        // The owner cannot reach blocked addresses either.
        let mut jail = bind(&f, "romeo@jackal.im/jail");
        f.router
            .route(&f.ctx, message("ortuman@jackal.im/balcony", "romeo@jackal.im/jail"))
            .await
            .unwrap();
        assert!(jail.try_recv().is_err());

        f.router
            .route(&f.ctx, message("noelia@jackal.im/chamber", "ortuman@jackal.im"))
            .await
            .unwrap();
        assert!(balcony.try_recv().is_ok());
    }
}
