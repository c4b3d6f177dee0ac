//! Offline message storage.
//!
//! Messages for accounts without a bound session are queued (with a
//! XEP-0203 delay stamp) up to the configured bound and replayed in FIFO
//! order when a resource is bound.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use jid::FullJid;
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::message::{Message, MessageType};

use super::Module;
use crate::config::CoreConfig;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::routing::{OfflineStore, Router};
use crate::storage::{in_transaction, Repository};
use crate::{ns, Context, Stanza, XmppError};

/// Feature advertised for flexible offline message retrieval support.
const OFFLINE_FEATURE: &str = "msgoffline";

pub struct OfflineModule {
    queue_size: usize,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl std::fmt::Debug for OfflineModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineModule")
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl OfflineModule {
    pub fn new(
        config: &CoreConfig,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            queue_size: config.offline.queue_size,
            repository,
            router,
            events,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Only chat and normal messages carrying a body are worth keeping.
    fn is_storable(message: &Message) -> bool {
        matches!(message.type_, MessageType::Chat | MessageType::Normal)
            && !message.bodies.is_empty()
    }
}

fn delay_element(from: &str) -> Element {
    Element::builder("delay", ns::DELAY)
        .attr("from", from)
        .attr(
            "stamp",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        )
        .build()
}

#[async_trait]
impl OfflineStore for OfflineModule {
    #[instrument(skip(self, _ctx, message), fields(to = ?message.to.as_ref().map(|j| j.to_string())))]
    async fn store(&self, _ctx: &Context, mut message: Message) -> Result<(), XmppError> {
        if !Self::is_storable(&message) {
            debug!(type_ = ?message.type_, "Discarding message for offline user");
            return Ok(());
        }
        let Some(to) = message.to.clone() else {
            return Err(XmppError::bad_request(None));
        };
        let Some(username) = to.node().map(|n| n.to_string()) else {
            return Err(XmppError::service_unavailable(None));
        };
        if !self.repository.user_exists(&username).await? {
            return Err(XmppError::service_unavailable(None));
        }

        message.payloads.push(delay_element(to.domain().as_str()));
        // Count and insert in one transaction so concurrent senders cannot
        // overrun the bound.
        let queue_size = self.queue_size;
        let owner = username.clone();
        let id = in_transaction(self.repository.as_ref(), move |tx| {
            Box::pin(async move {
                let queued = tx.count_offline_messages(&owner).await?;
                if queued >= queue_size {
                    debug!(username = %owner, queued, "Offline queue full");
                    return Err(XmppError::service_unavailable(Some(
                        "Offline message queue is full".to_string(),
                    )));
                }
                tx.insert_offline_message(&owner, &message).await
            })
        })
        .await?;
        debug!(username = %username, id, "Message stored offline");
        Ok(())
    }
}

#[async_trait]
impl Module for OfflineModule {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn server_features(&self) -> Vec<String> {
        vec![OFFLINE_FEATURE.to_string()]
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        let handler = Arc::new(OfflineEvents {
            repository: Arc::clone(&self.repository),
            router: Arc::clone(&self.router),
        });
        let ids = vec![
            self.events.subscribe(EventKind::SessionBound, handler.clone()),
            self.events.subscribe(EventKind::UserDeleted, handler),
        ];
        if let Ok(mut slot) = self.subscriptions.lock() {
            slot.extend(ids);
        }
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), XmppError> {
        let ids = self
            .subscriptions
            .lock()
            .map(|mut slot| std::mem::take(&mut *slot))
            .unwrap_or_default();
        for id in ids {
            self.events.unsubscribe(id);
        }
        Ok(())
    }
}

struct OfflineEvents {
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
}

impl OfflineEvents {
    /// Replay queued messages to `jid`. Delivery is best effort per message;
    /// only delivered messages are removed.
    async fn drain(&self, jid: &FullJid) -> Result<(), XmppError> {
        let Some(session) = self.router.sessions().session(jid) else {
            return Ok(());
        };
        let username = session.username().to_string();
        let messages = self.repository.fetch_offline_messages(&username).await?;
        if messages.is_empty() {
            return Ok(());
        }

        // Bound to the session: a disconnect stops the replay.
        let ctx = session.lifetime();
        let mut delivered = Vec::with_capacity(messages.len());
        for offline in messages {
            let mut message = offline.message;
            message.to = Some(session.address());
            match self.router.route(ctx, Stanza::Message(message)).await {
                Ok(()) => delivered.push(offline.id),
                Err(XmppError::Canceled) => break,
                Err(e) => warn!(id = offline.id, error = %e, "Offline message delivery failed"),
            }
        }

        self.repository
            .delete_offline_messages(&username, &delivered)
            .await?;
        info!(jid = %jid, delivered = delivered.len(), "Offline messages delivered");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for OfflineEvents {
    async fn handle(&self, _ctx: &Context, event: &Event) -> Result<(), XmppError> {
        match event {
            Event::SessionBound { jid, .. } => self.drain(jid).await,
            Event::UserDeleted { username } => {
                self.repository.delete_all_offline_messages(username).await
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
    use crate::storage::{InMemoryRepository, OfflineRepository, User, UserRepository};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xmpp_parsers::message::Body;

    struct Fixture {
        module: Arc<OfflineModule>,
        repository: Arc<InMemoryRepository>,
        sessions: Arc<SessionTable>,
        router: Arc<Router>,
        events: Arc<EventBus>,
        ctx: Context,
    }

    async fn fixture(queue_size: usize) -> Fixture {
        let mut config = CoreConfig::default();
        config.offline.queue_size = queue_size;
        let repository = Arc::new(InMemoryRepository::new());
        repository.upsert_user(&User::new("noelia")).await.unwrap();
        let sessions = Arc::new(SessionTable::new());
        let router = Arc::new(Router::new(
            Arc::new(HostRegistry::new(["jackal.im"])),
            Arc::clone(&sessions),
            Arc::new(ComponentHub::new(Duration::from_secs(1))),
            repository.clone(),
        ));
        let events = Arc::new(EventBus::new());
        let module = Arc::new(OfflineModule::new(
            &config,
            repository.clone(),
            Arc::clone(&router),
            Arc::clone(&events),
        ));
        let store: std::sync::Weak<dyn OfflineStore> =
            Arc::downgrade(&(module.clone() as Arc<dyn OfflineStore>));
        router.set_offline_store(store);
        Fixture {
            module,
            repository,
            sessions,
            router,
            events,
            ctx: Context::background(),
        }
    }

    fn chat(body: &str) -> Message {
        let mut message = Message::new(Some("noelia@jackal.im".parse().unwrap()));
        message.from = Some("ortuman@jackal.im/balcony".parse().unwrap());
        message.type_ = MessageType::Chat;
        message.bodies.insert(String::new(), Body(body.to_string()));
        message
    }

    #[tokio::test]
    async fn test_store_adds_delay_and_enforces_bound() {
        let f = fixture(2).await;
        f.module.store(&f.ctx, chat("one")).await.unwrap();
        f.module.store(&f.ctx, chat("two")).await.unwrap();
        let err = f.module.store(&f.ctx, chat("three")).await.unwrap_err();
        assert_eq!(
            err.condition(),
            Some(crate::StanzaErrorCondition::ServiceUnavailable)
        );

        let stored = f.repository.fetch_offline_messages("noelia").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0]
            .message
            .payloads
            .iter()
            .any(|p| p.is("delay", ns::DELAY)));
    }

    #[tokio::test]
    async fn test_concurrent_stores_respect_bound() {
        let f = fixture(1).await;
        let stores = (0..16).map(|i| f.module.store(&f.ctx, chat(&format!("m{}", i))));
        let outcomes = futures::future::join_all(stores).await;

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes.iter().filter_map(|o| o.as_ref().err()).all(|e| {
            e.condition() == Some(crate::StanzaErrorCondition::ServiceUnavailable)
        }));
        assert_eq!(f.repository.count_offline_messages("noelia").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advertises_feature_without_claiming_iqs() {
        use crate::modules::ModuleRegistry;
        use crate::routing::IqDispatcher;
        use xmpp_parsers::iq::{Iq, IqType};

        let f = fixture(10).await;
        let registry = ModuleRegistry::new(Arc::clone(&f.router));
        registry.register(f.module.clone());
        assert_eq!(registry.server_features(), vec![OFFLINE_FEATURE.to_string()]);

        let query = Element::builder("offline", "http://jabber.org/protocol/offline").build();
        let iq = Iq {
            from: Some("noelia@jackal.im/yard".parse().unwrap()),
            to: Some("jackal.im".parse().unwrap()),
            id: "off1".to_string(),
            payload: IqType::Get(query),
        };
        assert!(!registry.dispatch_iq(&f.ctx, iq, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_messages_without_body_are_discarded() {
        let f = fixture(10).await;
        let mut message = chat("x");
        message.bodies.clear();
        f.module.store(&f.ctx, message).await.unwrap();

        let mut headline = chat("x");
        headline.type_ = MessageType::Headline;
        f.module.store(&f.ctx, headline).await.unwrap();

        assert_eq!(f.repository.count_offline_messages("noelia").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_on_bind_delivers_in_order() {
        let f = fixture(10).await;
        f.module.start(&f.ctx).await.unwrap();
        f.module.store(&f.ctx, chat("one")).await.unwrap();
        f.module.store(&f.ctx, chat("two")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let jid: FullJid = "noelia@jackal.im/yard".parse().unwrap();
        let session = Arc::new(C2sSession::new(jid.clone(), tx, &f.ctx));
        f.sessions
            .bind(Arc::clone(&session), ResourceConflict::Replace)
            .unwrap();
        f.events
            .publish(
                &f.ctx,
                Event::SessionBound {
                    session_id: session.id().to_string(),
                    jid,
                },
            )
            .await;

        let mut bodies = Vec::new();
        while let Ok(Outbound::Stanza(Stanza::Message(m))) = rx.try_recv() {
            bodies.push(m.bodies.get("").map(|b| b.0.clone()).unwrap_or_default());
        }
        assert_eq!(bodies, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(f.repository.count_offline_messages("noelia").await.unwrap(), 0);
    }
}
