//! In-process lifecycle event bus.
//!
//! Modules learn about session and user lifecycle changes by subscribing
//! handlers for an [`EventKind`]. Publishing runs every handler for the
//! event's kind, in registration order, on the publisher's task. Handler
//! errors are logged and never reach the publisher.
//!
//! The subscriber table is copy-on-write: `publish` clones an `Arc` snapshot
//! and releases the lock before awaiting any handler, so handlers may
//! subscribe or unsubscribe without deadlocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, warn};
use xmpp_parsers::presence::Presence;

use crate::{Context, XmppError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionBound,
    SessionUnbound,
    PresenceReceived,
    UserDeleted,
    BlockListUpdated,
    PubSubItemPublished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionBound => "session.bound",
            Self::SessionUnbound => "session.unbound",
            Self::PresenceReceived => "session.presence_received",
            Self::UserDeleted => "user.deleted",
            Self::BlockListUpdated => "blocklist.updated",
            Self::PubSubItemPublished => "pubsub.item_published",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A resource was bound for an authenticated stream.
    SessionBound { session_id: String, jid: FullJid },
    /// A session left the session table.
    SessionUnbound { session_id: String, jid: FullJid },
    /// A local user broadcast an available or unavailable presence.
    PresenceReceived { jid: FullJid, presence: Presence },
    UserDeleted { username: String },
    BlockListUpdated { jid: BareJid },
    PubSubItemPublished {
        host: String,
        node: String,
        item_id: String,
        publisher: Jid,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionBound { .. } => EventKind::SessionBound,
            Event::SessionUnbound { .. } => EventKind::SessionUnbound,
            Event::PresenceReceived { .. } => EventKind::PresenceReceived,
            Event::UserDeleted { .. } => EventKind::UserDeleted,
            Event::BlockListUpdated { .. } => EventKind::BlockListUpdated,
            Event::PubSubItemPublished { .. } => EventKind::PubSubItemPublished,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, event: &Event) -> Result<(), XmppError>;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HandlerList = Vec<(SubscriptionId, Arc<dyn EventHandler>)>;
type SubscriberTable = HashMap<EventKind, HandlerList>;

pub struct EventBus {
    subscribers: RwLock<Arc<SubscriberTable>>,
    next_id: AtomicU64,
    events_published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("events_published", &self.events_published())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut guard) = self.subscribers.write() {
            let mut table: SubscriberTable = (**guard).clone();
            table.entry(kind).or_default().push((id, handler));
            *guard = Arc::new(table);
        }
        debug!(kind = %kind, id = id.0, "Event subscription registered");
        id
    }

    /// Remove a subscription. Returns `false` if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut guard) = self.subscribers.write() else {
            return false;
        };
        let mut table: SubscriberTable = (**guard).clone();
        let mut removed = false;
        for handlers in table.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sub_id, _)| *sub_id != id);
            removed |= handlers.len() != before;
        }
        table.retain(|_, handlers| !handlers.is_empty());
        *guard = Arc::new(table);
        removed
    }

    /// Deliver `event` to every handler subscribed to its kind.
    ///
    /// Returns the number of handlers that completed without error.
    pub async fn publish(&self, ctx: &Context, event: Event) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();

        let snapshot = match self.subscribers.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(_) => return 0,
        };
        let Some(handlers) = snapshot.get(&kind) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match handler.handle(ctx, &event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(kind = %kind, subscription = id.0, error = %e, "Event handler failed");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|table| table.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _ctx: &Context, _event: &Event) -> Result<(), XmppError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(XmppError::internal("handler failure"))
            } else {
                Ok(())
            }
        }
    }

    fn deleted() -> Event {
        Event::UserDeleted {
            username: "ortuman".to_string(),
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            bus.subscribe(
                EventKind::UserDeleted,
                Arc::new(Recorder {
                    name,
                    log: log.clone(),
                    fail: false,
                }),
            );
        }

        let delivered = bus.publish(&Context::background(), deleted()).await;
        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::UserDeleted,
            Arc::new(Recorder {
                name: "broken",
                log: log.clone(),
                fail: true,
            }),
        );
        bus.subscribe(
            EventKind::UserDeleted,
            Arc::new(Recorder {
                name: "healthy",
                log: log.clone(),
                fail: false,
            }),
        );

        let delivered = bus.publish(&Context::background(), deleted()).await;
        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["broken", "healthy"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_kind_filtering() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(
            EventKind::UserDeleted,
            Arc::new(Recorder {
                name: "gone",
                log: log.clone(),
                fail: false,
            }),
        );
        bus.subscribe(
            EventKind::SessionBound,
            Arc::new(Recorder {
                name: "bound",
                log: log.clone(),
                fail: false,
            }),
        );

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(&Context::background(), deleted()).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.events_published(), 1);
    }
}
