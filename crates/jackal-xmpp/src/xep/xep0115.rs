//! XEP-0115: Entity Capabilities
//!
//! Clients advertise a `<c/>` element in their presence whose `ver` is a hash
//! of their disco#info. The [`CapabilitiesCache`] watches broadcast presences,
//! queries disco#info once per unknown `(node, ver)` pair, verifies the hash
//! and stores the features through the repository. PubSub filtered
//! notifications look features up with [`CapabilitiesCache::features_for`].
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0115.html>

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use jid::{FullJid, Jid};
use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{debug, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::events::{Event, EventBus, EventHandler, EventKind, SubscriptionId};
use crate::modules::disco::{parse_disco_info, Identity};
use crate::modules::{Module, ModuleRegistry};
use crate::storage::{Capabilities, Repository};
use crate::{ns, Context, XmppError};

/// How long to wait for a client's disco#info answer.
const DISCO_TIMEOUT: Duration = Duration::from_secs(10);

/// Entity Capabilities element (`<c xmlns='http://jabber.org/protocol/caps'>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    /// Hash algorithm used ("sha-1" for current clients)
    pub hash: String,
    pub node: String,
    pub ver: String,
}

impl Caps {
    pub fn new(node: &str, ver: &str) -> Self {
        Self {
            hash: "sha-1".to_string(),
            node: node.to_string(),
            ver: ver.to_string(),
        }
    }

    /// The `node#ver` string used for disco#info queries with caps.
    pub fn node_ver(&self) -> String {
        format!("{}#{}", self.node, self.ver)
    }

    pub fn build_element(&self) -> Element {
        Element::builder("c", ns::CAPS)
            .attr("hash", &self.hash)
            .attr("node", &self.node)
            .attr("ver", &self.ver)
            .build()
    }

    pub fn from_element(elem: &Element) -> Option<Self> {
        if !elem.is("c", ns::CAPS) {
            return None;
        }
        Some(Self {
            hash: elem.attr("hash")?.to_string(),
            node: elem.attr("node")?.to_string(),
            ver: elem.attr("ver")?.to_string(),
        })
    }
}

/// Extract Caps from a presence stanza.
pub fn extract_caps(presence: &Presence) -> Option<Caps> {
    presence.payloads.iter().find_map(Caps::from_element)
}

/// Compute the capabilities verification string hash per XEP-0115 §5.
///
/// Identities are sorted by category/type/name and features alphabetically,
/// each followed by `<`, then the string is SHA-1 hashed and base64 encoded.
pub fn compute_caps_hash(identities: &[Identity], features: &[String]) -> String {
    let mut s = String::new();

    let mut sorted_identities: Vec<_> = identities.iter().collect();
    sorted_identities.sort_by(|a, b| (&a.category, &a.type_, &a.name).cmp(&(&b.category, &b.type_, &b.name)));
    for id in sorted_identities {
        s.push_str(&id.category);
        s.push('/');
        s.push_str(&id.type_);
        s.push('/'); // lang
        s.push('/');
        if let Some(ref name) = id.name {
            s.push_str(name);
        }
        s.push('<');
    }

    let mut sorted_features: Vec<_> = features.iter().collect();
    sorted_features.sort();
    for feat in sorted_features {
        s.push_str(feat);
        s.push('<');
    }

    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    BASE64.encode(hasher.finalize())
}

struct CapsState {
    repository: Arc<dyn Repository>,
    registry: Weak<ModuleRegistry>,
    /// Caps last advertised by each available resource.
    entities: DashMap<FullJid, Caps>,
    /// `node#ver` pairs with a disco#info request in flight.
    inflight: DashMap<String, ()>,
}

impl CapsState {
    #[instrument(skip(self, ctx, caps), fields(node_ver = %caps.node_ver()))]
    async fn discover(&self, ctx: &Context, jid: FullJid, caps: Caps) -> Result<(), XmppError> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        let server: Jid = jid
            .domain()
            .as_str()
            .parse()
            .map_err(|_| XmppError::jid_malformed(None))?;
        let request = Iq {
            from: Some(server),
            to: Some(Jid::from(jid)),
            id: String::new(),
            payload: IqType::Get(
                Element::builder("query", ns::DISCO_INFO)
                    .attr("node", caps.node_ver())
                    .build(),
            ),
        };

        let response = registry.send_iq_request(ctx, request, DISCO_TIMEOUT).await?;
        let IqType::Result(Some(query)) = response.payload else {
            debug!("Entity did not answer disco#info");
            return Ok(());
        };
        let (identities, features) = parse_disco_info(&query);
        if caps.hash == "sha-1" && compute_caps_hash(&identities, &features) != caps.ver {
            warn!("Capabilities hash mismatch, discarding");
            return Ok(());
        }

        self.repository
            .upsert_capabilities(&Capabilities {
                node: caps.node,
                ver: caps.ver,
                features,
            })
            .await?;
        debug!("Capabilities stored");
        Ok(())
    }
}

struct CapsEvents(Arc<CapsState>);

#[async_trait]
impl EventHandler for CapsEvents {
    async fn handle(&self, ctx: &Context, event: &Event) -> Result<(), XmppError> {
        let state = &self.0;
        match event {
            Event::PresenceReceived { jid, presence } => {
                if presence.type_ == PresenceType::Unavailable {
                    state.entities.remove(jid);
                    return Ok(());
                }
                let Some(caps) = extract_caps(presence) else {
                    return Ok(());
                };
                state.entities.insert(jid.clone(), caps.clone());

                if state.repository.capabilities_exist(&caps.node, &caps.ver).await? {
                    return Ok(());
                }
                let key = caps.node_ver();
                if state.inflight.insert(key.clone(), ()).is_some() {
                    return Ok(());
                }
                // The client answers on its own stream; waiting here would
                // stall the publisher that is processing that same stream.
                let state = Arc::clone(state);
                let ctx = ctx.child();
                let jid = jid.clone();
                tokio::spawn(async move {
                    if let Err(e) = state.discover(&ctx, jid, caps).await {
                        warn!(error = %e, "Capabilities discovery failed");
                    }
                    state.inflight.remove(&key);
                });
                Ok(())
            }
            Event::SessionUnbound { jid, .. } => {
                state.entities.remove(jid);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub struct CapabilitiesCache {
    state: Arc<CapsState>,
    events: Arc<EventBus>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl std::fmt::Debug for CapabilitiesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitiesCache")
            .field("entities", &self.state.entities.len())
            .field("inflight", &self.state.inflight.len())
            .finish()
    }
}

impl CapabilitiesCache {
    pub fn new(
        repository: Arc<dyn Repository>,
        registry: Weak<ModuleRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            state: Arc::new(CapsState {
                repository,
                registry,
                entities: DashMap::new(),
                inflight: DashMap::new(),
            }),
            events,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Caps currently advertised by `jid`, if any.
    pub fn caps_for(&self, jid: &FullJid) -> Option<Caps> {
        self.state.entities.get(jid).map(|entry| entry.value().clone())
    }

    /// Features known for the resource `jid`. Unknown entities, and entities
    /// whose capabilities were not yet discovered, have none.
    pub async fn features_for(&self, jid: &Jid) -> Result<Vec<String>, XmppError> {
        let Ok(full) = jid.clone().try_into_full() else {
            return Ok(Vec::new());
        };
        let Some(caps) = self.caps_for(&full) else {
            return Ok(Vec::new());
        };
        Ok(self
            .state
            .repository
            .fetch_capabilities(&caps.node, &caps.ver)
            .await?
            .map(|c| c.features)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Module for CapabilitiesCache {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::CAPS.to_string()]
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        let handler = Arc::new(CapsEvents(Arc::clone(&self.state)));
        let ids = vec![
            self.events.subscribe(EventKind::PresenceReceived, handler.clone()),
            self.events.subscribe(EventKind::SessionUnbound, handler),
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
        self.state.entities.clear();
        Ok(())
    }
}
