//! Service Discovery (XEP-0030).
//!
//! Answers disco#info and disco#items for the server's own domains and for
//! local accounts. Features come from the other registered modules, so the
//! list always reflects what is actually wired in.
//!
//! ## Supported Queries
//!
//! - **Server disco#info**: identity `server/im` plus every module's server features
//! - **Account disco#info**: identity `account/registered` plus account features
//! - **Server disco#items**: one item per registered component host

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};

use super::{Module, ModuleRegistry};
use crate::components::ComponentHub;
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::storage::Repository;
use crate::{ns, Context, Stanza, XmppError};

/// Identity element for disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub type_: String,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(|s| s.to_string()),
        }
    }

    /// Server identity (category="server", type="im").
    pub fn server() -> Self {
        Self::new("server", "im", None)
    }

    /// Account identity (category="account", type="registered").
    pub fn account() -> Self {
        Self::new("account", "registered", None)
    }

    /// PubSub service identity (category="pubsub", type="service").
    pub fn pubsub_service() -> Self {
        Self::new("pubsub", "service", None)
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder("identity", ns::DISCO_INFO)
            .attr("category", &self.category)
            .attr("type", &self.type_);
        if let Some(name) = &self.name {
            builder = builder.attr("name", name);
        }
        builder.build()
    }
}

/// Build a `<query xmlns='disco#info'/>` payload.
pub fn build_disco_info(node: Option<&str>, identities: &[Identity], features: &[String]) -> Element {
    let mut builder = Element::builder("query", ns::DISCO_INFO);
    if let Some(node) = node {
        builder = builder.attr("node", node);
    }
    for identity in identities {
        builder = builder.append(identity.to_element());
    }
    for feature in features {
        builder = builder.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", feature)
                .build(),
        );
    }
    builder.build()
}

/// Build a `<query xmlns='disco#items'/>` payload listing `jids`.
pub fn build_disco_items(node: Option<&str>, jids: &[String]) -> Element {
    let mut builder = Element::builder("query", ns::DISCO_ITEMS);
    if let Some(node) = node {
        builder = builder.attr("node", node);
    }
    for jid in jids {
        builder = builder.append(Element::builder("item", ns::DISCO_ITEMS).attr("jid", jid).build());
    }
    builder.build()
}

/// Features and identities out of a disco#info result.
pub fn parse_disco_info(query: &Element) -> (Vec<Identity>, Vec<String>) {
    let identities = query
        .children()
        .filter(|c| c.is("identity", ns::DISCO_INFO))
        .filter_map(|c| {
            Some(Identity::new(c.attr("category")?, c.attr("type")?, c.attr("name")))
        })
        .collect();
    let features = query
        .children()
        .filter(|c| c.is("feature", ns::DISCO_INFO))
        .filter_map(|c| c.attr("var").map(str::to_string))
        .collect();
    (identities, features)
}

pub struct DiscoModule {
    registry: Weak<ModuleRegistry>,
    components: Arc<ComponentHub>,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
}

impl std::fmt::Debug for DiscoModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoModule").finish_non_exhaustive()
    }
}

impl DiscoModule {
    pub fn new(
        registry: Weak<ModuleRegistry>,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            registry,
            components: Arc::clone(router.components()),
            repository,
            router,
        }
    }

    fn registry(&self) -> Result<Arc<ModuleRegistry>, XmppError> {
        self.registry
            .upgrade()
            .ok_or_else(|| XmppError::service_unavailable(None))
    }

    async fn info(&self, target: Option<&Jid>, node: Option<&str>) -> Result<Element, XmppError> {
        let registry = self.registry()?;
        match target.and_then(|t| t.node().map(|n| n.to_string())) {
            Some(username) => {
                if !self.repository.user_exists(&username).await? {
                    return Err(XmppError::item_not_found(None));
                }
                let features = registry.account_features();
                Ok(build_disco_info(node, &[Identity::account()], &features))
            }
            None => {
                let features = registry.server_features();
                Ok(build_disco_info(node, &[Identity::server()], &features))
            }
        }
    }

    async fn items(&self, target: Option<&Jid>, node: Option<&str>) -> Result<Element, XmppError> {
        match target.and_then(|t| t.node().map(|n| n.to_string())) {
            Some(username) => {
                if !self.repository.user_exists(&username).await? {
                    return Err(XmppError::item_not_found(None));
                }
                Ok(build_disco_items(node, &[]))
            }
            None => Ok(build_disco_items(node, &self.components.hosts())),
        }
    }
}

#[async_trait]
impl Module for DiscoModule {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::DISCO_INFO.to_string(), ns::DISCO_ITEMS.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::DISCO_INFO.to_string(), ns::DISCO_ITEMS.to_string()]
    }

    fn matches_namespace(&self, ns: &str, _server_target: bool) -> bool {
        ns == ns::DISCO_INFO || ns == ns::DISCO_ITEMS
    }

    async fn process_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        let IqType::Get(query) = &iq.payload else {
            return Err(XmppError::bad_request(None));
        };
        let node = query.attr("node");
        let target = iq.to.as_ref();
        debug!(target = ?target.map(|t| t.to_string()), node = ?node, ns = %query.ns(), "Disco query");

        let payload = if query.is("query", ns::DISCO_INFO) {
            self.info(target, node).await?
        } else if query.is("query", ns::DISCO_ITEMS) {
            self.items(target, node).await?
        } else {
            return Err(XmppError::bad_request(None));
        };
        self.router
            .route(ctx, Stanza::Iq(iq_result(iq, Some(payload))))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostRegistry;
    use crate::modules::PingModule;
    use crate::registry::SessionTable;
    use crate::storage::{InMemoryRepository, User, UserRepository};
    use std::time::Duration;

    async fn setup() -> (Arc<ModuleRegistry>, Arc<DiscoModule>) {
        let repository = Arc::new(InMemoryRepository::new());
        repository.upsert_user(&User::new("ortuman")).await.unwrap();
        let router = Arc::new(Router::new(
            Arc::new(HostRegistry::new(["jackal.im"])),
            Arc::new(SessionTable::new()),
            Arc::new(ComponentHub::new(Duration::from_secs(1))),
            repository.clone(),
        ));
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&router)));
        let disco = Arc::new(DiscoModule::new(
            Arc::downgrade(&registry),
            repository,
            Arc::clone(&router),
        ));
        registry.register(disco.clone());
        registry.register(Arc::new(PingModule::new(router)));
        (registry, disco)
    }

    #[tokio::test]
    async fn test_server_info_lists_module_features() {
        let (_registry, disco) = setup().await;
        let server: Jid = "jackal.im".parse().unwrap();
        let info = disco.info(Some(&server), None).await.unwrap();
        let (identities, features) = parse_disco_info(&info);
        assert_eq!(identities, vec![Identity::server()]);
        assert!(features.contains(&ns::PING.to_string()));
        assert!(features.contains(&ns::DISCO_ITEMS.to_string()));
    }

    #[tokio::test]
    async fn test_account_info() {
        let (_registry, disco) = setup().await;
        let account: Jid = "ortuman@jackal.im".parse().unwrap();
        let info = disco.info(Some(&account), None).await.unwrap();
        let (identities, _) = parse_disco_info(&info);
        assert_eq!(identities, vec![Identity::account()]);

        let unknown: Jid = "nobody@jackal.im".parse().unwrap();
        let err = disco.info(Some(&unknown), None).await.unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::ItemNotFound));
    }

    #[tokio::test]
    async fn test_items_empty_without_components() {
        let (_registry, disco) = setup().await;
        let items = disco.items(None, None).await.unwrap();
        assert_eq!(items.children().count(), 0);
    }
}
