//! Server core assembly.
//!
//! [`XmppCore`] wires the session table, router, modules and components
//! over one repository and owns their lifecycle. The stream layer drives
//! it through [`XmppCore::c2s`].

use std::sync::{Arc, Weak};

use tracing::{info, warn};

use crate::c2s::C2sHandler;
use crate::components::ComponentHub;
use crate::config::CoreConfig;
use crate::events::EventBus;
use crate::hosts::HostRegistry;
use crate::modules::{
    BlockListModule, DiscoModule, LastActivityModule, ModuleRegistry, OfflineModule, PingModule,
};
use crate::pubsub::{EntityValidator, PubSubComponent, PubSubService};
use crate::registry::SessionTable;
use crate::roster::RosterModule;
use crate::routing::{IqDispatcher, OfflineStore, Router};
use crate::storage::{InMemoryRepository, Repository};
use crate::xep::CapabilitiesCache;
use crate::{stream_errors, Context, XmppError};

/// Builder for [`XmppCore`].
pub struct XmppCoreBuilder {
    config: CoreConfig,
    repository: Option<Arc<dyn Repository>>,
    validator: Option<Arc<dyn EntityValidator>>,
}

impl XmppCoreBuilder {
    /// Storage backend. Defaults to [`InMemoryRepository`].
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Policy deciding which entities may use the pubsub service.
    pub fn entity_validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> Result<XmppCore, XmppError> {
        XmppCore::assemble(self)
    }
}

pub struct XmppCore {
    config: CoreConfig,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    events: Arc<EventBus>,
    modules: Arc<ModuleRegistry>,
    // Kept alive here: the router only holds a weak reference.
    _offline: Arc<OfflineModule>,
    pubsub: Arc<PubSubService>,
    c2s: C2sHandler,
    lifetime: Context,
}

impl std::fmt::Debug for XmppCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppCore")
            .field("hosts", &self.config.hosts)
            .field("router", &self.router)
            .field("modules", &self.modules)
            .finish()
    }
}

impl XmppCore {
    pub fn builder(config: CoreConfig) -> XmppCoreBuilder {
        XmppCoreBuilder {
            config,
            repository: None,
            validator: None,
        }
    }

    fn assemble(builder: XmppCoreBuilder) -> Result<Self, XmppError> {
        let XmppCoreBuilder {
            config,
            repository,
            validator,
        } = builder;
        if config.hosts.is_empty() {
            return Err(XmppError::config("at least one local host is required"));
        }
        let repository = repository.unwrap_or_else(|| Arc::new(InMemoryRepository::new()));

        let hosts = Arc::new(HostRegistry::new(config.hosts.clone()));
        let sessions = Arc::new(SessionTable::new());
        let components = Arc::new(ComponentHub::new(config.components.stop_timeout()));
        let router = Arc::new(Router::new(
            hosts,
            sessions,
            components,
            Arc::clone(&repository),
        ));
        let events = Arc::new(EventBus::new());
        let modules = Arc::new(ModuleRegistry::new(Arc::clone(&router)));

        let roster = Arc::new(RosterModule::new(
            &config,
            Arc::clone(&repository),
            Arc::clone(&router),
            Arc::clone(&events),
        ));
        let offline = Arc::new(OfflineModule::new(
            &config,
            Arc::clone(&repository),
            Arc::clone(&router),
            Arc::clone(&events),
        ));
        let caps = Arc::new(CapabilitiesCache::new(
            Arc::clone(&repository),
            Arc::downgrade(&modules),
            Arc::clone(&events),
        ));

        modules.register(roster.clone());
        modules.register(Arc::new(BlockListModule::new(
            &config,
            Arc::clone(&repository),
            Arc::clone(&router),
            Arc::clone(&events),
        )));
        modules.register(Arc::new(LastActivityModule::new(
            Arc::clone(&repository),
            Arc::clone(&router),
        )));
        modules.register(Arc::new(DiscoModule::new(
            Arc::downgrade(&modules),
            Arc::clone(&repository),
            Arc::clone(&router),
        )));
        modules.register(Arc::new(PingModule::new(Arc::clone(&router))));
        modules.register(offline.clone());
        modules.register(caps.clone());

        // Downgrade first, then unsize the Weak.
        let weak_modules = Arc::downgrade(&modules);
        let dispatcher: Weak<dyn IqDispatcher> = weak_modules;
        router.set_iq_dispatcher(dispatcher.clone());
        let weak_offline = Arc::downgrade(&offline);
        let store: Weak<dyn OfflineStore> = weak_offline;
        router.set_offline_store(store);

        let pubsub_hosts = if config.pubsub.hosts.is_empty() {
            vec![format!("pubsub.{}", config.hosts[0])]
        } else {
            config.pubsub.hosts.clone()
        };
        let mut service = PubSubService::new(
            &config.pubsub,
            pubsub_hosts,
            Arc::clone(&repository),
            Arc::clone(&router),
            Arc::clone(&events),
        )
        .with_capabilities(caps);
        if let Some(validator) = validator {
            service = service.with_validator(validator);
        }

        let c2s = C2sHandler::new(
            config.resource_conflict,
            Arc::clone(&repository),
            Arc::clone(&router),
            roster,
            dispatcher,
            Arc::clone(&events),
        );

        Ok(Self {
            config,
            repository,
            router,
            events,
            modules,
            _offline: offline,
            pubsub: Arc::new(service),
            c2s,
            lifetime: Context::background(),
        })
    }

    /// Start modules and register the pubsub components.
    pub async fn start(&self) -> Result<(), XmppError> {
        let ctx = &self.lifetime;
        self.modules.start(ctx).await?;

        self.pubsub.attach();
        for host in self.pubsub.hosts() {
            let component = Arc::new(PubSubComponent::new(
                host.clone(),
                Arc::clone(&self.pubsub),
                Arc::clone(&self.repository),
                Arc::clone(&self.router),
            ));
            self.router.components().register(ctx, component).await?;
        }

        info!(
            hosts = ?self.config.hosts,
            components = ?self.router.components().hosts(),
            "XMPP core started"
        );
        Ok(())
    }

    /// Disconnect every session and stop components and modules.
    pub async fn shutdown(&self) {
        let sessions = self.router.sessions().all_sessions();
        let count = sessions.len();
        for session in sessions {
            session.disconnect(Some(stream_errors::SYSTEM_SHUTDOWN));
        }

        let ctx = Context::background();
        self.pubsub.detach();
        self.router.components().stop_all(&ctx).await;
        self.modules.stop(&ctx).await;
        self.lifetime.cancel();

        if count > 0 {
            warn!(sessions = count, "Sessions disconnected on shutdown");
        }
        info!("XMPP core stopped");
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn c2s(&self) -> &C2sHandler {
        &self.c2s
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn pubsub(&self) -> &Arc<PubSubService> {
        &self.pubsub
    }

    /// Context cancelled on shutdown; parent for session contexts.
    pub fn context(&self) -> &Context {
        &self.lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_modules_registered_in_order() {
        let core = XmppCore::builder(CoreConfig::default()).build().unwrap();
        assert_eq!(
            core.modules().module_names(),
            vec!["roster", "blocklist", "last_activity", "disco", "ping", "offline", "caps"]
        );
    }

    #[tokio::test]
    async fn test_router_reaches_offline_store() {
        use crate::storage::{OfflineRepository, User, UserRepository};
        use crate::Stanza;
        use xmpp_parsers::message::{Body, Message, MessageType};

        let core = XmppCore::builder(CoreConfig::default()).build().unwrap();
        core.repository().upsert_user(&User::new("noelia")).await.unwrap();

        let mut message = Message::new(Some("noelia@localhost".parse().unwrap()));
        message.from = Some("ortuman@localhost/balcony".parse().unwrap());
        message.type_ = MessageType::Chat;
        message.bodies.insert(String::new(), Body("hi".to_string()));
        core.router()
            .route(core.context(), Stanza::Message(message))
            .await
            .unwrap();

        assert_eq!(core.repository().count_offline_messages("noelia").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pubsub_defaults_to_first_host() {
        let core = XmppCore::builder(CoreConfig::default()).build().unwrap();
        core.start().await.unwrap();
        assert!(core.router().components().is_component_host("pubsub.localhost"));
        core.shutdown().await;
        assert!(core.context().is_canceled());
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let config = CoreConfig {
            hosts: Vec::new(),
            ..CoreConfig::default()
        };
        assert!(XmppCore::builder(config).build().is_err());
    }
}
