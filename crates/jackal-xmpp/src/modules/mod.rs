//! IQ handling modules.
//!
//! A [`Module`] claims IQ payload namespaces and handles matching requests.
//! The [`ModuleRegistry`] consults modules in registration order; the first
//! whose predicate accepts the payload namespace handles the IQ. Errors a
//! module returns are turned into IQ error replies here, so modules can use
//! `?` freely.
//!
//! The registry also tracks IQ requests originated by the server itself
//! (e.g. capability discovery) and hands matching responses back to the
//! waiting caller.

pub mod blocklist;
pub mod disco;
pub mod last_activity;
pub mod offline;
pub mod ping;

pub use blocklist::BlockListModule;
pub use disco::DiscoModule;
pub use last_activity::LastActivityModule;
pub use offline::OfflineModule;
pub use ping::PingModule;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use xmpp_parsers::iq::{Iq, IqType};

use crate::routing::{IqDispatcher, Router};
use crate::stanza::{iq_error, request_payload};
use crate::{Context, Stanza, XmppError};

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Features advertised on the server's disco#info.
    fn server_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Features advertised on account disco#info.
    fn account_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether this module handles payloads in `ns`. `server_target` is set
    /// when the IQ is addressed to the server rather than an account.
    ///
    /// Modules that only advertise features or react to events keep the
    /// default and never see an IQ.
    fn matches_namespace(&self, _ns: &str, _server_target: bool) -> bool {
        false
    }

    /// Only called for IQs whose payload namespace this module matched.
    async fn process_iq(&self, _ctx: &Context, _iq: &Iq) -> Result<(), XmppError> {
        Err(XmppError::feature_not_implemented(None))
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), XmppError> {
        Ok(())
    }
}

pub struct ModuleRegistry {
    router: Arc<Router>,
    modules: RwLock<Vec<Arc<dyn Module>>>,
    pending: DashMap<String, oneshot::Sender<Iq>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.module_names())
            .field("pending_requests", &self.pending.len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            modules: RwLock::new(Vec::new()),
            pending: DashMap::new(),
        }
    }

    /// Append `module`. Modules registered earlier take precedence.
    pub fn register(&self, module: Arc<dyn Module>) {
        if let Ok(mut modules) = self.modules.write() {
            debug!(module = module.name(), "Module registered");
            modules.push(module);
        }
    }

    pub fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.modules
            .read()
            .map(|modules| modules.clone())
            .unwrap_or_default()
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules().iter().map(|m| m.name()).collect()
    }

    pub fn server_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .modules()
            .iter()
            .flat_map(|m| m.server_features())
            .collect();
        features.sort();
        features.dedup();
        features
    }

    pub fn account_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .modules()
            .iter()
            .flat_map(|m| m.account_features())
            .collect();
        features.sort();
        features.dedup();
        features
    }

    pub async fn start(&self, ctx: &Context) -> Result<(), XmppError> {
        for module in self.modules() {
            module.start(ctx).await?;
            info!(module = module.name(), "Module started");
        }
        Ok(())
    }

    pub async fn stop(&self, ctx: &Context) {
        for module in self.modules().iter().rev() {
            if let Err(e) = module.stop(ctx).await {
                warn!(module = module.name(), error = %e, "Module stop failed");
            }
        }
        self.pending.clear();
    }

    /// Send an IQ request from the server and wait for its response.
    ///
    /// A fresh id is assigned to `iq`. Fails with [`XmppError::Timeout`]
    /// when no response arrives within `timeout`.
    pub async fn send_iq_request(
        &self,
        ctx: &Context,
        mut iq: Iq,
        timeout: Duration,
    ) -> Result<Iq, XmppError> {
        iq.id = Uuid::new_v4().to_string();
        let id = iq.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        if let Err(e) = self.router.route(ctx, Stanza::Iq(iq)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let outcome = ctx
            .with_timeout(timeout)
            .run(async move { rx.await.map_err(|_| XmppError::Canceled) })
            .await;
        self.pending.remove(&id);
        outcome
    }

    fn find_module(&self, ns: &str, server_target: bool) -> Option<Arc<dyn Module>> {
        self.modules
            .read()
            .ok()?
            .iter()
            .find(|m| m.matches_namespace(ns, server_target))
            .cloned()
    }
}

#[async_trait]
impl IqDispatcher for ModuleRegistry {
    #[instrument(skip(self, ctx, iq), fields(id = %iq.id))]
    async fn dispatch_iq(
        &self,
        ctx: &Context,
        iq: Iq,
        server_target: bool,
    ) -> Result<bool, XmppError> {
        if let IqType::Result(_) | IqType::Error(_) = iq.payload {
            return Ok(match self.pending.remove(&iq.id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(iq);
                    true
                }
                None => false,
            });
        }

        let Some(ns) = request_payload(&iq).map(|p| p.ns()) else {
            return Ok(false);
        };
        let Some(module) = self.find_module(&ns, server_target) else {
            return Ok(false);
        };

        debug!(module = module.name(), ns = %ns, "Dispatching IQ");
        if let Err(e) = module.process_iq(ctx, &iq).await {
            if e.is_stanza_error() {
                debug!(module = module.name(), error = %e, "IQ rejected");
            } else {
                error!(module = module.name(), error = %e, "IQ processing failed");
            }
            self.router
                .must_route(ctx, Stanza::Iq(iq_error(&iq, &e)))
                .await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentHub;
    use crate::config::ResourceConflict;
    use crate::hosts::HostRegistry;
    use crate::registry::{C2sSession, Outbound, SessionTable};
    use crate::stanza::iq_result;
    use crate::storage::InMemoryRepository;
    use minidom::Element;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn server_features(&self) -> Vec<String> {
            vec!["urn:test:echo".to_string()]
        }

        fn matches_namespace(&self, ns: &str, server_target: bool) -> bool {
            ns == "urn:test:echo" && server_target
        }

        async fn process_iq(&self, _ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
            match request_payload(iq).and_then(|p| p.attr("fail")) {
                Some(_) => Err(XmppError::not_allowed(None)),
                None => Ok(()),
            }
        }
    }

    fn setup() -> (Arc<ModuleRegistry>, Arc<Router>, mpsc::Receiver<Outbound>) {
        let sessions = Arc::new(SessionTable::new());
        let router = Arc::new(Router::new(
            Arc::new(HostRegistry::new(["jackal.im"])),
            Arc::clone(&sessions),
            Arc::new(ComponentHub::new(Duration::from_secs(1))),
            Arc::new(InMemoryRepository::new()),
        ));
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&router)));
        registry.register(Arc::new(Echo));
        let weak: std::sync::Weak<dyn IqDispatcher> =
            Arc::downgrade(&(registry.clone() as Arc<dyn IqDispatcher>));
        router.set_iq_dispatcher(weak);

        let (tx, rx) = mpsc::channel(8);
        let session = C2sSession::new(
            "ortuman@jackal.im/balcony".parse().unwrap(),
            tx,
            &Context::background(),
        );
        sessions
            .bind(Arc::new(session), ResourceConflict::Replace)
            .unwrap();
        (registry, router, rx)
    }

    fn echo_iq(fail: bool) -> Iq {
        let mut payload = Element::builder("echo", "urn:test:echo");
        if fail {
            payload = payload.attr("fail", "yes");
        }
        Iq {
            from: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            to: Some("jackal.im".parse().unwrap()),
            id: "e1".to_string(),
            payload: IqType::Get(payload.build()),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_matching_module() {
        let (registry, _router, _rx) = setup();
        let ctx = Context::background();
        assert!(registry.dispatch_iq(&ctx, echo_iq(false), true).await.unwrap());
        assert!(!registry.dispatch_iq(&ctx, echo_iq(false), false).await.unwrap());
        assert_eq!(registry.server_features(), vec!["urn:test:echo".to_string()]);
    }

    #[tokio::test]
    async fn test_module_error_becomes_iq_error() {
        let (registry, _router, mut rx) = setup();
        let ctx = Context::background();
        assert!(registry.dispatch_iq(&ctx, echo_iq(true), true).await.unwrap());
        match rx.try_recv() {
            Ok(Outbound::Stanza(Stanza::Iq(reply))) => {
                assert!(matches!(reply.payload, IqType::Error(_)))
            }
            other => panic!("expected iq error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_request_receives_response() {
        let (registry, _router, mut rx) = setup();
        let ctx = Context::background();
        let request = Iq {
            from: Some("jackal.im".parse().unwrap()),
            to: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            id: String::new(),
            payload: IqType::Get(Element::builder("query", crate::ns::DISCO_INFO).build()),
        };

        let waiter = {
            let registry = Arc::clone(&registry);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                registry
                    .send_iq_request(&ctx, request, Duration::from_secs(5))
                    .await
            })
        };

        let sent = loop {
            match rx.try_recv() {
                Ok(Outbound::Stanza(Stanza::Iq(iq))) => break iq,
                _ => tokio::task::yield_now().await,
            }
        };
        let response = iq_result(&sent, None);
        assert!(registry.dispatch_iq(&ctx, response, true).await.unwrap());

        let answered = waiter.await.unwrap();
        tokio_test::assert_ok!(&answered);
        assert_eq!(answered.unwrap().id, sent.id);
    }
}
