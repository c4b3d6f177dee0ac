//! Internal services addressable by their own host (e.g. `pubsub.jackal.im`).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::{Context, Stanza, XmppError};

#[async_trait]
pub trait Component: Send + Sync {
    /// The domain this component answers for.
    fn host(&self) -> &str;

    async fn start(&self, ctx: &Context) -> Result<(), XmppError>;

    async fn stop(&self, ctx: &Context) -> Result<(), XmppError>;

    /// Handle a stanza addressed to [`Component::host`].
    async fn process(&self, ctx: &Context, stanza: Stanza) -> Result<(), XmppError>;
}

/// Registry `host -> component`.
pub struct ComponentHub {
    components: RwLock<HashMap<String, Arc<dyn Component>>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for ComponentHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHub")
            .field("hosts", &self.hosts())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl ComponentHub {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            stop_timeout,
        }
    }

    /// Register and start `component`.
    ///
    /// Registering the same component twice is a no-op; registering a
    /// different component for an already taken host is a configuration
    /// error.
    #[instrument(skip(self, ctx, component), fields(host = %component.host()))]
    pub async fn register(
        &self,
        ctx: &Context,
        component: Arc<dyn Component>,
    ) -> Result<(), XmppError> {
        let host = component.host().to_lowercase();
        {
            let mut components = self
                .components
                .write()
                .map_err(|_| XmppError::internal("component table lock poisoned"))?;
            match components.get(&host) {
                Some(existing) if Arc::ptr_eq(existing, &component) => return Ok(()),
                Some(_) => {
                    return Err(XmppError::config(format!(
                        "component host already registered: {}",
                        host
                    )))
                }
                None => {
                    components.insert(host.clone(), Arc::clone(&component));
                }
            }
        }

        if let Err(e) = component.start(ctx).await {
            if let Ok(mut components) = self.components.write() {
                components.remove(&host);
            }
            return Err(e);
        }
        info!("Component registered");
        Ok(())
    }

    /// Unregister the component for `host` and stop it.
    ///
    /// A component that does not stop within the configured timeout is
    /// abandoned. Returns `false` if no component was registered.
    #[instrument(skip(self, ctx))]
    pub async fn unregister(&self, ctx: &Context, host: &str) -> bool {
        let removed = self
            .components
            .write()
            .ok()
            .and_then(|mut components| components.remove(&host.to_lowercase()));
        let Some(component) = removed else {
            return false;
        };

        let stop_ctx = ctx.with_timeout(self.stop_timeout);
        match stop_ctx.run(component.stop(&stop_ctx)).await {
            Ok(()) => info!("Component stopped"),
            Err(XmppError::Timeout(_)) => {
                warn!(timeout = ?self.stop_timeout, "Component did not stop in time, abandoning")
            }
            Err(e) => warn!(error = %e, "Component stop failed"),
        }
        true
    }

    pub fn component(&self, host: &str) -> Option<Arc<dyn Component>> {
        self.components
            .read()
            .ok()
            .and_then(|components| components.get(&host.to_lowercase()).cloned())
    }

    pub fn is_component_host(&self, host: &str) -> bool {
        self.component(host).is_some()
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .components
            .read()
            .map(|components| components.keys().cloned().collect())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }

    /// Unregister every component.
    pub async fn stop_all(&self, ctx: &Context) {
        for host in self.hosts() {
            self.unregister(ctx, &host).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        host: String,
        started: AtomicUsize,
        stop_delay: Duration,
    }

    impl Echo {
        fn new(host: &str, stop_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                host: host.to_string(),
                started: AtomicUsize::new(0),
                stop_delay,
            })
        }
    }

    #[async_trait]
    impl Component for Echo {
        fn host(&self) -> &str {
            &self.host
        }

        async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), XmppError> {
            tokio::time::sleep(self.stop_delay).await;
            Ok(())
        }

        async fn process(&self, _ctx: &Context, _stanza: Stanza) -> Result<(), XmppError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_same_component() {
        let hub = ComponentHub::new(Duration::from_secs(1));
        let ctx = Context::background();
        let echo = Echo::new("echo.jackal.im", Duration::ZERO);

        hub.register(&ctx, echo.clone()).await.unwrap();
        hub.register(&ctx, echo.clone()).await.unwrap();
        assert_eq!(echo.started.load(Ordering::SeqCst), 1);
        assert_eq!(hub.hosts(), vec!["echo.jackal.im".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_host_is_config_error() {
        let hub = ComponentHub::new(Duration::from_secs(1));
        let ctx = Context::background();
        hub.register(&ctx, Echo::new("echo.jackal.im", Duration::ZERO))
            .await
            .unwrap();

        let err = hub
            .register(&ctx, Echo::new("echo.jackal.im", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, XmppError::Config(_)));
    }

    #[tokio::test]
    async fn test_slow_component_is_abandoned_on_unregister() {
        let hub = ComponentHub::new(Duration::from_millis(20));
        let ctx = Context::background();
        hub.register(&ctx, Echo::new("slow.jackal.im", Duration::from_secs(30)))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(hub.unregister(&ctx, "slow.jackal.im").await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!hub.is_component_host("slow.jackal.im"));
        assert!(!hub.unregister(&ctx, "slow.jackal.im").await);
    }
}
