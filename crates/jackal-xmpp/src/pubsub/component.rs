//! Component answering for a pubsub domain.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, error, info};
use xmpp_parsers::iq::{Iq, IqType};

use super::service::PubSubService;
use super::stanzas::is_pubsub_iq;
use crate::components::Component;
use crate::modules::disco::{build_disco_info, Identity};
use crate::routing::Router;
use crate::stanza::{iq_error, iq_result, request_payload};
use crate::storage::Repository;
use crate::{ns, Context, Stanza, XmppError};

pub struct PubSubComponent {
    host: String,
    service: Arc<PubSubService>,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
}

impl std::fmt::Debug for PubSubComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubComponent")
            .field("host", &self.host)
            .finish()
    }
}

impl PubSubComponent {
    pub fn new(
        host: impl Into<String>,
        service: Arc<PubSubService>,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            host: host.into(),
            service,
            repository,
            router,
        }
    }

    async fn disco_info(&self, node: Option<&str>) -> Result<Element, XmppError> {
        match node {
            None => Ok(build_disco_info(
                None,
                &[Identity::pubsub_service()],
                &self.service.disco_features(),
            )),
            Some(name) => {
                if !self.repository.node_exists(&self.host, name).await? {
                    return Err(XmppError::item_not_found(None));
                }
                Ok(build_disco_info(
                    Some(name),
                    &[Identity::new("pubsub", "leaf", None)],
                    &[ns::PUBSUB.to_string()],
                ))
            }
        }
    }

    /// Nodes hosted here, or the item ids of one node.
    async fn disco_items(&self, node: Option<&str>) -> Result<Element, XmppError> {
        let mut query = Element::builder("query", ns::DISCO_ITEMS);
        match node {
            None => {
                for node in self.repository.fetch_nodes(&self.host).await? {
                    let mut item = Element::builder("item", ns::DISCO_ITEMS)
                        .attr("jid", &self.host)
                        .attr("node", &node.name);
                    if !node.options.title.is_empty() {
                        item = item.attr("name", &node.options.title);
                    }
                    query = query.append(item.build());
                }
            }
            Some(name) => {
                if !self.repository.node_exists(&self.host, name).await? {
                    return Err(XmppError::item_not_found(None));
                }
                query = query.attr("node", name);
                for item in self.repository.fetch_items(&self.host, name).await? {
                    query = query.append(
                        Element::builder("item", ns::DISCO_ITEMS)
                            .attr("jid", &self.host)
                            .attr("name", &item.id)
                            .build(),
                    );
                }
            }
        }
        Ok(query.build())
    }

    async fn handle_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        let Some(payload) = request_payload(iq) else {
            return Err(XmppError::bad_request(None));
        };

        if is_pubsub_iq(iq) {
            return self.service.process_iq(ctx, &self.host, iq).await;
        }

        let node = payload.attr("node");
        let reply = match &iq.payload {
            IqType::Get(_) if payload.is("query", ns::DISCO_INFO) => self.disco_info(node).await?,
            IqType::Get(_) if payload.is("query", ns::DISCO_ITEMS) => self.disco_items(node).await?,
            _ => return Err(XmppError::service_unavailable(None)),
        };
        self.router
            .route(ctx, Stanza::Iq(iq_result(iq, Some(reply))))
            .await
    }
}

#[async_trait]
impl Component for PubSubComponent {
    fn host(&self) -> &str {
        &self.host
    }

    async fn start(&self, _ctx: &Context) -> Result<(), XmppError> {
        info!(host = %self.host, "PubSub component started");
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), XmppError> {
        info!(host = %self.host, "PubSub component stopped");
        Ok(())
    }

    async fn process(&self, ctx: &Context, stanza: Stanza) -> Result<(), XmppError> {
        let Stanza::Iq(iq) = stanza else {
            debug!(host = %self.host, "Ignoring non-IQ stanza");
            return Ok(());
        };
        if !matches!(iq.payload, IqType::Get(_) | IqType::Set(_)) {
            return Ok(());
        }

        if let Err(e) = self.handle_iq(ctx, &iq).await {
            if e.is_stanza_error() {
                debug!(host = %self.host, error = %e, "PubSub request rejected");
            } else {
                error!(host = %self.host, error = %e, "PubSub request failed");
            }
            self.router
                .must_route(ctx, Stanza::Iq(iq_error(&iq, &e)))
                .await;
        }
        Ok(())
    }
}
