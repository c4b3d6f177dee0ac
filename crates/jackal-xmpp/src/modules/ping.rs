//! XEP-0199: XMPP Ping

use std::sync::Arc;

use async_trait::async_trait;
use xmpp_parsers::iq::{Iq, IqType};

use super::Module;
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::{ns, Context, Stanza, XmppError};

#[derive(Debug)]
pub struct PingModule {
    router: Arc<Router>,
}

impl PingModule {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    fn matches_namespace(&self, ns: &str, _server_target: bool) -> bool {
        ns == ns::PING
    }

    async fn process_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        match &iq.payload {
            IqType::Get(ping) if ping.is("ping", ns::PING) => {
                self.router
                    .route(ctx, Stanza::Iq(iq_result(iq, None)))
                    .await
            }
            _ => Err(XmppError::bad_request(None)),
        }
    }
}
