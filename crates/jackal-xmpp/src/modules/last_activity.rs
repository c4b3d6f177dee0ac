//! XEP-0012: Last Activity
//!
//! ```xml
//! <iq type='get' to='noelia@jackal.im' id='last1'>
//!   <query xmlns='jabber:iq:last'/>
//! </iq>
//!
//! <iq type='result' from='noelia@jackal.im' id='last1'>
//!   <query xmlns='jabber:iq:last' seconds='903'>Heading Home</query>
//! </iq>
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};

use super::Module;
use crate::routing::Router;
use crate::stanza::iq_result;
use crate::storage::Repository;
use crate::{ns, Context, Stanza, XmppError};

pub struct LastActivityModule {
    started_at: Instant,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
}

impl std::fmt::Debug for LastActivityModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastActivityModule")
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

fn query(seconds: u64, status: Option<&str>) -> Element {
    let mut builder =
        Element::builder("query", ns::LAST_ACTIVITY).attr("seconds", seconds.to_string());
    if let Some(status) = status {
        builder = builder.append(status.to_string());
    }
    builder.build()
}

impl LastActivityModule {
    pub fn new(repository: Arc<dyn Repository>, router: Arc<Router>) -> Self {
        Self {
            started_at: Instant::now(),
            repository,
            router,
        }
    }

    async fn account_activity(&self, requester: &Jid, target: &BareJid) -> Result<Element, XmppError> {
        let Some(username) = target.node().map(|n| n.to_string()) else {
            return Err(XmppError::bad_request(None));
        };

        if requester.to_bare() != *target {
            let requester_name = requester
                .node()
                .filter(|_| self.router.hosts().is_local_jid(requester))
                .ok_or_else(|| XmppError::forbidden(None))?;
            let item = self
                .repository
                .fetch_roster_item(requester_name.as_str(), target)
                .await?;
            if !item.is_some_and(|item| item.receives_presence()) {
                return Err(XmppError::forbidden(None));
            }
        }

        let Some(user) = self.repository.fetch_user(&username).await? else {
            return Err(XmppError::item_not_found(None));
        };
        if self.router.sessions().is_online(target) {
            return Ok(query(0, None));
        }

        let seconds = user
            .logout_time
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        debug!(target = %target, seconds, "Last activity");
        Ok(query(seconds, user.logout_status.as_deref()))
    }
}

#[async_trait]
impl Module for LastActivityModule {
    fn name(&self) -> &'static str {
        "last_activity"
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::LAST_ACTIVITY.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::LAST_ACTIVITY.to_string()]
    }

    fn matches_namespace(&self, ns: &str, _server_target: bool) -> bool {
        ns == ns::LAST_ACTIVITY
    }

    async fn process_iq(&self, ctx: &Context, iq: &Iq) -> Result<(), XmppError> {
        if !matches!(iq.payload, IqType::Get(_)) {
            return Err(XmppError::bad_request(None));
        }
        let requester = iq.from.as_ref().ok_or_else(|| XmppError::bad_request(None))?;
        let payload = match &iq.to {
            Some(to) if to.node().is_some() => {
                self.account_activity(requester, &to.to_bare()).await?
            }
            _ => query(self.started_at.elapsed().as_secs(), None),
        };
        self.router
            .route(ctx, Stanza::Iq(iq_result(iq, Some(payload))))
            .await
    }
}
