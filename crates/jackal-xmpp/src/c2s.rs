//! Client session boundary.
//!
//! The stream layer authenticates a client and binds a resource; from
//! then on it talks to the core through [`C2sHandler`]: open the session,
//! hand over every stanza the client sends, close the session when the
//! stream ends. Outbound stanzas arrive on the session's channel.

use std::sync::{Arc, Weak};

use chrono::Utc;
use jid::{FullJid, Jid};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::config::ResourceConflict;
use crate::events::{Event, EventBus};
use crate::registry::{C2sSession, Outbound};
use crate::roster::RosterModule;
use crate::routing::{IqDispatcher, Router};
use crate::storage::Repository;
use crate::{Context, Stanza, XmppError};

pub struct C2sHandler {
    resource_conflict: ResourceConflict,
    repository: Arc<dyn Repository>,
    router: Arc<Router>,
    roster: Arc<RosterModule>,
    dispatcher: Weak<dyn IqDispatcher>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for C2sHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("C2sHandler")
            .field("resource_conflict", &self.resource_conflict)
            .finish()
    }
}

impl C2sHandler {
    pub fn new(
        resource_conflict: ResourceConflict,
        repository: Arc<dyn Repository>,
        router: Arc<Router>,
        roster: Arc<RosterModule>,
        dispatcher: Weak<dyn IqDispatcher>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            resource_conflict,
            repository,
            router,
            roster,
            dispatcher,
            events,
        }
    }

    /// Bind an authenticated stream to `jid`.
    ///
    /// Stanzas for the session are written to `sender`. Fails with a
    /// `conflict` when the resource is taken and the policy keeps the
    /// existing session.
    #[instrument(skip(self, ctx, sender), fields(jid = %jid))]
    pub async fn open_session(
        &self,
        ctx: &Context,
        jid: FullJid,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<Arc<C2sSession>, XmppError> {
        let session = Arc::new(C2sSession::new(jid, sender, ctx));
        if let Some(displaced) = self
            .router
            .sessions()
            .bind(Arc::clone(&session), self.resource_conflict)?
        {
            debug!(displaced = %displaced.id(), "Replaced existing session");
            self.events
                .publish(
                    ctx,
                    Event::SessionUnbound {
                        session_id: displaced.id().to_string(),
                        jid: displaced.jid().clone(),
                    },
                )
                .await;
        }
        info!(session = %session.id(), "Session established");

        self.events
            .publish(
                ctx,
                Event::SessionBound {
                    session_id: session.id().to_string(),
                    jid: session.jid().clone(),
                },
            )
            .await;
        Ok(session)
    }

    /// Tear down `session` after its stream ended.
    ///
    /// An available session first broadcasts unavailable presence carrying
    /// `status`, which is also recorded as the account's logout status.
    #[instrument(skip(self, ctx, session), fields(jid = %session.jid()))]
    pub async fn close_session(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        status: Option<String>,
    ) -> Result<(), XmppError> {
        if session.is_available() {
            let mut unavailable = Presence::new(PresenceType::Unavailable);
            if let Some(text) = &status {
                unavailable.set_status(String::new(), text.clone());
            }
            if let Err(e) = self.roster.process_presence(ctx, session, unavailable).await {
                warn!(error = %e, "Failed to broadcast unavailable presence");
            }
        }

        if let Some(mut user) = self.repository.fetch_user(session.username()).await? {
            user.logout_time = Some(Utc::now());
            user.logout_status = status;
            self.repository.upsert_user(&user).await?;
        }

        if self.router.sessions().unbind(session) {
            self.events
                .publish(
                    ctx,
                    Event::SessionUnbound {
                        session_id: session.id().to_string(),
                        jid: session.jid().clone(),
                    },
                )
                .await;
        }
        session.lifetime().cancel();
        info!("Session closed");
        Ok(())
    }

    /// Handle a stanza sent by the client of `session`.
    ///
    /// Routing failures are answered with a stanza error to the sender;
    /// only internal failures are returned.
    #[instrument(skip(self, ctx, session, stanza), fields(jid = %session.jid(), stanza = stanza.name()))]
    pub async fn process(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        mut stanza: Stanza,
    ) -> Result<(), XmppError> {
        stanza.set_from(Some(session.address()));

        let outcome = match stanza.clone() {
            Stanza::Iq(iq) => self.process_iq(ctx, session, iq).await,
            Stanza::Presence(presence) => self.process_presence(ctx, session, presence).await,
            Stanza::Message(_) => self.router.route(ctx, stanza.clone()).await,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(XmppError::Canceled) => Ok(()),
            Err(e) if e.is_stanza_error() || matches!(e, XmppError::Timeout(_)) => {
                debug!(error = %e, "Stanza rejected");
                if let Some(mut reply) = stanza.error_reply(&e) {
                    reply.set_to(Some(session.address()));
                    session.send(reply)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn process_iq(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        mut iq: Iq,
    ) -> Result<(), XmppError> {
        let account = Jid::from(session.bare_jid());
        let to = iq.to.get_or_insert_with(|| account.clone()).clone();

        // Answers to requests the server sent on the account's behalf.
        if matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) && to == account {
            if let Some(dispatcher) = self.dispatcher.upgrade() {
                if !dispatcher.dispatch_iq(ctx, iq, false).await? {
                    debug!("Dropping unsolicited IQ response");
                }
            }
            return Ok(());
        }
        self.router.route(ctx, Stanza::Iq(iq)).await
    }

    async fn process_presence(
        &self,
        ctx: &Context,
        session: &Arc<C2sSession>,
        presence: Presence,
    ) -> Result<(), XmppError> {
        let handled_by_roster = presence.to.is_none()
            || matches!(
                presence.type_,
                PresenceType::Subscribe
                    | PresenceType::Subscribed
                    | PresenceType::Unsubscribe
                    | PresenceType::Unsubscribed
                    | PresenceType::Probe
            );
        if handled_by_roster {
            self.roster.process_presence(ctx, session, presence).await
        } else {
            self.router.route(ctx, Stanza::Presence(presence)).await
        }
    }
}
