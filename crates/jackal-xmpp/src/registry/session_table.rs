//! Session table implementation.
//!
//! Authoritative map from addresses to live authenticated sessions. It is
//! also the presence cache: each session keeps the last presence its client
//! broadcast.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jid::{BareJid, FullJid, Jid};
use tracing::{debug, info, instrument};
use xmpp_parsers::presence::Presence;

use super::session::C2sSession;
use crate::address::matches_pattern;
use crate::config::ResourceConflict;
use crate::error::stream_errors;
use crate::XmppError;

/// Registry for tracking bound sessions.
///
/// Sessions are grouped by bare JID; at most one session exists per full
/// JID. Writers take the exclusive lock; lookups take the shared lock and
/// return cloned handles, so no session is ever called with the lock held.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<BareJid, Vec<Arc<C2sSession>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        info!("Creating session table");
        Self::default()
    }

    /// Bind `session`, resolving a resource collision with `policy`.
    ///
    /// Returns the session displaced under the `replace` policy. The
    /// displaced session has already been sent a `conflict` stream error.
    #[instrument(skip(self, session), fields(jid = %session.jid()))]
    pub fn bind(
        &self,
        session: Arc<C2sSession>,
        policy: ResourceConflict,
    ) -> Result<Option<Arc<C2sSession>>, XmppError> {
        let displaced = {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| XmppError::internal("session table lock poisoned"))?;
            let entries = sessions.entry(session.bare_jid()).or_default();

            match entries.iter().position(|s| s.jid() == session.jid()) {
                None => {
                    entries.push(Arc::clone(&session));
                    None
                }
                Some(index) => match policy {
                    ResourceConflict::Override => {
                        debug!("Resource already bound, keeping existing session");
                        return Err(XmppError::conflict(Some(
                            "Resource already bound".to_string(),
                        )));
                    }
                    ResourceConflict::Reject => {
                        debug!("Resource already bound, rejecting new session");
                        drop(sessions);
                        session.disconnect(Some(stream_errors::POLICY_VIOLATION));
                        return Err(XmppError::ResourceConflict(session.jid().to_string()));
                    }
                    ResourceConflict::Replace => {
                        Some(std::mem::replace(&mut entries[index], Arc::clone(&session)))
                    }
                },
            }
        };

        if let Some(old) = &displaced {
            debug!(old_session = old.id(), "Replacing existing session");
            old.disconnect(Some(stream_errors::CONFLICT));
        } else {
            debug!("Session bound");
        }
        Ok(displaced)
    }

    /// Remove `session`. Returns `false` when it was not bound, including
    /// when another session has since taken over its resource.
    #[instrument(skip(self, session), fields(jid = %session.jid()))]
    pub fn unbind(&self, session: &C2sSession) -> bool {
        let Ok(mut sessions) = self.sessions.write() else {
            return false;
        };
        let bare = session.bare_jid();
        let Some(entries) = sessions.get_mut(&bare) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|s| s.id() != session.id());
        let removed = entries.len() != before;
        if entries.is_empty() {
            sessions.remove(&bare);
        }
        debug!(removed, "Session unbound");
        removed
    }

    /// Sessions whose JID matches `jid` with the mask implied by its shape.
    pub fn streams_matching(&self, jid: &Jid) -> Vec<Arc<C2sSession>> {
        let Ok(sessions) = self.sessions.read() else {
            return Vec::new();
        };
        match jid.node() {
            Some(_) => sessions
                .get(&jid.to_bare())
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|s| matches_pattern(jid, &s.address()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            None => sessions
                .values()
                .flatten()
                .filter(|s| matches_pattern(jid, &s.address()))
                .cloned()
                .collect(),
        }
    }

    pub fn session(&self, jid: &FullJid) -> Option<Arc<C2sSession>> {
        let sessions = self.sessions.read().ok()?;
        sessions
            .get(&jid.to_bare())?
            .iter()
            .find(|s| s.jid() == jid)
            .cloned()
    }

    /// Every bound session of `bare`.
    pub fn sessions_for(&self, bare: &BareJid) -> Vec<Arc<C2sSession>> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(bare).cloned())
            .unwrap_or_default()
    }

    pub fn is_online(&self, bare: &BareJid) -> bool {
        self.sessions
            .read()
            .map(|sessions| sessions.contains_key(bare))
            .unwrap_or(false)
    }

    pub fn set_presence(&self, session: &C2sSession, presence: Presence) {
        session.set_presence(presence);
    }

    pub fn presence(&self, session: &C2sSession) -> Option<Presence> {
        session.presence()
    }

    /// Cached available presences of the sessions matching `jid`, each
    /// stamped with its session's full JID.
    pub fn online_presences_matching(&self, jid: &Jid) -> Vec<Presence> {
        self.streams_matching(jid)
            .into_iter()
            .filter(|s| s.is_available())
            .filter_map(|s| {
                let mut presence = s.presence()?;
                presence.from = Some(s.address());
                Some(presence)
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .map(|sessions| sessions.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Every bound session, used on shutdown.
    pub fn all_sessions(&self) -> Vec<Arc<C2sSession>> {
        self.sessions
            .read()
            .map(|sessions| sessions.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::Context;
    use tokio::sync::mpsc;
    use xmpp_parsers::presence::Type as PresenceType;

    fn session(jid: &str) -> (Arc<C2sSession>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let session = C2sSession::new(jid.parse().unwrap(), tx, &Context::background());
        (Arc::new(session), rx)
    }

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_streams_matching_by_shape() {
        let table = SessionTable::new();
        let (balcony, _rx1) = session("ortuman@jackal.im/balcony");
        let (yard, _rx2) = session("ortuman@jackal.im/yard");
        let (jail, _rx3) = session("romeo@jackal.im/jail");
        for s in [&balcony, &yard, &jail] {
            table.bind(Arc::clone(s), ResourceConflict::Replace).unwrap();
        }

        assert_eq!(table.streams_matching(&jid("ortuman@jackal.im/yard")).len(), 1);
        assert_eq!(table.streams_matching(&jid("ortuman@jackal.im")).len(), 2);
        assert_eq!(table.streams_matching(&jid("jackal.im/jail")).len(), 1);
        assert_eq!(table.streams_matching(&jid("jackal.im")).len(), 3);
        assert!(table.streams_matching(&jid("noelia@jackal.im")).is_empty());
        assert_eq!(table.session_count(), 3);
    }

    #[test]
    fn test_replace_disconnects_old_session() {
        let table = SessionTable::new();
        let (s1, mut rx1) = session("u@d/r");
        let (s2, _rx2) = session("u@d/r");

        table.bind(Arc::clone(&s1), ResourceConflict::Replace).unwrap();
        let displaced = table
            .bind(Arc::clone(&s2), ResourceConflict::Replace)
            .unwrap()
            .expect("displaced session");
        assert_eq!(displaced.id(), s1.id());

        match rx1.try_recv() {
            Ok(Outbound::Close(Some(condition))) => assert_eq!(condition, "conflict"),
            other => panic!("expected close, got {:?}", other),
        }
        let matching = table.streams_matching(&jid("u@d/r"));
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id(), s2.id());

        // The displaced session's own cleanup must not remove its successor.
        assert!(!table.unbind(&s1));
        assert_eq!(table.session_count(), 1);
    }

    #[test]
    fn test_override_keeps_existing_session() {
        let table = SessionTable::new();
        let (s1, _rx1) = session("u@d/r");
        let (s2, _rx2) = session("u@d/r");
        table.bind(Arc::clone(&s1), ResourceConflict::Override).unwrap();

        let err = table.bind(s2, ResourceConflict::Override).unwrap_err();
        assert_eq!(err.condition(), Some(crate::StanzaErrorCondition::Conflict));
        assert_eq!(table.streams_matching(&jid("u@d/r"))[0].id(), s1.id());
    }

    #[test]
    fn test_reject_closes_new_session() {
        let table = SessionTable::new();
        let (s1, _rx1) = session("u@d/r");
        let (s2, mut rx2) = session("u@d/r");
        table.bind(Arc::clone(&s1), ResourceConflict::Reject).unwrap();

        assert!(table.bind(Arc::clone(&s2), ResourceConflict::Reject).is_err());
        match rx2.try_recv() {
            Ok(Outbound::Close(Some(condition))) => assert_eq!(condition, "policy-violation"),
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(table.streams_matching(&jid("u@d/r"))[0].id(), s1.id());
    }

    #[test]
    fn test_online_presences_only_lists_available_sessions() {
        let table = SessionTable::new();
        let (balcony, _rx1) = session("ortuman@jackal.im/balcony");
        let (yard, _rx2) = session("ortuman@jackal.im/yard");
        table.bind(Arc::clone(&balcony), ResourceConflict::Replace).unwrap();
        table.bind(Arc::clone(&yard), ResourceConflict::Replace).unwrap();

        table.set_presence(&balcony, Presence::new(PresenceType::None));
        table.set_presence(&yard, Presence::new(PresenceType::Unavailable));

        let online = table.online_presences_matching(&jid("ortuman@jackal.im"));
        assert_eq!(online.len(), 1);
        assert_eq!(
            online[0].from.as_ref().map(|j| j.to_string()).as_deref(),
            Some("ortuman@jackal.im/balcony")
        );
    }

    #[test]
    fn test_unbind_absent_is_silent() {
        let table = SessionTable::new();
        let (s1, _rx1) = session("u@d/r");
        assert!(!table.unbind(&s1));
        table.bind(Arc::clone(&s1), ResourceConflict::Replace).unwrap();
        assert!(table.unbind(&s1));
        assert!(!table.is_online(&"u@d".parse().unwrap()));
    }
}
