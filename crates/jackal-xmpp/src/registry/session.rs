//! A bound client session as seen by the core.

use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use jid::{BareJid, FullJid, Jid};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::{Context, Stanza, XmppError};

/// Session flag: the client fetched its roster, so it receives roster pushes.
pub const ROSTER_REQUESTED: &str = "roster:requested";
/// Session flag: the client read its blocklist, so it receives block pushes.
pub const BLOCKLIST_REQUESTED: &str = "blocklist:requested";
/// Session flag: the initial available presence was already processed.
pub const INITIAL_PRESENCE_SENT: &str = "presence:initial";

/// Item written to a session's outbound channel.
///
/// The stream task owning the channel serializes stanzas to the wire and
/// closes the stream when it reads `Close`.
#[derive(Debug, Clone)]
pub enum Outbound {
    Stanza(Stanza),
    /// Close the stream, with the given stream error condition if any.
    Close(Option<String>),
}

pub struct C2sSession {
    id: String,
    jid: FullJid,
    presence: RwLock<Option<Presence>>,
    flags: RwLock<HashSet<String>>,
    sender: mpsc::Sender<Outbound>,
    lifetime: Context,
}

impl fmt::Debug for C2sSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("C2sSession")
            .field("id", &self.id)
            .field("jid", &self.jid)
            .field("available", &self.is_available())
            .finish()
    }
}

impl C2sSession {
    /// Create a session for an authenticated stream bound to `jid`.
    ///
    /// The session's lifetime context is a child of `parent`; it is
    /// cancelled when the session is disconnected.
    pub fn new(jid: FullJid, sender: mpsc::Sender<Outbound>, parent: &Context) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            jid,
            presence: RwLock::new(None),
            flags: RwLock::new(HashSet::new()),
            sender,
            lifetime: parent.child(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    pub fn bare_jid(&self) -> BareJid {
        self.jid.to_bare()
    }

    pub fn username(&self) -> &str {
        self.jid.node().map(|n| n.as_str()).unwrap_or_default()
    }

    /// Context cancelled when the session goes away.
    pub fn lifetime(&self) -> &Context {
        &self.lifetime
    }

    pub fn presence(&self) -> Option<Presence> {
        self.presence.read().ok().and_then(|p| p.clone())
    }

    pub fn set_presence(&self, presence: Presence) {
        if let Ok(mut guard) = self.presence.write() {
            *guard = Some(presence);
        }
    }

    /// Whether the last broadcast presence was available.
    pub fn is_available(&self) -> bool {
        self.presence
            .read()
            .map(|p| matches!(p.as_ref(), Some(p) if p.type_ == PresenceType::None))
            .unwrap_or(false)
    }

    pub fn set_flag(&self, flag: &str) {
        if let Ok(mut flags) = self.flags.write() {
            flags.insert(flag.to_string());
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags
            .read()
            .map(|flags| flags.contains(flag))
            .unwrap_or(false)
    }

    /// Set `flag` and report whether it was already set.
    pub fn test_and_set_flag(&self, flag: &str) -> bool {
        self.flags
            .write()
            .map(|mut flags| !flags.insert(flag.to_string()))
            .unwrap_or(true)
    }

    /// Queue a stanza for delivery to the client.
    ///
    /// Fails with `resource-constraint` when the outbound queue is full. A
    /// closed channel means the stream is going away and the stanza is
    /// dropped.
    pub fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        match self.sender.try_send(Outbound::Stanza(stanza)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(jid = %self.jid, "Outbound channel full");
                Err(XmppError::resource_constraint(Some(
                    "Recipient outbound queue is full".to_string(),
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(jid = %self.jid, "Outbound channel closed, dropping stanza");
                Ok(())
            }
        }
    }

    /// Ask the stream to close and cancel the session's lifetime context.
    pub fn disconnect(&self, condition: Option<&str>) {
        debug!(jid = %self.jid, condition = ?condition, "Disconnecting session");
        let _ = self
            .sender
            .try_send(Outbound::Close(condition.map(str::to_string)));
        self.lifetime.cancel();
    }

    /// The session's full JID as a routable address.
    pub fn address(&self) -> Jid {
        Jid::from(self.jid.clone())
    }
}
