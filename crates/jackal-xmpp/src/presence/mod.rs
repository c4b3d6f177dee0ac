//! Presence handling.
//!
//! Classifies presence stanzas sent by local clients and builds the
//! presences the server emits on their behalf. The RFC 6121 subscription
//! state machine lives in [`subscription`].

pub mod subscription;

pub use subscription::{SubscribeDisposition, Transition};

use jid::{BareJid, Jid};
use tracing::debug;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::XmppError;

/// Presence subscription stanza type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Request to subscribe to another user's presence.
    Subscribe,
    /// Approval of a subscription request.
    Subscribed,
    /// Request to unsubscribe from another user's presence.
    Unsubscribe,
    /// Notification that a subscription has been revoked or denied.
    Unsubscribed,
}

impl SubscriptionType {
    pub fn from_presence_type(ptype: &PresenceType) -> Option<Self> {
        match ptype {
            PresenceType::Subscribe => Some(SubscriptionType::Subscribe),
            PresenceType::Subscribed => Some(SubscriptionType::Subscribed),
            PresenceType::Unsubscribe => Some(SubscriptionType::Unsubscribe),
            PresenceType::Unsubscribed => Some(SubscriptionType::Unsubscribed),
            _ => None,
        }
    }

    pub fn to_presence_type(&self) -> PresenceType {
        match self {
            SubscriptionType::Subscribe => PresenceType::Subscribe,
            SubscriptionType::Subscribed => PresenceType::Subscribed,
            SubscriptionType::Unsubscribe => PresenceType::Unsubscribe,
            SubscriptionType::Unsubscribed => PresenceType::Unsubscribed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Subscribe => "subscribe",
            SubscriptionType::Subscribed => "subscribed",
            SubscriptionType::Unsubscribe => "unsubscribe",
            SubscriptionType::Unsubscribed => "unsubscribed",
        }
    }
}

/// What a presence sent by a local client asks the server to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceAction {
    /// Subscription control towards `to`.
    Subscription {
        kind: SubscriptionType,
        to: BareJid,
    },
    /// Presence probe about `to`.
    Probe { to: BareJid },
    /// Available or unavailable presence without `to`, broadcast to the
    /// roster.
    Broadcast,
    /// Any other presence addressed to a specific entity; routed as is.
    Directed,
}

/// Classify a presence sent by a local client.
pub fn parse_presence(presence: &Presence) -> Result<PresenceAction, XmppError> {
    if let Some(kind) = SubscriptionType::from_presence_type(&presence.type_) {
        let to = presence.to.as_ref().ok_or_else(|| {
            XmppError::bad_request(Some(
                "Subscription presence must have 'to' attribute".to_string(),
            ))
        })?;
        let to = to.to_bare();
        debug!(kind = kind.as_str(), to = %to, "Parsed subscription presence");
        return Ok(PresenceAction::Subscription { kind, to });
    }

    match (&presence.type_, presence.to.as_ref()) {
        (PresenceType::Probe, Some(to)) => Ok(PresenceAction::Probe { to: to.to_bare() }),
        (PresenceType::Probe, None) => Err(XmppError::bad_request(Some(
            "Probe presence must have 'to' attribute".to_string(),
        ))),
        (PresenceType::None | PresenceType::Unavailable, None) => Ok(PresenceAction::Broadcast),
        _ => Ok(PresenceAction::Directed),
    }
}

/// Build a subscription presence stamped with bare addresses.
pub fn build_subscription_presence(
    subscription_type: SubscriptionType,
    from: &BareJid,
    to: &BareJid,
    status: Option<&str>,
) -> Presence {
    let mut pres = Presence::new(subscription_type.to_presence_type());
    pres.from = Some(Jid::from(from.clone()));
    pres.to = Some(Jid::from(to.clone()));

    if let Some(status_text) = status {
        pres.statuses.insert(String::new(), status_text.to_string());
    }

    pres
}

pub fn build_unavailable_presence(from: Jid, to: Jid) -> Presence {
    let mut pres = Presence::new(PresenceType::Unavailable);
    pres.from = Some(from);
    pres.to = Some(to);
    pres
}

pub fn build_probe(from: &BareJid, to: &BareJid) -> Presence {
    let mut pres = Presence::new(PresenceType::Probe);
    pres.from = Some(Jid::from(from.clone()));
    pres.to = Some(Jid::from(to.clone()));
    pres
}

/// Whether `presence` announces availability.
pub fn is_available(presence: &Presence) -> bool {
    presence.type_ == PresenceType::None
}
