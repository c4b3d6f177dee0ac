//! RFC 6121 presence subscription state machine.
//!
//! Each function applies one subscription event to one side's roster item
//! and returns the resulting [`Transition`]. The functions are pure; the
//! roster module persists the updated items, sends roster pushes and routes
//! presences.
//!
//! ## State Transitions
//!
//! On outbound `subscribe` (user side):
//! - none → none (ask), from → from (ask)
//!
//! On inbound `subscribed` (user side, ask pending):
//! - none → to, from → both
//!
//! On outbound `subscribed` (contact side):
//! - none → from, to → both
//!
//! On outbound `unsubscribe` (user side) / inbound `unsubscribed` (user side):
//! - to → none, both → from
//!
//! On inbound `unsubscribe` (contact side) / outbound `unsubscribed`
//! (contact side):
//! - from → none, both → to

use jid::BareJid;
use tracing::debug;

use crate::roster::{RosterItem, Subscription};

/// Outcome of applying a subscription event to one roster item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The item to persist, or `None` when the item is unchanged.
    pub updated: Option<RosterItem>,
    /// Whether the presence continues to its destination.
    pub forward: bool,
}

impl Transition {
    fn absorbed() -> Self {
        Self {
            updated: None,
            forward: false,
        }
    }

    fn forward_unchanged() -> Self {
        Self {
            updated: None,
            forward: true,
        }
    }

    fn changed(current: Option<&RosterItem>, next: RosterItem) -> Self {
        let updated = match current {
            Some(item) if *item == next => None,
            _ => Some(next),
        };
        Self {
            updated,
            forward: true,
        }
    }
}

/// What the contact's server does with an inbound `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeDisposition {
    /// The contact already approved the user; answer `subscribed` on its
    /// behalf.
    AutoApprove,
    /// Store a pending notification and deliver the request.
    Notify,
}

/// The user sends `subscribe` to `contact`.
///
/// A request while `ask` is pending, or towards a contact the user is
/// already subscribed to, is absorbed.
pub fn user_sends_subscribe(
    username: &str,
    contact: &BareJid,
    current: Option<&RosterItem>,
) -> Transition {
    if let Some(item) = current {
        if item.ask || item.receives_presence() {
            debug!(contact = %contact, "Absorbing duplicate subscribe");
            return Transition::absorbed();
        }
    }
    let next = current
        .cloned()
        .unwrap_or_else(|| RosterItem::new(username, contact.clone()))
        .with_ask(true);
    Transition::changed(current, next)
}

/// The user receives `subscribed` from the contact.
///
/// Only an outstanding request is approved; anything else is ignored.
pub fn user_receives_subscribed(current: Option<&RosterItem>) -> Transition {
    let Some(item) = current else {
        return Transition::absorbed();
    };
    if !item.ask {
        return Transition::absorbed();
    }
    let subscription = match item.subscription {
        Subscription::None => Subscription::To,
        Subscription::From => Subscription::Both,
        other => other,
    };
    let next = item.clone().with_subscription(subscription).with_ask(false);
    Transition::changed(current, next)
}

/// The user sends `unsubscribe` to the contact.
pub fn user_sends_unsubscribe(current: Option<&RosterItem>) -> Transition {
    let Some(item) = current else {
        return Transition::forward_unchanged();
    };
    let subscription = match item.subscription {
        Subscription::Both => Subscription::From,
        Subscription::To => Subscription::None,
        other => other,
    };
    let next = item.clone().with_subscription(subscription).with_ask(false);
    Transition::changed(current, next)
}

/// The user receives `unsubscribed` from the contact.
///
/// A pending request is denied: `ask` is cleared and the subscription left
/// alone. Otherwise the user's subscription to the contact is cancelled.
pub fn user_receives_unsubscribed(current: Option<&RosterItem>) -> Transition {
    let Some(item) = current else {
        return Transition::forward_unchanged();
    };
    let next = if item.ask {
        item.clone().with_ask(false)
    } else {
        let subscription = match item.subscription {
            Subscription::Both => Subscription::From,
            Subscription::To => Subscription::None,
            other => other,
        };
        item.clone().with_subscription(subscription)
    };
    Transition::changed(current, next)
}

/// The contact receives `subscribe` from the user.
pub fn contact_receives_subscribe(current: Option<&RosterItem>) -> SubscribeDisposition {
    match current {
        Some(item) if item.sends_presence() => SubscribeDisposition::AutoApprove,
        _ => SubscribeDisposition::Notify,
    }
}

/// The contact sends `subscribed` to the user.
///
/// `approved` tells whether the user actually asked: a pending
/// notification exists or the user's item has `ask` set. Unsolicited
/// approvals are absorbed.
pub fn contact_sends_subscribed(
    contact_username: &str,
    user: &BareJid,
    current: Option<&RosterItem>,
    approved: bool,
) -> Transition {
    if !approved {
        debug!(user = %user, "Absorbing unsolicited subscribed");
        return Transition::absorbed();
    }
    let item = current
        .cloned()
        .unwrap_or_else(|| RosterItem::new(contact_username, user.clone()));
    let subscription = match item.subscription {
        Subscription::None => Subscription::From,
        Subscription::To => Subscription::Both,
        other => other,
    };
    Transition::changed(current, item.with_subscription(subscription))
}

/// The contact receives `unsubscribe` from the user.
pub fn contact_receives_unsubscribe(current: Option<&RosterItem>) -> Transition {
    revoke_outbound(current)
}

/// The contact sends `unsubscribed` to the user.
pub fn contact_sends_unsubscribed(current: Option<&RosterItem>) -> Transition {
    revoke_outbound(current)
}

fn revoke_outbound(current: Option<&RosterItem>) -> Transition {
    let Some(item) = current else {
        return Transition::forward_unchanged();
    };
    let subscription = match item.subscription {
        Subscription::Both => Subscription::To,
        Subscription::From => Subscription::None,
        other => other,
    };
    Transition::changed(current, item.clone().with_subscription(subscription))
}
