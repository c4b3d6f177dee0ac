//! RFC 6121 Roster Management.
//!
//! This module holds the roster data model and its wire format; the IQ
//! handler and the presence subscription flows live in [`module`].
//!
//! ## Protocol Overview
//!
//! Roster get (with versioning):
//! ```xml
//! <iq type='get' id='roster-1'>
//!   <query xmlns='jabber:iq:roster' ver='v3'/>
//! </iq>
//! ```
//!
//! Roster set (add/update):
//! ```xml
//! <iq type='set' id='roster-2'>
//!   <query xmlns='jabber:iq:roster'>
//!     <item jid='contact@example.com' name='Contact Name'>
//!       <group>Friends</group>
//!     </item>
//!   </query>
//! </iq>
//! ```
//!
//! Roster set (remove):
//! ```xml
//! <iq type='set' id='roster-3'>
//!   <query xmlns='jabber:iq:roster'>
//!     <item jid='contact@example.com' subscription='remove'/>
//!   </query>
//! </iq>
//! ```
//!
//! Roster push (server to client):
//! ```xml
//! <iq type='set' id='push-1' to='user@example.com/res'>
//!   <query xmlns='jabber:iq:roster' ver='v4'>
//!     <item jid='contact@example.com' subscription='both'/>
//!   </query>
//! </iq>
//! ```

pub mod module;

pub use module::RosterModule;

use std::collections::HashSet;
use std::fmt;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};

use crate::ns::ROSTER as ROSTER_NS;
use crate::XmppError;

/// A contact in a user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// Username of the roster owner.
    pub username: String,
    /// The contact's bare JID.
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// A subscription request sent by the owner is awaiting approval.
    pub ask: bool,
    pub groups: Vec<String>,
    /// Roster version at which this item was last modified.
    pub version: u64,
}

impl RosterItem {
    pub fn new(username: impl Into<String>, jid: BareJid) -> Self {
        Self {
            username: username.into(),
            jid,
            name: None,
            subscription: Subscription::None,
            ask: false,
            groups: Vec::new(),
            version: 0,
        }
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn with_ask(mut self, ask: bool) -> Self {
        self.ask = ask;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn add_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Parse a roster item owned by `username` from an `<item/>` element.
    pub fn from_element(username: &str, elem: &Element) -> Result<Self, XmppError> {
        let jid_str = elem.attr("jid").ok_or_else(|| {
            XmppError::bad_request(Some("Roster item missing 'jid' attribute".to_string()))
        })?;

        let jid: BareJid = jid_str.parse().map_err(|e| {
            XmppError::jid_malformed(Some(format!("Invalid JID '{}': {}", jid_str, e)))
        })?;

        let name = elem.attr("name").map(|s| s.to_string());

        let subscription = elem
            .attr("subscription")
            .map(Subscription::from_str)
            .transpose()?
            .unwrap_or(Subscription::None);

        let ask = match elem.attr("ask") {
            None => false,
            Some("subscribe") => true,
            Some(other) => {
                return Err(XmppError::bad_request(Some(format!(
                    "Invalid ask type: {}",
                    other
                ))))
            }
        };

        // RFC 6121 does not allow empty or duplicate group names.
        let mut groups = Vec::new();
        let mut seen_groups = HashSet::new();
        for group_elem in elem
            .children()
            .filter(|c| c.name() == "group" && c.ns() == ROSTER_NS)
        {
            let group = group_elem.text();
            if group.trim().is_empty() {
                return Err(XmppError::not_acceptable(Some(
                    "Roster group name must not be empty".to_string(),
                )));
            }
            if !seen_groups.insert(group.clone()) {
                return Err(XmppError::bad_request(Some(
                    "Roster group names must be unique".to_string(),
                )));
            }
            groups.push(group);
        }

        Ok(Self {
            username: username.to_string(),
            jid,
            name,
            subscription,
            ask,
            groups,
            version: 0,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ROSTER_NS)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());

        if let Some(ref name) = self.name {
            builder = builder.attr("name", name);
        }

        if self.ask {
            builder = builder.attr("ask", "subscribe");
        }

        for group in &self.groups {
            let group_elem = Element::builder("group", ROSTER_NS)
                .append(group.clone())
                .build();
            builder = builder.append(group_elem);
        }

        builder.build()
    }

    /// Whether the owner receives the contact's presence.
    pub fn receives_presence(&self) -> bool {
        matches!(self.subscription, Subscription::To | Subscription::Both)
    }

    /// Whether the owner sends presence to the contact.
    pub fn sends_presence(&self) -> bool {
        matches!(self.subscription, Subscription::From | Subscription::Both)
    }
}

/// Subscription state for a roster item.
///
/// - `none`: no subscription in either direction
/// - `to`: the owner receives the contact's presence
/// - `from`: the contact receives the owner's presence
/// - `both`: mutual subscription
/// - `remove`: only used on the wire to remove an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, XmppError> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            "remove" => Ok(Subscription::Remove),
            _ => Err(XmppError::bad_request(Some(format!(
                "Invalid subscription state: {}",
                s
            )))),
        }
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Subscription::Remove)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Roster version counters for one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterVersion {
    /// Incremented on every item modification.
    pub version: u64,
    /// Version at which an item was last deleted.
    pub deletion_version: u64,
}

/// Render a version counter as sent on the wire (`v7`).
pub fn format_version(version: u64) -> String {
    format!("v{}", version)
}

/// Parse a client-supplied `ver` attribute. Unknown formats yield `None`.
pub fn parse_version(ver: &str) -> Option<u64> {
    ver.strip_prefix('v')?.parse().ok()
}

/// Parsed roster get request.
#[derive(Debug, Clone)]
pub struct RosterGet {
    pub ver: Option<String>,
}

/// Parse a roster get query. The query must not carry items.
pub fn parse_roster_get(iq: &Iq) -> Result<RosterGet, XmppError> {
    let query_elem = match &iq.payload {
        IqType::Get(elem) if elem.name() == "query" && elem.ns() == ROSTER_NS => elem,
        _ => {
            return Err(XmppError::bad_request(Some(
                "Missing roster query element".to_string(),
            )));
        }
    };

    if query_elem.children().next().is_some() {
        return Err(XmppError::bad_request(Some(
            "Roster get must not contain items".to_string(),
        )));
    }

    let ver = query_elem.attr("ver").map(|s| s.to_string());
    debug!(ver = ?ver, "Parsed roster get query");
    Ok(RosterGet { ver })
}

/// Parse a roster set query. Exactly one `<item/>` is accepted.
///
/// Client-provided `subscription` and `ask` values are server-controlled and
/// ignored, except for `subscription='remove'`.
pub fn parse_roster_set(username: &str, iq: &Iq) -> Result<RosterItem, XmppError> {
    let query_elem = match &iq.payload {
        IqType::Set(elem) if elem.name() == "query" && elem.ns() == ROSTER_NS => elem,
        _ => {
            return Err(XmppError::bad_request(Some(
                "Missing roster query element".to_string(),
            )));
        }
    };

    let items: Vec<&Element> = query_elem
        .children()
        .filter(|c| c.name() == "item" && c.ns() == ROSTER_NS)
        .collect();
    if items.len() != 1 {
        return Err(XmppError::bad_request(Some(
            "Roster set must contain exactly one item".to_string(),
        )));
    }

    let mut item = RosterItem::from_element(username, items[0])?;
    item.subscription = match item.subscription {
        Subscription::Remove => Subscription::Remove,
        _ => Subscription::None,
    };
    item.ask = false;

    debug!(
        jid = %item.jid,
        remove = item.subscription.is_remove(),
        "Parsed roster set query"
    );
    Ok(item)
}

/// Build a roster result carrying `items`.
pub fn build_roster_result(original_iq: &Iq, items: &[RosterItem], ver: Option<&str>) -> Iq {
    let mut query_builder = Element::builder("query", ROSTER_NS);

    if let Some(v) = ver {
        query_builder = query_builder.attr("ver", v);
    }

    for item in items {
        query_builder = query_builder.append(item.to_element());
    }

    Iq {
        from: original_iq.to.clone(),
        to: original_iq.from.clone(),
        id: original_iq.id.clone(),
        payload: IqType::Result(Some(query_builder.build())),
    }
}

/// Build a roster push addressed to one resource of the owner.
pub fn build_roster_push(push_id: &str, to: &FullJid, item: &RosterItem, ver: Option<&str>) -> Iq {
    let mut query_builder = Element::builder("query", ROSTER_NS);

    if let Some(v) = ver {
        query_builder = query_builder.attr("ver", v);
    }

    Iq {
        from: Some(Jid::from(to.to_bare())),
        to: Some(Jid::from(to.clone())),
        id: push_id.to_string(),
        payload: IqType::Set(query_builder.append(item.to_element()).build()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    fn get_iq(query: &str) -> Iq {
        Iq {
            from: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            to: None,
            id: "r1".to_string(),
            payload: IqType::Get(query.parse().unwrap()),
        }
    }

    fn set_iq(query: &str) -> Iq {
        Iq {
            from: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            to: None,
            id: "r2".to_string(),
            payload: IqType::Set(query.parse().unwrap()),
        }
    }

    #[test]
    fn test_roster_item_element_round_trip() {
        let item = RosterItem::new("ortuman", bare("noelia@jackal.im"))
            .with_name("Noelia")
            .with_subscription(Subscription::From)
            .with_ask(true)
            .add_group("Family")
            .add_group("Friends");

        let parsed = RosterItem::from_element("ortuman", &item.to_element()).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_item_missing_jid() {
        let elem: Element = "<item xmlns='jabber:iq:roster' name='x'/>".parse().unwrap();
        assert!(RosterItem::from_element("ortuman", &elem).is_err());
    }

    #[test]
    fn test_empty_group_rejected() {
        let elem: Element =
            "<item xmlns='jabber:iq:roster' jid='a@b.c'><group> </group></item>"
                .parse()
                .unwrap();
        assert!(RosterItem::from_element("ortuman", &elem).is_err());
    }

    #[test]
    fn test_version_format() {
        assert_eq!(format_version(12), "v12");
        assert_eq!(parse_version("v12"), Some(12));
        assert_eq!(parse_version("12"), None);
        assert_eq!(parse_version("vx"), None);
    }

    #[test]
    fn test_parse_roster_get_with_version() {
        let iq = get_iq("<query xmlns='jabber:iq:roster' ver='v1'/>");
        let get = parse_roster_get(&iq).unwrap();
        assert_eq!(get.ver.as_deref(), Some("v1"));
    }

    #[test]
    fn test_parse_roster_get_rejects_items() {
        let iq = get_iq("<query xmlns='jabber:iq:roster'><item jid='a@b.c'/></query>");
        assert!(parse_roster_get(&iq).is_err());
    }

    #[test]
    fn test_parse_roster_set_ignores_client_subscription() {
        let iq = set_iq(
            "<query xmlns='jabber:iq:roster'>\
             <item jid='noelia@jackal.im' subscription='both' ask='subscribe' name='N'/>\
             </query>",
        );
        let item = parse_roster_set("ortuman", &iq).unwrap();
        assert_eq!(item.subscription, Subscription::None);
        assert!(!item.ask);
        assert_eq!(item.name.as_deref(), Some("N"));
    }

    #[test]
    fn test_parse_roster_set_remove() {
        let iq = set_iq(
            "<query xmlns='jabber:iq:roster'>\
             <item jid='noelia@jackal.im' subscription='remove'/>\
             </query>",
        );
        let item = parse_roster_set("ortuman", &iq).unwrap();
        assert!(item.subscription.is_remove());
    }

    #[test]
    fn test_parse_roster_set_requires_exactly_one_item() {
        let iq = set_iq("<query xmlns='jabber:iq:roster'/>");
        assert!(parse_roster_set("ortuman", &iq).is_err());

        let iq = set_iq(
            "<query xmlns='jabber:iq:roster'>\
             <item jid='a@jackal.im'/><item jid='b@jackal.im'/>\
             </query>",
        );
        assert!(parse_roster_set("ortuman", &iq).is_err());
    }

    #[test]
    fn test_build_roster_push() {
        let to: FullJid = "ortuman@jackal.im/yard".parse().unwrap();
        let item = RosterItem::new("ortuman", bare("juliet@jackal.im"));
        let push = build_roster_push("push-1", &to, &item, Some("v2"));

        assert_eq!(push.to.unwrap().to_string(), "ortuman@jackal.im/yard");
        match push.payload {
            IqType::Set(query) => {
                assert_eq!(query.attr("ver"), Some("v2"));
                let item = query.get_child("item", ROSTER_NS).unwrap();
                assert_eq!(item.attr("jid"), Some("juliet@jackal.im"));
            }
            _ => panic!("push must be a set"),
        }
    }
}
