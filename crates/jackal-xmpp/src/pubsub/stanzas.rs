//! PubSub stanza parsing and building.
//!
//! Handles XML parsing of PubSub IQ stanzas and building of responses and
//! event notifications.

use jid::{BareJid, Jid};
use minidom::Element;
use uuid::Uuid;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};

use super::features::Feature;
use super::node::{Affiliation, NodeAffiliation, NodeItem, NodeSubscription, NotificationType, SubscriptionState};
use crate::ns::{PUBSUB, PUBSUB_ERRORS, PUBSUB_EVENT, PUBSUB_OWNER};
use crate::xep::xep0004::DataForm;
use crate::XmppError;

/// Parsed PubSub request types.
#[derive(Debug, Clone)]
pub enum PubSubRequest {
    /// Create a node; `None` asks for an instant node.
    Create {
        node: Option<String>,
        config: Option<DataForm>,
    },
    Subscribe {
        node: String,
        jid: Jid,
    },
    Unsubscribe {
        node: String,
        jid: Jid,
        subid: Option<String>,
    },
    Publish {
        node: String,
        item_id: Option<String>,
        payload: Option<Element>,
    },
    Retract {
        node: String,
        item_ids: Vec<String>,
        notify: bool,
    },
    Items {
        node: String,
        max_items: Option<usize>,
        item_ids: Vec<String>,
    },
    /// The requester's own subscriptions, optionally for one node.
    Subscriptions { node: Option<String> },
    /// The requester's own affiliations, optionally for one node.
    Affiliations { node: Option<String> },
    ConfigureGet { node: String },
    ConfigureSet { node: String, form: DataForm },
    Default,
    Delete { node: String },
    Purge { node: String },
    OwnerAffiliationsGet { node: String },
    OwnerAffiliationsSet {
        node: String,
        affiliations: Vec<(BareJid, Affiliation)>,
    },
    OwnerSubscriptionsGet { node: String },
    OwnerSubscriptionsSet {
        node: String,
        subscriptions: Vec<(Jid, SubscriptionState)>,
    },
}

impl PubSubRequest {
    /// The feature gating this request.
    pub fn feature(&self) -> Feature {
        match self {
            PubSubRequest::Create { .. } => Feature::CreateNodes,
            PubSubRequest::Subscribe { .. } | PubSubRequest::Unsubscribe { .. } => Feature::Subscribe,
            PubSubRequest::Publish { .. } => Feature::Publish,
            PubSubRequest::Retract { .. } => Feature::RetractItems,
            PubSubRequest::Items { .. } => Feature::RetrieveItems,
            PubSubRequest::Subscriptions { .. } => Feature::RetrieveSubscriptions,
            PubSubRequest::Affiliations { .. } => Feature::RetrieveAffiliations,
            PubSubRequest::ConfigureGet { .. } | PubSubRequest::ConfigureSet { .. } => Feature::ConfigNode,
            PubSubRequest::Default => Feature::RetrieveDefault,
            PubSubRequest::Delete { .. } => Feature::DeleteNodes,
            PubSubRequest::Purge { .. } => Feature::PurgeNodes,
            PubSubRequest::OwnerAffiliationsGet { .. } | PubSubRequest::OwnerAffiliationsSet { .. } => {
                Feature::ModifyAffiliations
            }
            PubSubRequest::OwnerSubscriptionsGet { .. } | PubSubRequest::OwnerSubscriptionsSet { .. } => {
                Feature::ManageSubscriptions
            }
        }
    }

    /// The node the request targets, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            PubSubRequest::Create { node, .. }
            | PubSubRequest::Subscriptions { node }
            | PubSubRequest::Affiliations { node } => node.as_deref(),
            PubSubRequest::Default => None,
            PubSubRequest::Subscribe { node, .. }
            | PubSubRequest::Unsubscribe { node, .. }
            | PubSubRequest::Publish { node, .. }
            | PubSubRequest::Retract { node, .. }
            | PubSubRequest::Items { node, .. }
            | PubSubRequest::ConfigureGet { node }
            | PubSubRequest::ConfigureSet { node, .. }
            | PubSubRequest::Delete { node }
            | PubSubRequest::Purge { node }
            | PubSubRequest::OwnerAffiliationsGet { node }
            | PubSubRequest::OwnerAffiliationsSet { node, .. }
            | PubSubRequest::OwnerSubscriptionsGet { node }
            | PubSubRequest::OwnerSubscriptionsSet { node, .. } => Some(node),
        }
    }
}

/// An error with a `pubsub#errors` application condition.
pub fn pubsub_error(error: XmppError, condition: &str) -> XmppError {
    error.with_application(Element::builder(condition, PUBSUB_ERRORS).build())
}

/// `feature-not-implemented` with `<unsupported feature='…'/>`.
pub fn unsupported(feature: Feature) -> XmppError {
    XmppError::feature_not_implemented(None).with_application(
        Element::builder("unsupported", PUBSUB_ERRORS)
            .attr("feature", feature.as_str())
            .build(),
    )
}

pub fn nodeid_required() -> XmppError {
    pubsub_error(XmppError::bad_request(None), "nodeid-required")
}

/// Check if an IQ is a PubSub request.
pub fn is_pubsub_iq(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => {
            elem.name() == "pubsub" && (elem.ns() == PUBSUB || elem.ns() == PUBSUB_OWNER)
        }
        _ => false,
    }
}

fn required_node(elem: &Element) -> Result<String, XmppError> {
    elem.attr("node")
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(nodeid_required)
}

fn parse_jid(raw: Option<&str>) -> Result<Jid, XmppError> {
    let raw = raw.ok_or_else(|| pubsub_error(XmppError::bad_request(None), "jid-required"))?;
    raw.parse()
        .map_err(|_| XmppError::jid_malformed(Some(format!("Invalid JID '{}'", raw))))
}

fn first_form(elem: &Element) -> Result<Option<DataForm>, XmppError> {
    elem.children()
        .find(|c| c.name() == "x")
        .map(DataForm::from_element)
        .transpose()
}

/// Parse a PubSub IQ stanza into a structured request.
pub fn parse_pubsub_iq(iq: &Iq) -> Result<PubSubRequest, XmppError> {
    let (pubsub, is_set) = match &iq.payload {
        IqType::Get(elem) => (elem, false),
        IqType::Set(elem) => (elem, true),
        _ => {
            return Err(XmppError::bad_request(Some(
                "PubSub IQ must be get or set".to_string(),
            )))
        }
    };
    if pubsub.name() != "pubsub" {
        return Err(XmppError::bad_request(Some("Expected pubsub element".to_string())));
    }
    if pubsub.ns() == PUBSUB_OWNER {
        return parse_owner_request(pubsub, is_set);
    }
    if pubsub.ns() != PUBSUB {
        return Err(XmppError::bad_request(None));
    }

    let Some(action) = pubsub.children().find(|c| c.name() != "configure" && c.name() != "options") else {
        return Err(XmppError::bad_request(Some("Empty pubsub request".to_string())));
    };

    match (action.name(), is_set) {
        ("create", true) => {
            let config = match pubsub.get_child("configure", PUBSUB) {
                Some(configure) => first_form(configure)?,
                None => None,
            };
            Ok(PubSubRequest::Create {
                node: action.attr("node").filter(|n| !n.is_empty()).map(str::to_string),
                config,
            })
        }
        ("subscribe", true) => Ok(PubSubRequest::Subscribe {
            node: required_node(action)?,
            jid: parse_jid(action.attr("jid"))?,
        }),
        ("unsubscribe", true) => Ok(PubSubRequest::Unsubscribe {
            node: required_node(action)?,
            jid: parse_jid(action.attr("jid"))?,
            subid: action.attr("subid").map(str::to_string),
        }),
        ("publish", true) => {
            let node = required_node(action)?;
            let item = action.children().find(|c| c.name() == "item");
            Ok(PubSubRequest::Publish {
                node,
                item_id: item.and_then(|i| i.attr("id")).map(str::to_string),
                payload: item.and_then(|i| i.children().next().cloned()),
            })
        }
        ("retract", true) => {
            let node = required_node(action)?;
            let item_ids: Vec<String> = action
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|c| c.attr("id").map(str::to_string))
                .collect();
            if item_ids.is_empty() {
                return Err(pubsub_error(XmppError::bad_request(None), "item-required"));
            }
            Ok(PubSubRequest::Retract {
                node,
                item_ids,
                notify: matches!(action.attr("notify"), Some("true") | Some("1")),
            })
        }
        ("items", false) => Ok(PubSubRequest::Items {
            node: required_node(action)?,
            max_items: action.attr("max_items").and_then(|m| m.parse().ok()),
            item_ids: action
                .children()
                .filter(|c| c.name() == "item")
                .filter_map(|c| c.attr("id").map(str::to_string))
                .collect(),
        }),
        ("subscriptions", false) => Ok(PubSubRequest::Subscriptions {
            node: action.attr("node").map(str::to_string),
        }),
        ("affiliations", false) => Ok(PubSubRequest::Affiliations {
            node: action.attr("node").map(str::to_string),
        }),
        (other, _) => Err(XmppError::feature_not_implemented(Some(format!(
            "Unsupported pubsub action: {}",
            other
        )))),
    }
}

fn parse_owner_request(pubsub: &Element, is_set: bool) -> Result<PubSubRequest, XmppError> {
    let Some(action) = pubsub.children().next() else {
        return Err(XmppError::bad_request(Some("Empty pubsub request".to_string())));
    };

    match (action.name(), is_set) {
        ("configure", false) => Ok(PubSubRequest::ConfigureGet {
            node: required_node(action)?,
        }),
        ("configure", true) => {
            let node = required_node(action)?;
            let form = first_form(action)?
                .ok_or_else(|| XmppError::bad_request(Some("Missing configuration form".to_string())))?;
            Ok(PubSubRequest::ConfigureSet { node, form })
        }
        ("default", false) => Ok(PubSubRequest::Default),
        ("delete", true) => Ok(PubSubRequest::Delete {
            node: required_node(action)?,
        }),
        ("purge", true) => Ok(PubSubRequest::Purge {
            node: required_node(action)?,
        }),
        ("affiliations", false) => Ok(PubSubRequest::OwnerAffiliationsGet {
            node: required_node(action)?,
        }),
        ("affiliations", true) => {
            let node = required_node(action)?;
            let affiliations = action
                .children()
                .filter(|c| c.name() == "affiliation")
                .map(|c| {
                    let jid = parse_jid(c.attr("jid"))?.to_bare();
                    let affiliation = c
                        .attr("affiliation")
                        .and_then(Affiliation::from_str)
                        .ok_or_else(|| XmppError::bad_request(Some("Invalid affiliation".to_string())))?;
                    Ok((jid, affiliation))
                })
                .collect::<Result<Vec<_>, XmppError>>()?;
            Ok(PubSubRequest::OwnerAffiliationsSet { node, affiliations })
        }
        ("subscriptions", false) => Ok(PubSubRequest::OwnerSubscriptionsGet {
            node: required_node(action)?,
        }),
        ("subscriptions", true) => {
            let node = required_node(action)?;
            let subscriptions = action
                .children()
                .filter(|c| c.name() == "subscription")
                .map(|c| {
                    let jid = parse_jid(c.attr("jid"))?;
                    let state = c
                        .attr("subscription")
                        .and_then(SubscriptionState::from_str)
                        .ok_or_else(|| XmppError::bad_request(Some("Invalid subscription state".to_string())))?;
                    Ok((jid, state))
                })
                .collect::<Result<Vec<_>, XmppError>>()?;
            Ok(PubSubRequest::OwnerSubscriptionsSet { node, subscriptions })
        }
        (other, _) => Err(XmppError::feature_not_implemented(Some(format!(
            "Unsupported pubsub owner action: {}",
            other
        )))),
    }
}

/// `<pubsub xmlns=ns>` wrapping `child`.
pub fn pubsub_payload(ns: &str, child: Element) -> Element {
    Element::builder("pubsub", ns).append(child).build()
}

pub fn item_element(ns: &str, item: &NodeItem, with_payload: bool) -> Element {
    let mut builder = Element::builder("item", ns).attr("id", &item.id);
    if with_payload {
        if let Some(payload) = &item.payload {
            builder = builder.append(payload.clone());
        }
    }
    builder.build()
}

/// `<items node=…>` holding `items`, for results and event notifications.
pub fn items_element(ns: &str, node: &str, items: &[NodeItem], with_payload: bool) -> Element {
    items
        .iter()
        .fold(Element::builder("items", ns).attr("node", node), |builder, item| {
            builder.append(item_element(ns, item, with_payload))
        })
        .build()
}

pub fn subscription_element(ns: &str, subscription: &NodeSubscription, with_node: bool) -> Element {
    let mut builder = Element::builder("subscription", ns)
        .attr("jid", subscription.jid.to_string())
        .attr("subscription", subscription.state.as_str());
    if with_node {
        builder = builder.attr("node", &subscription.node);
    }
    if !subscription.id.is_empty() {
        builder = builder.attr("subid", &subscription.id);
    }
    builder.build()
}

pub fn affiliation_element(ns: &str, affiliation: &NodeAffiliation, owner_view: bool) -> Element {
    let builder = Element::builder("affiliation", ns).attr("affiliation", affiliation.affiliation.as_str());
    if owner_view {
        builder.attr("jid", affiliation.jid.to_string()).build()
    } else {
        builder.attr("node", &affiliation.node).build()
    }
}

/// Event notification message sent by the service at `from` to `to`.
pub fn build_event_message(from: &Jid, to: &Jid, notification_type: NotificationType, event: Element) -> Message {
    let mut message = Message::new(Some(to.clone()));
    message.from = Some(from.clone());
    message.id = Some(Uuid::new_v4().to_string());
    message.type_ = match notification_type {
        NotificationType::Normal => MessageType::Normal,
        NotificationType::Headline => MessageType::Headline,
    };
    message
        .payloads
        .push(Element::builder("event", PUBSUB_EVENT).append(event).build());
    message
}
