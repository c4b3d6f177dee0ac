//! XEP-0191: Blocking Command
//!
//! Wire format of the blocking command. The behaviour (presence updates,
//! pushes, router cache reload) lives in
//! [`crate::modules::BlockListModule`].
//!
//! ## XML Format
//!
//! ```xml
//! <!-- Get blocklist -->
//! <iq type='get' id='blocklist1'>
//!   <blocklist xmlns='urn:xmpp:blocking'/>
//! </iq>
//!
//! <!-- Block a JID -->
//! <iq type='set' id='block1'>
//!   <block xmlns='urn:xmpp:blocking'>
//!     <item jid='romeo@montague.net'/>
//!   </block>
//! </iq>
//!
//! <!-- Unblock all JIDs -->
//! <iq type='set' id='unblock2'>
//!   <unblock xmlns='urn:xmpp:blocking'/>
//! </iq>
//! ```

use jid::Jid;
use minidom::Element;
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};

use crate::ns::BLOCKING as NS_BLOCKING;
use crate::XmppError;

/// Request type for blocking operations.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockingRequest {
    /// Get the current blocklist
    GetBlocklist,
    /// Block one or more addresses
    Block(Vec<Jid>),
    /// Unblock one or more addresses (empty means unblock all)
    Unblock(Vec<Jid>),
}

/// Check if an IQ stanza is a blocking query.
pub fn is_blocking_query(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) => elem.name() == "blocklist" && elem.ns() == NS_BLOCKING,
        IqType::Set(elem) => {
            (elem.name() == "block" || elem.name() == "unblock") && elem.ns() == NS_BLOCKING
        }
        _ => false,
    }
}

/// Parse a blocking request from an IQ stanza.
pub fn parse_blocking_request(iq: &Iq) -> Result<BlockingRequest, XmppError> {
    match &iq.payload {
        IqType::Get(elem) => {
            if elem.name() == "blocklist" && elem.ns() == NS_BLOCKING {
                Ok(BlockingRequest::GetBlocklist)
            } else {
                Err(XmppError::bad_request(Some(
                    "Expected blocklist element".to_string(),
                )))
            }
        }
        IqType::Set(elem) => {
            if elem.ns() != NS_BLOCKING {
                return Err(XmppError::bad_request(Some(
                    "Invalid namespace for blocking request".to_string(),
                )));
            }

            let jids = extract_jids_from_element(elem)?;

            match elem.name() {
                "block" if jids.is_empty() => Err(XmppError::bad_request(Some(
                    "Block request must contain at least one item".to_string(),
                ))),
                "block" => Ok(BlockingRequest::Block(jids)),
                "unblock" => Ok(BlockingRequest::Unblock(jids)),
                other => Err(XmppError::bad_request(Some(format!(
                    "Unknown blocking element: {}",
                    other
                )))),
            }
        }
        _ => Err(XmppError::bad_request(Some(
            "Expected IQ get or set for blocking".to_string(),
        ))),
    }
}

/// Extract addresses from the item children of a blocking element.
fn extract_jids_from_element(elem: &Element) -> Result<Vec<Jid>, XmppError> {
    let mut jids: Vec<Jid> = Vec::new();

    for child in elem.children().filter(|c| c.name() == "item") {
        let raw = child.attr("jid").ok_or_else(|| {
            XmppError::bad_request(Some("Item element missing jid attribute".to_string()))
        })?;
        let jid: Jid = raw.parse().map_err(|e| {
            XmppError::jid_malformed(Some(format!("Invalid JID '{}': {}", raw, e)))
        })?;
        if !jids.contains(&jid) {
            jids.push(jid);
        }
    }

    debug!(count = jids.len(), "Extracted JIDs from blocking element");
    Ok(jids)
}

fn items_element(name: &str, jids: &[Jid]) -> Element {
    jids.iter()
        .fold(Element::builder(name, NS_BLOCKING), |builder, jid| {
            builder.append(
                Element::builder("item", NS_BLOCKING)
                    .attr("jid", jid.to_string())
                    .build(),
            )
        })
        .build()
}

/// Build a blocklist response IQ.
pub fn build_blocklist_response(original_iq: &Iq, blocked: &[Jid]) -> Iq {
    Iq {
        from: original_iq.to.clone(),
        to: original_iq.from.clone(),
        id: original_iq.id.clone(),
        payload: IqType::Result(Some(items_element("blocklist", blocked))),
    }
}

/// Build a block push sent to the owner's resources after a block.
pub fn build_block_push(to: &Jid, blocked: &[Jid]) -> Iq {
    Iq {
        from: Some(Jid::from(to.to_bare())),
        to: Some(to.clone()),
        id: format!("push-block-{}", uuid::Uuid::new_v4()),
        payload: IqType::Set(items_element("block", blocked)),
    }
}

/// Build an unblock push. An empty list means everything was unblocked.
pub fn build_unblock_push(to: &Jid, unblocked: &[Jid]) -> Iq {
    Iq {
        from: Some(Jid::from(to.to_bare())),
        to: Some(to.clone()),
        id: format!("push-unblock-{}", uuid::Uuid::new_v4()),
        payload: IqType::Set(items_element("unblock", unblocked)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_iq(xml: &str) -> Iq {
        Iq {
            from: Some("ortuman@jackal.im/balcony".parse().unwrap()),
            to: None,
            id: "b1".to_string(),
            payload: IqType::Set(xml.parse().unwrap()),
        }
    }

    #[test]
    fn test_parse_block_deduplicates() {
        let iq = set_iq(
            "<block xmlns='urn:xmpp:blocking'>\
             <item jid='romeo@jackal.im'/><item jid='romeo@jackal.im'/>\
             <item jid='jackal.im/jail'/></block>",
        );
        assert!(is_blocking_query(&iq));
        match parse_blocking_request(&iq).unwrap() {
            BlockingRequest::Block(jids) => {
                assert_eq!(jids.len(), 2);
                assert_eq!(jids[1].to_string(), "jackal.im/jail");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_block_is_bad_request() {
        let iq = set_iq("<block xmlns='urn:xmpp:blocking'/>");
        assert!(parse_blocking_request(&iq).is_err());
    }

    #[test]
    fn test_empty_unblock_means_all() {
        let iq = set_iq("<unblock xmlns='urn:xmpp:blocking'/>");
        assert_eq!(
            parse_blocking_request(&iq).unwrap(),
            BlockingRequest::Unblock(Vec::new())
        );
    }

    #[test]
    fn test_malformed_jid() {
        let iq = set_iq("<block xmlns='urn:xmpp:blocking'><item jid='@@'/></block>");
        let err = parse_blocking_request(&iq).unwrap_err();
        assert_eq!(
            err.condition(),
            Some(crate::StanzaErrorCondition::JidMalformed)
        );
    }

    #[test]
    fn test_push_carries_items() {
        let to: Jid = "ortuman@jackal.im/yard".parse().unwrap();
        let push = build_block_push(&to, &["romeo@jackal.im".parse().unwrap()]);
        match push.payload {
            IqType::Set(block) => {
                assert_eq!(block.name(), "block");
                assert_eq!(block.children().count(), 1);
            }
            _ => panic!("push must be a set"),
        }
    }
}
