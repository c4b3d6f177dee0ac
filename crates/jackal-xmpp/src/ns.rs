//! XML namespaces consumed and emitted by the server core.

/// XMPP client namespace
pub const JABBER_CLIENT: &str = "jabber:client";
/// Stanza error namespace
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Roster management (RFC 6121)
pub const ROSTER: &str = "jabber:iq:roster";
/// Blocking command (XEP-0191)
pub const BLOCKING: &str = "urn:xmpp:blocking";
/// Last activity (XEP-0012)
pub const LAST_ACTIVITY: &str = "jabber:iq:last";
/// Service discovery info (XEP-0030)
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
/// Service discovery items (XEP-0030)
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
/// Ping (XEP-0199)
pub const PING: &str = "urn:xmpp:ping";
/// Entity capabilities (XEP-0115)
pub const CAPS: &str = "http://jabber.org/protocol/caps";
/// Delayed delivery (XEP-0203)
pub const DELAY: &str = "urn:xmpp:delay";
/// Data forms (XEP-0004)
pub const DATA_FORMS: &str = "jabber:x:data";
/// Publish-subscribe (XEP-0060)
pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
/// Publish-subscribe owner use cases
pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
/// Publish-subscribe event notifications
pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
/// Publish-subscribe application error conditions
pub const PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";
/// Publish-subscribe node configuration form type
pub const PUBSUB_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";
