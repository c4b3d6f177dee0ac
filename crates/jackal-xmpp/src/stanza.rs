//! Typed stanza wrapper and reply helpers.
//!
//! The core never touches raw XML: inbound stanzas are parsed by the stream
//! boundary into [`Stanza`] values and every reply leaves the core the same
//! way. Payload children the core does not understand are carried through
//! untouched (`payloads` on message/presence, the payload element on IQ).

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::XmppError;

/// A routable top-level XMPP element.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Get the stanza type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
            Stanza::Iq(iq) => Some(iq.id.as_str()),
        }
    }

    pub fn set_from(&mut self, from: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.from = from,
            Stanza::Presence(p) => p.from = from,
            Stanza::Iq(iq) => iq.from = from,
        }
    }

    pub fn set_to(&mut self, to: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.to = to,
            Stanza::Presence(p) => p.to = to,
            Stanza::Iq(iq) => iq.to = to,
        }
    }

    /// Whether this stanza is itself an error (errors are never answered).
    pub fn is_error(&self) -> bool {
        match self {
            Stanza::Message(m) => m.type_ == MessageType::Error,
            Stanza::Presence(p) => p.type_ == PresenceType::Error,
            Stanza::Iq(iq) => matches!(iq.payload, IqType::Error(_)),
        }
    }

    /// Build the error reply for this stanza, swapping `from` and `to`.
    ///
    /// Returns `None` for stanzas that must not be answered: error stanzas
    /// and IQ results.
    pub fn error_reply(&self, error: &XmppError) -> Option<Stanza> {
        let stanza_error = error.to_stanza_error();
        match self {
            Stanza::Iq(iq) => {
                if !is_request(iq) {
                    return None;
                }
                Some(Stanza::Iq(Iq {
                    from: iq.to.clone(),
                    to: iq.from.clone(),
                    id: iq.id.clone(),
                    payload: IqType::Error(stanza_error),
                }))
            }
            Stanza::Message(m) => {
                if m.type_ == MessageType::Error {
                    return None;
                }
                let mut reply = Message::new(m.from.clone());
                reply.from = m.to.clone();
                reply.id = m.id.clone();
                reply.type_ = MessageType::Error;
                reply.payloads.push(stanza_error.into());
                Some(Stanza::Message(reply))
            }
            Stanza::Presence(p) => {
                if p.type_ == PresenceType::Error {
                    return None;
                }
                let mut reply = Presence::new(PresenceType::Error);
                reply.from = p.to.clone();
                reply.to = p.from.clone();
                reply.id = p.id.clone();
                reply.payloads.push(stanza_error.into());
                Some(Stanza::Presence(reply))
            }
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        match stanza {
            Stanza::Message(m) => m.into(),
            Stanza::Presence(p) => p.into(),
            Stanza::Iq(iq) => iq.into(),
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = XmppError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        match element.name() {
            "message" => Message::try_from(element)
                .map(Stanza::Message)
                .map_err(|e| XmppError::xml_parse(e.to_string())),
            "presence" => Presence::try_from(element)
                .map(Stanza::Presence)
                .map_err(|e| XmppError::xml_parse(e.to_string())),
            "iq" => Iq::try_from(element)
                .map(Stanza::Iq)
                .map_err(|e| XmppError::xml_parse(e.to_string())),
            other => Err(XmppError::xml_parse(format!(
                "Unknown stanza element: {}",
                other
            ))),
        }
    }
}

/// Whether an IQ expects a response (type get or set).
pub fn is_request(iq: &Iq) -> bool {
    matches!(iq.payload, IqType::Get(_) | IqType::Set(_))
}

/// The payload element of a get/set IQ.
pub fn request_payload(iq: &Iq) -> Option<&Element> {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => Some(elem),
        _ => None,
    }
}

/// Build a result IQ answering `iq`.
pub fn iq_result(iq: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: iq.to.clone(),
        to: iq.from.clone(),
        id: iq.id.clone(),
        payload: IqType::Result(payload),
    }
}

/// Build an error IQ answering `iq`.
pub fn iq_error(iq: &Iq, error: &XmppError) -> Iq {
    Iq {
        from: iq.to.clone(),
        to: iq.from.clone(),
        id: iq.id.clone(),
        payload: IqType::Error(error.to_stanza_error()),
    }
}
