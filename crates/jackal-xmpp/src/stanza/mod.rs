//! Typed stanzas.
//!
//! Each constructor takes the source element plus the resolved `from`/`to`
//! addresses, validates the structural rules of its kind and produces an
//! immutable stanza whose element carries canonical `from`/`to` attributes
//! and no `xmlns`.

use thiserror::Error;

use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::xml::XElement;

mod error;
mod iq;
mod message;
mod presence;

pub use error::{error_element, ErrorReply};
pub use iq::{Iq, IqType};
pub use message::{Message, MessageType};
pub use presence::{Caps, Presence, PresenceType, ShowState};

/// A stanza failed its structural validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{condition}: {reason}")]
pub struct StanzaBuildError {
    pub condition: StanzaErrorCondition,
    pub reason: String,
}

impl StanzaBuildError {
    pub(crate) fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            condition: StanzaErrorCondition::BadRequest,
            reason: reason.into(),
        }
    }

    pub(crate) fn jid_malformed(reason: impl Into<String>) -> Self {
        Self {
            condition: StanzaErrorCondition::JidMalformed,
            reason: reason.into(),
        }
    }
}

/// Kind tag of a stanza, also used on the cluster wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StanzaKind {
    Message = 0,
    Presence = 1,
    Iq = 2,
}

impl StanzaKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Message),
            1 => Some(Self::Presence),
            2 => Some(Self::Iq),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            "iq" => Some(Self::Iq),
            _ => None,
        }
    }
}

/// One of the three stanza kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
}

impl Stanza {
    /// Build a typed stanza of the given kind.
    pub fn new(kind: StanzaKind, element: XElement, from: Jid, to: Jid) -> Result<Self, StanzaBuildError> {
        Ok(match kind {
            StanzaKind::Iq => Stanza::Iq(Iq::new(element, from, to)?),
            StanzaKind::Message => Stanza::Message(Message::new(element, from, to)?),
            StanzaKind::Presence => Stanza::Presence(Presence::new(element, from, to)?),
        })
    }

    /// Build a typed stanza reading `from`/`to` from the element itself.
    pub fn from_element(element: XElement) -> Result<Self, StanzaBuildError> {
        let kind = StanzaKind::from_name(element.name())
            .ok_or_else(|| StanzaBuildError::bad_request(format!("<{}/> is not a stanza", element.name())))?;
        let from = address_attr(&element, "from")?;
        let to = address_attr(&element, "to")?;
        Self::new(kind, element, from, to)
    }

    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Iq(_) => StanzaKind::Iq,
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
        }
    }

    pub fn element(&self) -> &XElement {
        match self {
            Stanza::Iq(s) => s.element(),
            Stanza::Message(s) => s.element(),
            Stanza::Presence(s) => s.element(),
        }
    }

    pub fn into_element(self) -> XElement {
        match self {
            Stanza::Iq(s) => s.into_element(),
            Stanza::Message(s) => s.into_element(),
            Stanza::Presence(s) => s.into_element(),
        }
    }

    pub fn from(&self) -> &Jid {
        match self {
            Stanza::Iq(s) => s.from(),
            Stanza::Message(s) => s.from(),
            Stanza::Presence(s) => s.from(),
        }
    }

    pub fn to(&self) -> &Jid {
        match self {
            Stanza::Iq(s) => s.to(),
            Stanza::Message(s) => s.to(),
            Stanza::Presence(s) => s.to(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.element().attr("id")
    }

    /// Stanzas of type `error` must never be answered with another error.
    pub fn is_error(&self) -> bool {
        self.element().attr("type") == Some("error")
    }
}

impl ErrorReply for Stanza {
    fn error_reply(&self, condition: StanzaErrorCondition) -> Self {
        match self {
            Stanza::Iq(s) => Stanza::Iq(s.error_reply(condition)),
            Stanza::Message(s) => Stanza::Message(s.error_reply(condition)),
            Stanza::Presence(s) => Stanza::Presence(s.error_reply(condition)),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
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

fn address_attr(element: &XElement, label: &str) -> Result<Jid, StanzaBuildError> {
    let raw = element
        .attr(label)
        .ok_or_else(|| StanzaBuildError::jid_malformed(format!("missing '{label}' attribute")))?;
    Jid::parse(raw).map_err(|e| StanzaBuildError::jid_malformed(e.to_string()))
}

/// Copy the element with canonical addressing and no `xmlns`.
pub(crate) fn canonical_element(element: XElement, from: &Jid, to: &Jid) -> XElement {
    element
        .into_builder()
        .remove_attr("xmlns")
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .build()
}
