use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::xml::XElement;

use super::{canonical_element, error_element, ErrorReply, StanzaBuildError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    Chat,
    Headline,
    Groupchat,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::Headline => "headline",
            MessageType::Groupchat => "groupchat",
            MessageType::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "normal" => Some(MessageType::Normal),
            "chat" => Some(MessageType::Chat),
            "headline" => Some(MessageType::Headline),
            "groupchat" => Some(MessageType::Groupchat),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// A `<message/>` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    element: XElement,
    from: Jid,
    to: Jid,
    message_type: MessageType,
}

impl Message {
    pub fn new(element: XElement, from: Jid, to: Jid) -> Result<Self, StanzaBuildError> {
        if element.name() != "message" {
            return Err(StanzaBuildError::bad_request("wrong message element name"));
        }
        let message_type = MessageType::parse(element.attr("type").unwrap_or_default())
            .ok_or_else(|| StanzaBuildError::bad_request("invalid message type"))?;
        Ok(Self {
            element: canonical_element(element, &from, &to),
            from,
            to,
            message_type,
        })
    }

    /// A `headline` message carrying `children`, as used for event
    /// notifications.
    pub fn headline(from: Jid, to: Jid, children: impl IntoIterator<Item = XElement>) -> Self {
        let element = XElement::builder("message")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .attr("type", MessageType::Headline.as_str())
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .children(children)
            .build();
        Self {
            element,
            from,
            to,
            message_type: MessageType::Headline,
        }
    }

    pub fn element(&self) -> &XElement {
        &self.element
    }

    pub fn into_element(self) -> XElement {
        self.element
    }

    pub fn from(&self) -> &Jid {
        &self.from
    }

    pub fn to(&self) -> &Jid {
        &self.to
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_chat(&self) -> bool {
        self.message_type == MessageType::Chat
    }

    pub fn is_normal(&self) -> bool {
        self.message_type == MessageType::Normal
    }

    pub fn body(&self) -> Option<&str> {
        self.element.child("body").map(|b| b.text())
    }

    /// True for a message with a non-empty `<body/>`.
    pub fn is_message_with_body(&self) -> bool {
        self.body().is_some_and(|b| !b.is_empty())
    }

    /// The same message with one more child.
    pub fn with_child(&self, child: XElement) -> Message {
        Message {
            element: self.element.to_builder().child(child).build(),
            from: self.from.clone(),
            to: self.to.clone(),
            message_type: self.message_type,
        }
    }

    /// The same stanza readdressed.
    pub fn readdressed(&self, from: Jid, to: Jid) -> Message {
        Message {
            element: canonical_element(self.element.clone(), &from, &to),
            from,
            to,
            message_type: self.message_type,
        }
    }
}

impl ErrorReply for Message {
    fn error_reply(&self, condition: StanzaErrorCondition) -> Self {
        Message {
            element: error_element(&self.element, condition),
            from: self.to.clone(),
            to: self.from.clone(),
            message_type: MessageType::Error,
        }
    }
}
