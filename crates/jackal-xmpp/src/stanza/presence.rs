use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::xml::{ns, XElement};

use super::{canonical_element, error_element, ErrorReply, StanzaBuildError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    /// Wire value; `Available` has no `type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceType::Available => "",
            PresenceType::Unavailable => "unavailable",
            PresenceType::Subscribe => "subscribe",
            PresenceType::Subscribed => "subscribed",
            PresenceType::Unsubscribe => "unsubscribe",
            PresenceType::Unsubscribed => "unsubscribed",
            PresenceType::Probe => "probe",
            PresenceType::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(PresenceType::Available),
            "unavailable" => Some(PresenceType::Unavailable),
            "subscribe" => Some(PresenceType::Subscribe),
            "subscribed" => Some(PresenceType::Subscribed),
            "unsubscribe" => Some(PresenceType::Unsubscribe),
            "unsubscribed" => Some(PresenceType::Unsubscribed),
            "probe" => Some(PresenceType::Probe),
            "error" => Some(PresenceType::Error),
            _ => None,
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            PresenceType::Subscribe
                | PresenceType::Subscribed
                | PresenceType::Unsubscribe
                | PresenceType::Unsubscribed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl ShowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShowState::Away => "away",
            ShowState::Chat => "chat",
            ShowState::Dnd => "dnd",
            ShowState::Xa => "xa",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "away" => Some(ShowState::Away),
            "chat" => Some(ShowState::Chat),
            "dnd" => Some(ShowState::Dnd),
            "xa" => Some(ShowState::Xa),
            _ => None,
        }
    }
}

/// Entity capabilities advertisement (XEP-0115).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caps {
    pub node: String,
    pub ver: String,
    pub hash: String,
}

/// A `<presence/>` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    element: XElement,
    from: Jid,
    to: Jid,
    presence_type: PresenceType,
    show: Option<ShowState>,
    priority: i8,
    caps: Option<Caps>,
}

impl Presence {
    pub fn new(element: XElement, from: Jid, to: Jid) -> Result<Self, StanzaBuildError> {
        if element.name() != "presence" {
            return Err(StanzaBuildError::bad_request("wrong presence element name"));
        }
        let presence_type = PresenceType::parse(element.attr("type").unwrap_or_default())
            .ok_or_else(|| StanzaBuildError::bad_request("invalid presence type"))?;

        let mut show = None;
        {
        let mut shows = element.children_named("show");
        if let Some(el) = shows.next() {
            if shows.next().is_some() {
                return Err(StanzaBuildError::bad_request(
                    "presence must contain at most one <show/> element",
                ));
            }
            if !el.attributes().is_empty() {
                return Err(StanzaBuildError::bad_request("<show/> must not have attributes"));
            }
            show = Some(
                ShowState::parse(el.text())
                    .ok_or_else(|| StanzaBuildError::bad_request("invalid <show/> value"))?,
            );
        }
        }

        let mut priority = 0i8;
        {
        let mut priorities = element.children_named("priority");
        if let Some(el) = priorities.next() {
            if priorities.next().is_some() {
                return Err(StanzaBuildError::bad_request(
                    "presence must contain at most one <priority/> element",
                ));
            }
            priority = el
                .text()
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|p| i8::try_from(p).ok())
                .ok_or_else(|| StanzaBuildError::bad_request("priority out of range [-128, 127]"))?;
        }
        }

        for status in element.children_named("status") {
            if status.attributes().iter().any(|a| a.label != "xml:lang") {
                return Err(StanzaBuildError::bad_request(
                    "<status/> only accepts the xml:lang attribute",
                ));
            }
        }

        let caps = element.child_ns("c", ns::CAPS).map(|c| Caps {
            node: c.attr("node").unwrap_or_default().to_string(),
            ver: c.attr("ver").unwrap_or_default().to_string(),
            hash: c.attr("hash").unwrap_or_default().to_string(),
        });

        Ok(Self {
            element: canonical_element(element, &from, &to),
            from,
            to,
            presence_type,
            show,
            priority,
            caps,
        })
    }

    /// A bare presence of the given type with no payload.
    pub fn build(presence_type: PresenceType, from: Jid, to: Jid) -> Self {
        let mut builder = XElement::builder("presence")
            .attr("from", from.to_string())
            .attr("to", to.to_string());
        if presence_type != PresenceType::Available {
            builder = builder.attr("type", presence_type.as_str());
        }
        Self {
            element: builder.build(),
            from,
            to,
            presence_type,
            show: None,
            priority: 0,
            caps: None,
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

    pub fn presence_type(&self) -> PresenceType {
        self.presence_type
    }

    pub fn is_available(&self) -> bool {
        self.presence_type == PresenceType::Available
    }

    pub fn is_unavailable(&self) -> bool {
        self.presence_type == PresenceType::Unavailable
    }

    pub fn show(&self) -> Option<ShowState> {
        self.show
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn status(&self) -> Option<&str> {
        self.element.child("status").map(|s| s.text())
    }

    pub fn caps(&self) -> Option<&Caps> {
        self.caps.as_ref()
    }

    /// The same stanza readdressed.
    pub fn readdressed(&self, from: Jid, to: Jid) -> Presence {
        Presence {
            element: canonical_element(self.element.clone(), &from, &to),
            from,
            to,
            ..self.clone()
        }
    }
}

impl ErrorReply for Presence {
    fn error_reply(&self, condition: StanzaErrorCondition) -> Self {
        Presence {
            element: error_element(&self.element, condition),
            from: self.to.clone(),
            to: self.from.clone(),
            presence_type: PresenceType::Error,
            ..self.clone()
        }
    }
}
