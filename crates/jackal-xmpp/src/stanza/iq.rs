use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::xml::XElement;

use super::{canonical_element, error_element, ErrorReply, StanzaBuildError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }
}

/// An `<iq/>` stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    element: XElement,
    from: Jid,
    to: Jid,
    iq_type: IqType,
}

impl Iq {
    pub fn new(element: XElement, from: Jid, to: Jid) -> Result<Self, StanzaBuildError> {
        if element.name() != "iq" {
            return Err(StanzaBuildError::bad_request("wrong iq element name"));
        }
        if element.attr("id").map_or(true, str::is_empty) {
            return Err(StanzaBuildError::bad_request("iq must have an 'id' attribute"));
        }
        let iq_type = element
            .attr("type")
            .and_then(IqType::parse)
            .ok_or_else(|| StanzaBuildError::bad_request("iq must have a valid 'type' attribute"))?;

        let child_count = element.children().len();
        match iq_type {
            IqType::Get | IqType::Set if child_count != 1 => {
                return Err(StanzaBuildError::bad_request(
                    "iq of type get/set must contain one and only one child element",
                ));
            }
            IqType::Result if child_count > 1 => {
                return Err(StanzaBuildError::bad_request(
                    "iq of type result must include zero or one child element",
                ));
            }
            _ => {}
        }

        Ok(Self {
            element: canonical_element(element, &from, &to),
            from,
            to,
            iq_type,
        })
    }

    /// A `get`/`set` request with a generated id.
    pub fn request(iq_type: IqType, from: Jid, to: Jid, payload: XElement) -> Self {
        let element = XElement::builder("iq")
            .attr("id", uuid::Uuid::new_v4().to_string())
            .attr("type", iq_type.as_str())
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .child(payload)
            .build();
        Self {
            element,
            from,
            to,
            iq_type,
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

    pub fn id(&self) -> &str {
        self.element.attr("id").unwrap_or_default()
    }

    pub fn iq_type(&self) -> IqType {
        self.iq_type
    }

    pub fn is_get(&self) -> bool {
        self.iq_type == IqType::Get
    }

    pub fn is_set(&self) -> bool {
        self.iq_type == IqType::Set
    }

    pub fn is_request(&self) -> bool {
        matches!(self.iq_type, IqType::Get | IqType::Set)
    }

    /// The single payload child of a request, or the optional one of a result.
    pub fn payload(&self) -> Option<&XElement> {
        self.element.children().iter().find(|c| c.name() != "error")
    }

    /// Payload with the given name and namespace.
    pub fn payload_ns(&self, name: &str, namespace: &str) -> Option<&XElement> {
        self.element.child_ns(name, namespace)
    }

    /// An empty `result` answering this request.
    pub fn result(&self) -> Iq {
        self.build_result(None)
    }

    /// A `result` answering this request carrying `payload`.
    pub fn result_with(&self, payload: XElement) -> Iq {
        self.build_result(Some(payload))
    }

    fn build_result(&self, payload: Option<XElement>) -> Iq {
        let mut builder = XElement::builder("iq")
            .attr("id", self.id())
            .attr("type", IqType::Result.as_str())
            .attr("from", self.to.to_string())
            .attr("to", self.from.to_string());
        if let Some(payload) = payload {
            builder = builder.child(payload);
        }
        Iq {
            element: builder.build(),
            from: self.to.clone(),
            to: self.from.clone(),
            iq_type: IqType::Result,
        }
    }

    /// The same stanza readdressed.
    pub fn readdressed(&self, from: Jid, to: Jid) -> Iq {
        Iq {
            element: canonical_element(self.element.clone(), &from, &to),
            from,
            to,
            iq_type: self.iq_type,
        }
    }
}

impl ErrorReply for Iq {
    fn error_reply(&self, condition: StanzaErrorCondition) -> Self {
        Iq {
            element: error_element(&self.element, condition),
            from: self.to.clone(),
            to: self.from.clone(),
            iq_type: IqType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn ping() -> XElement {
        XElement::builder("ping").attr("xmlns", "urn:xmpp:ping").build()
    }

    #[test]
    fn test_iq_without_id_rejected() {
        let el = XElement::builder("iq").attr("type", "get").child(ping()).build();
        let err = Iq::new(el, jid("a@b/c"), jid("b")).unwrap_err();
        assert_eq!(err.condition, StanzaErrorCondition::BadRequest);
    }

    #[test]
    fn test_iq_get_child_count() {
        let none = XElement::builder("iq").attr("id", "1").attr("type", "get").build();
        assert!(Iq::new(none, jid("a@b/c"), jid("b")).is_err());

        let two = XElement::builder("iq")
            .attr("id", "1")
            .attr("type", "set")
            .child(ping())
            .child(ping())
            .build();
        assert!(Iq::new(two, jid("a@b/c"), jid("b")).is_err());

        let result = XElement::builder("iq").attr("id", "1").attr("type", "result").build();
        assert!(Iq::new(result, jid("a@b/c"), jid("b")).is_ok());
    }

    #[test]
    fn test_iq_invalid_type() {
        let el = XElement::builder("iq")
            .attr("id", "1")
            .attr("type", "fetch")
            .child(ping())
            .build();
        assert!(Iq::new(el, jid("a@b/c"), jid("b")).is_err());
    }

    #[test]
    fn test_iq_canonical_addressing() {
        let el = XElement::builder("iq")
            .attr("xmlns", "jabber:client")
            .attr("id", "1")
            .attr("type", "get")
            .child(ping())
            .build();
        let iq = Iq::new(el, jid("ortuman@jackal.im/balcony"), jid("jackal.im")).unwrap();
        assert_eq!(iq.element().namespace(), None);
        assert_eq!(iq.element().attr("from"), Some("ortuman@jackal.im/balcony"));
        assert_eq!(iq.element().attr("to"), Some("jackal.im"));
    }

    #[test]
    fn test_result_swaps_addresses() {
        let el = XElement::builder("iq")
            .attr("id", "abc")
            .attr("type", "get")
            .child(ping())
            .build();
        let iq = Iq::new(el, jid("ortuman@jackal.im/balcony"), jid("jackal.im")).unwrap();
        let result = iq.result();
        assert_eq!(result.id(), "abc");
        assert_eq!(result.iq_type(), IqType::Result);
        assert_eq!(result.to().to_string(), "ortuman@jackal.im/balcony");
        assert!(result.element().children().is_empty());

        let err = iq.service_unavailable();
        assert_eq!(err.iq_type(), IqType::Error);
        assert_eq!(err.from().to_string(), "jackal.im");
        assert_eq!(
            err.element().child("error").unwrap().attr("code"),
            Some("503")
        );
    }
}
