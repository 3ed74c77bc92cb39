//! XML element model.
//!
//! [`XElement`] is an immutable value: a name, an ordered attribute set, an
//! ordered child list and the character data that belongs directly to the
//! node. Mutation goes through [`ElementBuilder`].

use std::fmt;

use quick_xml::escape::escape;

pub mod binary;
pub mod parser;

pub use parser::{Parser, ParserError, ParsingMode};

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// WebSocket framing namespace (RFC 7395)
    pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Server dialback namespace (XEP-0220)
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Dialback stream feature
    pub const DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Roster versioning stream feature (XEP-0237)
    pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";
    /// Entity capabilities (XEP-0115)
    pub const CAPS: &str = "http://jabber.org/protocol/caps";
    /// Service discovery info (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Blocking command (XEP-0191)
    pub const BLOCKING: &str = "urn:xmpp:blocking";
    /// Private XML storage (XEP-0049)
    pub const PRIVATE: &str = "jabber:iq:private";
    /// vCard (XEP-0054)
    pub const VCARD: &str = "vcard-temp";
    /// Software version (XEP-0092)
    pub const VERSION: &str = "jabber:iq:version";
    /// Ping (XEP-0199)
    pub const PING: &str = "urn:xmpp:ping";
    /// Delayed delivery (XEP-0203)
    pub const DELAY: &str = "urn:xmpp:delay";
    /// Offline message retrieval marker (XEP-0160 feature)
    pub const OFFLINE: &str = "msgoffline";
    /// Publish-subscribe (XEP-0060)
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    /// Publish-subscribe owner use cases
    pub const PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
    /// Publish-subscribe event notifications
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    /// Data forms (XEP-0004)
    pub const DATA_FORMS: &str = "jabber:x:data";
    /// External component protocol (XEP-0114)
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
}

/// An attribute label/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub label: String,
    pub value: String,
}

/// Immutable XML node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XElement {
    name: String,
    attributes: Vec<Attribute>,
    children: Vec<XElement>,
    text: String,
}

impl XElement {
    /// An empty element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: String::new(),
        }
    }

    /// Start building an element.
    pub fn builder(name: impl Into<String>) -> ElementBuilder {
        ElementBuilder {
            element: Self::new(name),
        }
    }

    pub(crate) fn from_parts(
        name: String,
        attributes: Vec<Attribute>,
        children: Vec<XElement>,
        text: String,
    ) -> Self {
        Self {
            name,
            attributes,
            children,
            text,
        }
    }

    /// Copy this element into a builder for modification.
    pub fn to_builder(&self) -> ElementBuilder {
        ElementBuilder {
            element: self.clone(),
        }
    }

    /// Consume this element into a builder for modification.
    pub fn into_builder(self) -> ElementBuilder {
        ElementBuilder { element: self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn children(&self) -> &[XElement] {
        &self.children
    }

    /// First attribute value with the given label.
    pub fn attr(&self, label: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.label == label)
            .map(|a| a.value.as_str())
    }

    /// The `xmlns` attribute.
    pub fn namespace(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&XElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name and namespace.
    pub fn child_ns(&self, name: &str, namespace: &str) -> Option<&XElement> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace() == Some(namespace))
    }

    /// All children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// True for `iq`, `message` and `presence`.
    pub fn is_stanza(&self) -> bool {
        matches!(self.name.as_str(), "iq" | "message" | "presence")
    }

    /// True for `iq`.
    pub fn is_iq(&self) -> bool {
        self.name == "iq"
    }

    /// True for `message`.
    pub fn is_message(&self) -> bool {
        self.name == "message"
    }

    /// True for `presence`.
    pub fn is_presence(&self) -> bool {
        self.name == "presence"
    }

    /// Write the opening tag only, optionally self-closed.
    ///
    /// Stream openers are written this way since their closing tag comes at
    /// the end of the session.
    pub fn write_open_tag(&self, out: &mut String, self_closing: bool) {
        out.push('<');
        out.push_str(&self.name);
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.label);
            out.push_str("=\"");
            out.push_str(&escape(attr.value.as_str()));
            out.push('"');
        }
        if self_closing {
            out.push_str("/>");
        } else {
            out.push('>');
        }
    }

    fn write_to(&self, out: &mut String) {
        if self.children.is_empty() && self.text.is_empty() {
            self.write_open_tag(out, true);
            return;
        }
        self.write_open_tag(out, false);
        if !self.text.is_empty() {
            out.push_str(&escape(self.text.as_str()));
        }
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for XElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        f.write_str(&out)
    }
}

/// Typed builder for [`XElement`].
#[derive(Debug, Clone)]
pub struct ElementBuilder {
    element: XElement,
}

impl ElementBuilder {
    /// Set an attribute, replacing the value in place if the label exists.
    pub fn attr(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(label, value);
        self
    }

    /// Set an attribute only when a value is given.
    pub fn attr_opt(self, label: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(label, v),
            None => self,
        }
    }

    pub(crate) fn set_attr(&mut self, label: impl Into<String>, value: impl Into<String>) {
        let label = label.into();
        let value = value.into();
        match self.element.attributes.iter_mut().find(|a| a.label == label) {
            Some(existing) => existing.value = value,
            None => self.element.attributes.push(Attribute { label, value }),
        }
    }

    /// Remove an attribute if present.
    pub fn remove_attr(mut self, label: &str) -> Self {
        self.element.attributes.retain(|a| a.label != label);
        self
    }

    /// Append a child.
    pub fn child(mut self, child: XElement) -> Self {
        self.element.children.push(child);
        self
    }

    /// Append several children.
    pub fn children(mut self, children: impl IntoIterator<Item = XElement>) -> Self {
        self.element.children.extend(children);
        self
    }

    /// Remove every child with the given name.
    pub fn remove_children(mut self, name: &str) -> Self {
        self.element.children.retain(|c| c.name != name);
        self
    }

    /// Drop all children.
    pub fn clear_children(mut self) -> Self {
        self.element.children.clear();
        self
    }

    /// Replace the character data.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.text = text.into();
        self
    }

    pub fn build(self) -> XElement {
        self.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_replaced_in_place() {
        let el = XElement::builder("iq")
            .attr("id", "1")
            .attr("type", "get")
            .attr("id", "2")
            .build();
        assert_eq!(el.attributes().len(), 2);
        assert_eq!(el.attributes()[0].label, "id");
        assert_eq!(el.attr("id"), Some("2"));
    }

    #[test]
    fn test_serialize_escapes() {
        let el = XElement::builder("body")
            .attr("note", "a\"b<")
            .text("x < y & z")
            .build();
        assert_eq!(
            el.to_string(),
            "<body note=\"a&quot;b&lt;\">x &lt; y &amp; z</body>"
        );
    }

    #[test]
    fn test_child_order_preserved() {
        let el = XElement::builder("query")
            .child(XElement::new("b"))
            .child(XElement::new("a"))
            .child(XElement::new("c"))
            .build();
        assert_eq!(el.to_string(), "<query><b/><a/><c/></query>");
    }

    #[test]
    fn test_open_tag() {
        let el = XElement::builder("stream:stream")
            .attr("xmlns", ns::JABBER_CLIENT)
            .build();
        let mut out = String::new();
        el.write_open_tag(&mut out, false);
        assert_eq!(out, "<stream:stream xmlns=\"jabber:client\">");
    }

    #[test]
    fn test_child_lookup() {
        let el = XElement::builder("iq")
            .child(XElement::builder("query").attr("xmlns", ns::ROSTER).build())
            .build();
        assert!(el.child_ns("query", ns::ROSTER).is_some());
        assert!(el.child_ns("query", ns::PRIVATE).is_none());
        assert!(el.is_stanza());
    }
}
