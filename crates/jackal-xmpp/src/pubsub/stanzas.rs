//! PubSub stanza parsing and building.

use crate::error::StanzaErrorCondition;
use crate::stanza::Iq;
use crate::storage::PubSubItem;
use crate::xml::{ns, XElement};

/// An item as submitted by a publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedItem {
    /// Server generates one when absent.
    pub id: Option<String>,
    pub payload: Option<XElement>,
}

/// Parsed PubSub request types.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubRequest {
    Create {
        node: String,
        /// Submitted `<configure/>` form, if any.
        config: Option<XElement>,
    },
    Configure {
        node: String,
        form: XElement,
    },
    /// Owner request for the current configuration form.
    ConfigureGet {
        node: String,
    },
    Publish {
        node: String,
        item: PublishedItem,
    },
    Items {
        node: String,
        max_items: Option<usize>,
        item_ids: Vec<String>,
    },
    Retract {
        node: String,
        item_id: String,
        notify: bool,
    },
    Subscribe {
        node: String,
        jid: String,
    },
    Unsubscribe {
        node: String,
        jid: String,
    },
    Delete {
        node: String,
    },
}

impl PubSubRequest {
    pub fn node(&self) -> &str {
        match self {
            PubSubRequest::Create { node, .. }
            | PubSubRequest::Configure { node, .. }
            | PubSubRequest::ConfigureGet { node }
            | PubSubRequest::Publish { node, .. }
            | PubSubRequest::Items { node, .. }
            | PubSubRequest::Retract { node, .. }
            | PubSubRequest::Subscribe { node, .. }
            | PubSubRequest::Unsubscribe { node, .. }
            | PubSubRequest::Delete { node } => node,
        }
    }

    /// Whether only the node owner may issue this request.
    pub fn requires_owner(&self) -> bool {
        !matches!(
            self,
            PubSubRequest::Items { .. } | PubSubRequest::Subscribe { .. } | PubSubRequest::Unsubscribe { .. }
        )
    }
}

fn node_attr(el: &XElement) -> Result<String, StanzaErrorCondition> {
    match el.attr("node") {
        Some(node) if !node.is_empty() => Ok(node.to_string()),
        _ => Err(StanzaErrorCondition::BadRequest),
    }
}

fn jid_attr(el: &XElement) -> Result<String, StanzaErrorCondition> {
    el.attr("jid")
        .map(String::from)
        .ok_or(StanzaErrorCondition::BadRequest)
}

fn parse_owner(iq: &Iq, pubsub: &XElement) -> Result<PubSubRequest, StanzaErrorCondition> {
    if let Some(configure) = pubsub.child("configure") {
        let node = node_attr(configure)?;
        if iq.is_get() {
            return Ok(PubSubRequest::ConfigureGet { node });
        }
        let form = configure.child("x").cloned().ok_or(StanzaErrorCondition::BadRequest)?;
        return Ok(PubSubRequest::Configure { node, form });
    }
    if let Some(delete) = pubsub.child("delete").filter(|_| iq.is_set()) {
        return Ok(PubSubRequest::Delete {
            node: node_attr(delete)?,
        });
    }
    Err(StanzaErrorCondition::FeatureNotImplemented)
}

/// Parse a PubSub IQ stanza into a structured request.
pub fn parse_pubsub_iq(iq: &Iq) -> Result<PubSubRequest, StanzaErrorCondition> {
    if let Some(pubsub) = iq.payload_ns("pubsub", ns::PUBSUB_OWNER) {
        return parse_owner(iq, pubsub);
    }
    let pubsub = iq
        .payload_ns("pubsub", ns::PUBSUB)
        .ok_or(StanzaErrorCondition::BadRequest)?;

    if iq.is_get() {
        let items = pubsub.child("items").ok_or(StanzaErrorCondition::FeatureNotImplemented)?;
        return Ok(PubSubRequest::Items {
            node: node_attr(items)?,
            max_items: items.attr("max_items").and_then(|s| s.parse().ok()),
            item_ids: items
                .children_named("item")
                .filter_map(|c| c.attr("id").map(String::from))
                .collect(),
        });
    }

    if let Some(create) = pubsub.child("create") {
        let config = pubsub
            .child("configure")
            .and_then(|c| c.child("x"))
            .cloned();
        return Ok(PubSubRequest::Create {
            node: node_attr(create)?,
            config,
        });
    }
    if let Some(publish) = pubsub.child("publish") {
        let item = publish.child("item");
        return Ok(PubSubRequest::Publish {
            node: node_attr(publish)?,
            item: PublishedItem {
                id: item.and_then(|i| i.attr("id")).map(String::from),
                payload: item.and_then(|i| i.children().first()).cloned(),
            },
        });
    }
    if let Some(retract) = pubsub.child("retract") {
        let item_id = retract
            .child("item")
            .and_then(|i| i.attr("id"))
            .ok_or(StanzaErrorCondition::BadRequest)?;
        return Ok(PubSubRequest::Retract {
            node: node_attr(retract)?,
            item_id: item_id.to_string(),
            notify: matches!(retract.attr("notify"), Some("true" | "1")),
        });
    }
    if let Some(subscribe) = pubsub.child("subscribe") {
        return Ok(PubSubRequest::Subscribe {
            node: node_attr(subscribe)?,
            jid: jid_attr(subscribe)?,
        });
    }
    if let Some(unsubscribe) = pubsub.child("unsubscribe") {
        return Ok(PubSubRequest::Unsubscribe {
            node: node_attr(unsubscribe)?,
            jid: jid_attr(unsubscribe)?,
        });
    }
    Err(StanzaErrorCondition::FeatureNotImplemented)
}

fn item_element(item: &PubSubItem, with_payload: bool) -> XElement {
    let builder = XElement::builder("item").attr("id", item.id.as_str());
    if with_payload {
        builder.child(item.payload.clone()).build()
    } else {
        builder.build()
    }
}

fn pubsub_element(namespace: &str, child: XElement) -> XElement {
    XElement::builder("pubsub").attr("xmlns", namespace).child(child).build()
}

/// `<pubsub><items node=.../></pubsub>` answer to an items request.
pub fn items_result(node: &str, items: &[PubSubItem]) -> XElement {
    pubsub_element(
        ns::PUBSUB,
        XElement::builder("items")
            .attr("node", node)
            .children(items.iter().map(|i| item_element(i, true)))
            .build(),
    )
}

pub fn publish_result(node: &str, item_id: &str) -> XElement {
    pubsub_element(
        ns::PUBSUB,
        XElement::builder("publish")
            .attr("node", node)
            .child(XElement::builder("item").attr("id", item_id).build())
            .build(),
    )
}

pub fn subscription_result(node: &str, jid: &str, subid: &str) -> XElement {
    pubsub_element(
        ns::PUBSUB,
        XElement::builder("subscription")
            .attr("node", node)
            .attr("jid", jid)
            .attr("subid", subid)
            .attr("subscription", "subscribed")
            .build(),
    )
}

pub fn configure_result(node: &str, form: XElement) -> XElement {
    pubsub_element(
        ns::PUBSUB_OWNER,
        XElement::builder("configure").attr("node", node).child(form).build(),
    )
}

fn event(child: XElement) -> XElement {
    XElement::builder("event").attr("xmlns", ns::PUBSUB_EVENT).child(child).build()
}

/// Event payload announcing a published item.
pub fn items_event(node: &str, item: &PubSubItem, with_payload: bool) -> XElement {
    event(
        XElement::builder("items")
            .attr("node", node)
            .child(item_element(item, with_payload))
            .build(),
    )
}

pub fn retract_event(node: &str, item_id: &str) -> XElement {
    event(
        XElement::builder("items")
            .attr("node", node)
            .child(XElement::builder("retract").attr("id", item_id).build())
            .build(),
    )
}

pub fn delete_event(node: &str) -> XElement {
    event(XElement::builder("delete").attr("node", node).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;

    fn pubsub_iq(iq_type: &str, namespace: &str, child: XElement) -> Iq {
        let el = XElement::builder("iq")
            .attr("id", "ps1")
            .attr("type", iq_type)
            .child(pubsub_element(namespace, child))
            .build();
        Iq::new(
            el,
            Jid::parse("juliet@jackal.im/balcony").unwrap(),
            Jid::parse("juliet@jackal.im").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_publish() {
        let tune = XElement::builder("tune").attr("xmlns", "http://jabber.org/protocol/tune").build();
        let publish = XElement::builder("publish")
            .attr("node", "http://jabber.org/protocol/tune")
            .child(XElement::builder("item").attr("id", "current").child(tune.clone()).build())
            .build();
        let request = parse_pubsub_iq(&pubsub_iq("set", ns::PUBSUB, publish)).unwrap();
        assert_eq!(
            request,
            PubSubRequest::Publish {
                node: "http://jabber.org/protocol/tune".to_string(),
                item: PublishedItem {
                    id: Some("current".to_string()),
                    payload: Some(tune),
                },
            }
        );
        assert!(request.requires_owner());
    }

    #[test]
    fn test_parse_items_with_max() {
        let items = XElement::builder("items").attr("node", "n").attr("max_items", "2").build();
        let request = parse_pubsub_iq(&pubsub_iq("get", ns::PUBSUB, items)).unwrap();
        assert_eq!(
            request,
            PubSubRequest::Items {
                node: "n".to_string(),
                max_items: Some(2),
                item_ids: Vec::new(),
            }
        );
        assert!(!request.requires_owner());
    }

    #[test]
    fn test_parse_owner_delete() {
        let delete = XElement::builder("delete").attr("node", "n").build();
        let request = parse_pubsub_iq(&pubsub_iq("set", ns::PUBSUB_OWNER, delete)).unwrap();
        assert_eq!(request, PubSubRequest::Delete { node: "n".to_string() });
    }

    #[test]
    fn test_missing_node_is_bad_request() {
        let subscribe = XElement::builder("subscribe").attr("jid", "juliet@jackal.im").build();
        assert_eq!(
            parse_pubsub_iq(&pubsub_iq("set", ns::PUBSUB, subscribe)),
            Err(StanzaErrorCondition::BadRequest)
        );
    }

    #[test]
    fn test_unsupported_operation() {
        let options = XElement::builder("options").attr("node", "n").build();
        assert_eq!(
            parse_pubsub_iq(&pubsub_iq("set", ns::PUBSUB, options)),
            Err(StanzaErrorCondition::FeatureNotImplemented)
        );
    }
}
