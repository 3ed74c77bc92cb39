//! Service Discovery: disco#items handling.

use crate::xml::{ns, XElement};

/// Item element of a disco#items answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    pub jid: String,
    pub name: Option<String>,
    pub node: Option<String>,
}

impl DiscoItem {
    /// A node hosted at `jid`.
    pub fn node(jid: &str, node: &str) -> Self {
        Self {
            jid: jid.to_string(),
            name: None,
            node: Some(node.to_string()),
        }
    }
}

pub fn items_query(items: &[DiscoItem], node: Option<&str>) -> XElement {
    XElement::builder("query")
        .attr("xmlns", ns::DISCO_ITEMS)
        .attr_opt("node", node)
        .children(items.iter().map(|item| {
            XElement::builder("item")
                .attr("jid", item.jid.as_str())
                .attr_opt("name", item.name.as_deref())
                .attr_opt("node", item.node.as_deref())
                .build()
        }))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_query() {
        let query = items_query(&[DiscoItem::node("juliet@jackal.im", "urn:xmpp:avatar:data")], None);
        let item = query.child("item").unwrap();
        assert_eq!(item.attr("jid"), Some("juliet@jackal.im"));
        assert_eq!(item.attr("node"), Some("urn:xmpp:avatar:data"));
        assert!(item.attr("name").is_none());
    }
}
