//! Service Discovery: disco#info handling.

use crate::xml::{ns, XElement};

/// Identity element of a disco#info answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g., "server", "account")
    pub category: String,
    /// Type (e.g., "im", "registered")
    pub kind: String,
    pub lang: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: &str, kind: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            kind: kind.to_string(),
            lang: String::new(),
            name: name.to_string(),
        }
    }

    /// Server identity (category="server", type="im").
    pub fn server(name: &str) -> Self {
        Self::new("server", "im", name)
    }

    /// Registered account identity (category="account", type="registered").
    pub fn account() -> Self {
        Self::new("account", "registered", "")
    }

    /// PEP service identity (category="pubsub", type="pep").
    pub fn pep() -> Self {
        Self::new("pubsub", "pep", "")
    }

    fn to_element(&self) -> XElement {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        XElement::builder("identity")
            .attr("category", self.category.as_str())
            .attr("type", self.kind.as_str())
            .attr_opt("xml:lang", non_empty(&self.lang))
            .attr_opt("name", non_empty(&self.name))
            .build()
    }
}

/// Build a disco#info `<query/>` with identities first, then features.
pub fn info_query<'a>(
    identities: &[Identity],
    features: impl IntoIterator<Item = &'a str>,
    node: Option<&str>,
) -> XElement {
    XElement::builder("query")
        .attr("xmlns", ns::DISCO_INFO)
        .attr_opt("node", node)
        .children(identities.iter().map(Identity::to_element))
        .children(
            features
                .into_iter()
                .map(|var| XElement::builder("feature").attr("var", var).build()),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_query() {
        let query = info_query(&[Identity::server("jackal")], [ns::DISCO_INFO, ns::PING], None);
        assert_eq!(query.namespace(), Some(ns::DISCO_INFO));
        assert!(query.attr("node").is_none());

        let identity = query.child("identity").unwrap();
        assert_eq!(identity.attr("category"), Some("server"));
        assert_eq!(identity.attr("type"), Some("im"));
        assert_eq!(identity.attr("name"), Some("jackal"));

        let features: Vec<_> = query.children_named("feature").filter_map(|f| f.attr("var")).collect();
        assert_eq!(features, vec![ns::DISCO_INFO, ns::PING]);
    }

    #[test]
    fn test_account_identity_has_no_name() {
        let query = info_query(&[Identity::account()], std::iter::empty(), Some("n"));
        assert_eq!(query.attr("node"), Some("n"));
        assert!(query.child("identity").unwrap().attr("name").is_none());
    }
}
