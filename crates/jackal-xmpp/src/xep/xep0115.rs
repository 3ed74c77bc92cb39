//! XEP-0115: Entity Capabilities
//!
//! Clients advertise a `<c node ver hash/>` element in presence. The first
//! time a `(node, ver)` pair is seen the server asks the advertising entity
//! for its disco#info, checks the answer against `ver` and stores the
//! features so later presences with the same pair need no query.
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0115.html>

use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::disco::Identity;
use crate::stanza::Caps;
use crate::xml::{ns, XElement};

/// The `node#ver` string a caps disco#info query is addressed to.
pub fn caps_node(caps: &Caps) -> String {
    format!("{}#{}", caps.node, caps.ver)
}

/// disco#info query for the advertised capabilities.
pub fn disco_info_query(caps: &Caps) -> XElement {
    XElement::builder("query")
        .attr("xmlns", ns::DISCO_INFO)
        .attr("node", caps_node(caps))
        .build()
}

/// Feature vars of a disco#info answer.
pub fn features_from_info(query: &XElement) -> BTreeSet<String> {
    query
        .children_named("feature")
        .filter_map(|f| f.attr("var"))
        .map(String::from)
        .collect()
}

fn identities_from_info(query: &XElement) -> Vec<Identity> {
    query
        .children_named("identity")
        .map(|el| Identity {
            category: el.attr("category").unwrap_or_default().to_string(),
            kind: el.attr("type").unwrap_or_default().to_string(),
            lang: el.attr("xml:lang").unwrap_or_default().to_string(),
            name: el.attr("name").unwrap_or_default().to_string(),
        })
        .collect()
}

/// Build the verification string (XEP-0115 Section 5.1), without extended
/// data forms.
fn verification_string(identities: &[Identity], features: &BTreeSet<String>) -> String {
    let mut sorted: Vec<_> = identities.iter().collect();
    sorted.sort_by(|a, b| (&a.category, &a.kind, &a.lang).cmp(&(&b.category, &b.kind, &b.lang)));

    let mut s = String::new();
    for id in sorted {
        s.push_str(&format!("{}/{}/{}/{}<", id.category, id.kind, id.lang, id.name));
    }
    // BTreeSet iterates in byte order, which is what the algorithm sorts by.
    for feature in features {
        s.push_str(feature);
        s.push('<');
    }
    s
}

/// SHA-1 `ver` value of a disco#info answer.
pub fn compute_ver(query: &XElement) -> String {
    let s = verification_string(&identities_from_info(query), &features_from_info(query));
    BASE64.encode(Sha1::digest(s.as_bytes()))
}

/// Whether a disco#info answer matches the advertised caps. Hashes other
/// than SHA-1 are taken on trust.
pub fn verify(caps: &Caps, query: &XElement) -> bool {
    if caps.hash != "sha-1" {
        return true;
    }
    compute_ver(query) == caps.ver
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The simple example of XEP-0115 Section 5.2.
    fn exodus_info() -> XElement {
        XElement::builder("query")
            .attr("xmlns", ns::DISCO_INFO)
            .child(
                XElement::builder("identity")
                    .attr("category", "client")
                    .attr("type", "pc")
                    .attr("name", "Exodus 0.9.1")
                    .build(),
            )
            .children(
                [
                    "http://jabber.org/protocol/caps",
                    "http://jabber.org/protocol/disco#info",
                    "http://jabber.org/protocol/disco#items",
                    "http://jabber.org/protocol/muc",
                ]
                .into_iter()
                .map(|var| XElement::builder("feature").attr("var", var).build()),
            )
            .build()
    }

    #[test]
    fn test_compute_ver_matches_xep_example() {
        assert_eq!(compute_ver(&exodus_info()), "QgayPKawpkPSDYmwT/WM94uAlu0=");
    }

    #[test]
    fn test_verify() {
        let mut caps = Caps {
            node: "http://code.google.com/p/exodus".to_string(),
            ver: "QgayPKawpkPSDYmwT/WM94uAlu0=".to_string(),
            hash: "sha-1".to_string(),
        };
        assert!(verify(&caps, &exodus_info()));
        caps.ver = "bogus".to_string();
        assert!(!verify(&caps, &exodus_info()));
        assert_eq!(caps_node(&caps), "http://code.google.com/p/exodus#bogus");
    }

    #[test]
    fn test_features_from_info() {
        let features = features_from_info(&exodus_info());
        assert_eq!(features.len(), 4);
        assert!(features.contains("http://jabber.org/protocol/muc"));
    }
}
