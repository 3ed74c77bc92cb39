//! XEP-0049: Private XML Storage
//!
//! Lets a user store arbitrary XML on the server, keyed by the namespace of
//! the stored element. Only the account owner can read or write it.
//!
//! ```xml
//! <iq type='set' id='p1'>
//!   <query xmlns='jabber:iq:private'>
//!     <exodus xmlns='exodus:prefs'><defaultnick>Hamlet</defaultnick></exodus>
//!   </query>
//! </iq>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StanzaErrorCondition;
use crate::modules::{reply, IqHandler};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq, IqType};
use crate::xml::{ns, XElement};

/// Stored elements of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateRequest {
    /// Fetch the element stored under each `(name, namespace)`.
    Get(Vec<(String, String)>),
    Set(Vec<XElement>),
}

/// Parse a private storage IQ.
pub fn parse_private_iq(iq: &Iq) -> Result<PrivateRequest, StanzaErrorCondition> {
    let query = iq
        .payload_ns("query", ns::PRIVATE)
        .ok_or(StanzaErrorCondition::BadRequest)?;
    let children = query.children();
    if children.is_empty() {
        return Err(StanzaErrorCondition::NotAcceptable);
    }
    for child in children {
        // Namespaces of the protocol itself cannot be used as keys.
        match child.namespace() {
            None => return Err(StanzaErrorCondition::BadRequest),
            Some(namespace) if namespace.starts_with("jabber:") => {
                return Err(StanzaErrorCondition::NotAcceptable)
            }
            Some(_) => {}
        }
    }
    match iq.iq_type() {
        IqType::Get => Ok(PrivateRequest::Get(
            children
                .iter()
                .filter_map(|c| Some((c.name().to_string(), c.namespace()?.to_string())))
                .collect(),
        )),
        IqType::Set => Ok(PrivateRequest::Set(children.to_vec())),
        _ => Err(StanzaErrorCondition::BadRequest),
    }
}

pub struct PrivateStorage {
    router: Arc<Router>,
}

impl PrivateStorage {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    async fn handle(&self, iq: &Iq, request: PrivateRequest) -> Iq {
        let storage = self.router.storage();
        let username = iq.from().node();
        match request {
            PrivateRequest::Get(keys) => {
                let mut elements = Vec::with_capacity(keys.len());
                for (name, namespace) in keys {
                    match storage.fetch_private(username, &namespace).await {
                        Ok(Some(element)) => elements.push(element),
                        Ok(None) => elements.push(XElement::builder(name).attr("xmlns", namespace).build()),
                        Err(e) => {
                            warn!(username, error = %e, "Failed to fetch private storage");
                            return iq.internal_server_error();
                        }
                    }
                }
                iq.result_with(
                    XElement::builder("query")
                        .attr("xmlns", ns::PRIVATE)
                        .children(elements)
                        .build(),
                )
            }
            PrivateRequest::Set(elements) => {
                for element in elements {
                    let namespace = element.namespace().unwrap_or_default().to_string();
                    if let Err(e) = storage.upsert_private(username, &namespace, &element).await {
                        warn!(username, error = %e, "Failed to store private storage");
                        return iq.internal_server_error();
                    }
                }
                iq.result()
            }
        }
    }
}

#[async_trait]
impl IqHandler for PrivateStorage {
    fn name(&self) -> &'static str {
        "private"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::PRIVATE]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_request() && iq.payload_ns("query", ns::PRIVATE).is_some()
    }

    async fn process_iq(&self, iq: &Iq) {
        let to = iq.to();
        let response = if !(to.resource().is_empty() && to.matches_bare(iq.from())) {
            iq.forbidden()
        } else {
            match parse_private_iq(iq) {
                Ok(request) => self.handle(iq, request).await,
                Err(condition) => iq.error_reply(condition),
            }
        };
        reply(&self.router, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;

    fn private_iq(iq_type: &str, children: Vec<XElement>) -> Iq {
        let query = XElement::builder("query")
            .attr("xmlns", ns::PRIVATE)
            .children(children)
            .build();
        let el = XElement::builder("iq")
            .attr("id", "p1")
            .attr("type", iq_type)
            .child(query)
            .build();
        Iq::new(
            el,
            Jid::parse("hamlet@jackal.im/castle").unwrap(),
            Jid::parse("hamlet@jackal.im").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_get() {
        let iq = private_iq("get", vec![XElement::builder("exodus").attr("xmlns", "exodus:prefs").build()]);
        assert_eq!(
            parse_private_iq(&iq),
            Ok(PrivateRequest::Get(vec![("exodus".to_string(), "exodus:prefs".to_string())]))
        );
    }

    #[test]
    fn test_rejects_reserved_namespace() {
        let iq = private_iq("set", vec![XElement::builder("query").attr("xmlns", "jabber:iq:roster").build()]);
        assert_eq!(parse_private_iq(&iq), Err(StanzaErrorCondition::NotAcceptable));
    }

    #[test]
    fn test_rejects_empty_query() {
        assert_eq!(
            parse_private_iq(&private_iq("get", vec![])),
            Err(StanzaErrorCondition::NotAcceptable)
        );
    }
}
