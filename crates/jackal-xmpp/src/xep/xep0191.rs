//! XEP-0191: Blocking Command
//!
//! ```xml
//! <iq type='set' id='block1'>
//!   <block xmlns='urn:xmpp:blocking'>
//!     <item jid='romeo@montague.net'/>
//!   </block>
//! </iq>
//! ```
//!
//! Block list enforcement itself happens in the router; this module keeps
//! the list, pushes changes to resources that retrieved it and makes the
//! user appear offline to newly blocked contacts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::modules::{deliver, reply, IqHandler};
use crate::router::{blocklist_matches, Router};
use crate::stanza::{ErrorReply, Iq, IqType, Presence, PresenceType};
use crate::storage::{BlockListItem, StorageError};
use crate::xml::{ns, XElement};

/// Stream context key set once a resource retrieved its block list.
pub const BLOCKLIST_REQUESTED: &str = "blocklist:requested";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockingRequest {
    Get,
    Block(Vec<Jid>),
    /// An empty list unblocks everything.
    Unblock(Vec<Jid>),
}

pub fn parse_blocking_iq(iq: &Iq) -> Result<BlockingRequest, StanzaErrorCondition> {
    let payload = iq.payload().ok_or(StanzaErrorCondition::BadRequest)?;
    if payload.namespace() != Some(ns::BLOCKING) {
        return Err(StanzaErrorCondition::BadRequest);
    }
    let jids = || -> Result<Vec<Jid>, StanzaErrorCondition> {
        payload
            .children_named("item")
            .map(|item| {
                let jid = item.attr("jid").ok_or(StanzaErrorCondition::BadRequest)?;
                Jid::parse(jid).map_err(|_| StanzaErrorCondition::JidMalformed)
            })
            .collect()
    };
    match (iq.iq_type(), payload.name()) {
        (IqType::Get, "blocklist") => Ok(BlockingRequest::Get),
        (IqType::Set, "block") => {
            let jids = jids()?;
            if jids.is_empty() {
                return Err(StanzaErrorCondition::BadRequest);
            }
            Ok(BlockingRequest::Block(jids))
        }
        (IqType::Set, "unblock") => Ok(BlockingRequest::Unblock(jids()?)),
        _ => Err(StanzaErrorCondition::BadRequest),
    }
}

fn items_element(name: &str, jids: impl IntoIterator<Item = String>) -> XElement {
    XElement::builder(name)
        .attr("xmlns", ns::BLOCKING)
        .children(
            jids.into_iter()
                .map(|jid| XElement::builder("item").attr("jid", jid).build()),
        )
        .build()
}

pub struct Blocking {
    router: Arc<Router>,
}

impl Blocking {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    async fn handle(&self, iq: &Iq, request: BlockingRequest) -> Result<Iq, StorageError> {
        let storage = self.router.storage();
        let username = iq.from().node();
        match request {
            BlockingRequest::Get => {
                let items = storage.fetch_blocklist_items(username).await?;
                if let Some(stream) = self.router.registry().stream(username, iq.from().resource()) {
                    stream.set_context_value(BLOCKLIST_REQUESTED, "true");
                }
                Ok(iq.result_with(items_element("blocklist", items.into_iter().map(|i| i.jid))))
            }
            BlockingRequest::Block(jids) => {
                for jid in &jids {
                    storage
                        .insert_blocklist_item(&BlockListItem {
                            username: username.to_string(),
                            jid: jid.to_string(),
                        })
                        .await?;
                }
                debug!(username, count = jids.len(), "JIDs blocked");
                self.send_unavailable(iq.from(), &jids).await?;
                self.push(username, items_element("block", jids.iter().map(Jid::to_string)))
                    .await;
                Ok(iq.result())
            }
            BlockingRequest::Unblock(jids) if jids.is_empty() => {
                storage.delete_blocklist_items(username).await?;
                debug!(username, "Block list cleared");
                self.push(username, items_element("unblock", std::iter::empty())).await;
                Ok(iq.result())
            }
            BlockingRequest::Unblock(jids) => {
                for jid in &jids {
                    storage
                        .delete_blocklist_item(&BlockListItem {
                            username: username.to_string(),
                            jid: jid.to_string(),
                        })
                        .await?;
                }
                debug!(username, count = jids.len(), "JIDs unblocked");
                self.push(username, items_element("unblock", jids.iter().map(Jid::to_string)))
                    .await;
                Ok(iq.result())
            }
        }
    }

    /// Push a block list change to every resource that retrieved the list.
    async fn push(&self, username: &str, change: XElement) {
        for stream in self.router.registry().streams(username) {
            if stream.context_value(BLOCKLIST_REQUESTED).as_deref() != Some("true") {
                continue;
            }
            let jid = stream.jid();
            let push = Iq::request(IqType::Set, jid.to_bare(), jid, change.clone());
            stream.send_element(push.into_element()).await;
        }
    }

    /// Contacts receiving our presence that are now blocked get an
    /// unavailable presence from each available resource.
    async fn send_unavailable(&self, user: &Jid, blocked: &[Jid]) -> Result<(), StorageError> {
        let items = self.router.storage().fetch_roster_items(user.node()).await?;
        let contacts: Vec<Jid> = items
            .iter()
            .filter(|item| item.subscription.has_from())
            .filter_map(|item| Jid::parse(&item.jid).ok())
            .filter(|contact| blocked.iter().any(|pattern| blocklist_matches(pattern, contact)))
            .collect();
        if contacts.is_empty() {
            return Ok(());
        }
        for stream in self.router.registry().streams(user.node()) {
            if !stream.presence().is_some_and(|p| p.is_available()) {
                continue;
            }
            for contact in &contacts {
                let presence = Presence::build(PresenceType::Unavailable, stream.jid(), contact.clone());
                deliver(&self.router, presence).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IqHandler for Blocking {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::BLOCKING]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_request() && iq.payload().is_some_and(|p| p.namespace() == Some(ns::BLOCKING))
    }

    #[instrument(skip_all, fields(from = %iq.from(), id = %iq.id()))]
    async fn process_iq(&self, iq: &Iq) {
        let to = iq.to();
        let response = if !(to.resource().is_empty() && to.matches_bare(iq.from())) {
            iq.forbidden()
        } else {
            match parse_blocking_iq(iq) {
                Ok(request) => match self.handle(iq, request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Block list operation failed");
                        iq.internal_server_error()
                    }
                },
                Err(condition) => iq.error_reply(condition),
            }
        };
        reply(&self.router, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocking_iq(iq_type: &str, payload: XElement) -> Iq {
        let el = XElement::builder("iq")
            .attr("id", "b1")
            .attr("type", iq_type)
            .child(payload)
            .build();
        Iq::new(
            el,
            Jid::parse("juliet@jackal.im/balcony").unwrap(),
            Jid::parse("juliet@jackal.im").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_block() {
        let iq = blocking_iq(
            "set",
            items_element("block", ["romeo@montague.net".to_string(), "capulet.lit".to_string()]),
        );
        let Ok(BlockingRequest::Block(jids)) = parse_blocking_iq(&iq) else {
            panic!("expected block request");
        };
        assert_eq!(jids.len(), 2);
        assert_eq!(jids[1].domain(), "capulet.lit");
    }

    #[test]
    fn test_block_requires_items() {
        let iq = blocking_iq("set", items_element("block", std::iter::empty()));
        assert_eq!(parse_blocking_iq(&iq), Err(StanzaErrorCondition::BadRequest));
    }

    #[test]
    fn test_unblock_all() {
        let iq = blocking_iq("set", items_element("unblock", std::iter::empty()));
        assert_eq!(parse_blocking_iq(&iq), Ok(BlockingRequest::Unblock(Vec::new())));
    }

    #[test]
    fn test_get_blocklist() {
        let iq = blocking_iq("get", items_element("blocklist", std::iter::empty()));
        assert_eq!(parse_blocking_iq(&iq), Ok(BlockingRequest::Get));
    }

    #[test]
    fn test_malformed_jid() {
        let iq = blocking_iq("set", items_element("block", ["@bad".to_string()]));
        assert_eq!(parse_blocking_iq(&iq), Err(StanzaErrorCondition::JidMalformed));
    }
}
