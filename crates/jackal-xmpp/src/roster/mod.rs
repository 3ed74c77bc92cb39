//! RFC 6121 Roster Management and roster versioning (XEP-0237).
//!
//! ## Operations
//!
//! - Roster get: the user's items, or an empty result when the client's
//!   `ver` is current
//! - Roster set: add, update or remove one item
//! - Roster push: every change is pushed to each resource that requested
//!   the roster
//! - Subscription presences update the items of both ends (see
//!   [`crate::presence::subscription`]); inbound requests are kept until
//!   answered and redelivered on initial presence
//!
//! ## XML Format
//!
//! ```xml
//! <iq type='get' id='roster-1'>
//!   <query xmlns='jabber:iq:roster' ver='3'/>
//! </iq>
//!
//! <iq type='set' id='push-1'>
//!   <query xmlns='jabber:iq:roster' ver='4'>
//!     <item jid='noelia@jackal.im' subscription='both'>
//!       <group>Friends</group>
//!     </item>
//!   </query>
//! </iq>
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::modules::{deliver, reply, IqHandler};
use crate::presence::subscription::{self, SubscriptionDirection};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq, IqType, Presence, PresenceType};
use crate::storage::{RosterItem, RosterNotification, StorageError, Subscription};
use crate::stream::C2sStream;
use crate::xml::{ns, XElement};

/// Stream context key set once a resource has requested its roster.
pub const ROSTER_REQUESTED: &str = "roster:requested";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Offer and honour roster versioning.
    pub versioning: bool,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self { versioning: true }
    }
}

/// A parsed roster IQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterRequest {
    Get { ver: Option<String> },
    Set(RosterUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUpdate {
    /// Bare JID of the contact.
    pub jid: Jid,
    pub name: String,
    pub groups: BTreeSet<String>,
    pub remove: bool,
}

/// Parse a roster get/set.
pub fn parse_roster_iq(iq: &Iq) -> Result<RosterRequest, StanzaErrorCondition> {
    let query = iq
        .payload_ns("query", ns::ROSTER)
        .ok_or(StanzaErrorCondition::BadRequest)?;
    match iq.iq_type() {
        IqType::Get => Ok(RosterRequest::Get {
            ver: query.attr("ver").map(String::from),
        }),
        IqType::Set => {
            let mut items = query.children_named("item");
            let item = items.next().ok_or(StanzaErrorCondition::BadRequest)?;
            if items.next().is_some() {
                return Err(StanzaErrorCondition::BadRequest);
            }
            let jid = item
                .attr("jid")
                .and_then(|j| Jid::parse(j).ok())
                .ok_or(StanzaErrorCondition::JidMalformed)?;
            Ok(RosterRequest::Set(RosterUpdate {
                jid: jid.to_bare(),
                name: item.attr("name").unwrap_or_default().to_string(),
                groups: item
                    .children_named("group")
                    .map(|g| g.text().to_string())
                    .filter(|g| !g.is_empty())
                    .collect(),
                remove: item.attr("subscription") == Some("remove"),
            }))
        }
        _ => Err(StanzaErrorCondition::BadRequest),
    }
}

/// Wire form of a roster item.
pub fn item_element(item: &RosterItem) -> XElement {
    let mut builder = XElement::builder("item")
        .attr("jid", item.jid.as_str())
        .attr("subscription", item.subscription.as_str());
    if !item.name.is_empty() {
        builder = builder.attr("name", item.name.as_str());
    }
    if item.ask {
        builder = builder.attr("ask", "subscribe");
    }
    builder
        .children(item.groups.iter().map(|g| XElement::builder("group").text(g.as_str()).build()))
        .build()
}

fn query_element(ver: Option<u64>, items: impl IntoIterator<Item = XElement>) -> XElement {
    XElement::builder("query")
        .attr("xmlns", ns::ROSTER)
        .attr_opt("ver", ver.map(|v| v.to_string()))
        .children(items)
        .build()
}

pub struct Roster {
    config: RosterConfig,
    router: Arc<Router>,
}

impl Roster {
    pub fn new(config: RosterConfig, router: Arc<Router>) -> Self {
        Self { config, router }
    }

    /// `<ver/>` stream feature, when versioning is on.
    pub fn stream_feature(&self) -> Option<XElement> {
        self.config
            .versioning
            .then(|| XElement::builder("ver").attr("xmlns", ns::ROSTER_VER).build())
    }

    async fn get_roster(&self, iq: &Iq, ver: Option<String>) -> Result<Iq, StorageError> {
        let user = iq.from();
        if let Some(stream) = self.router.registry().stream(user.node(), user.resource()) {
            stream.set_context_value(ROSTER_REQUESTED, "true");
        }
        let storage = self.router.storage();
        let version = storage.fetch_roster_version(user.node()).await?;
        if self.config.versioning && ver.as_deref() == Some(version.current.to_string().as_str()) {
            return Ok(iq.result());
        }
        let items = storage.fetch_roster_items(user.node()).await?;
        let ver = self.config.versioning.then_some(version.current);
        Ok(iq.result_with(query_element(ver, items.iter().map(item_element))))
    }

    async fn set_roster(&self, iq: &Iq, update: RosterUpdate) -> Result<Iq, StorageError> {
        let username = iq.from().node();
        let contact = update.jid.to_string();
        let storage = self.router.storage();

        if update.remove {
            let Some(mut item) = storage.fetch_roster_item(username, &contact).await? else {
                return Ok(iq.item_not_found());
            };
            let user = iq.from().to_bare();
            if item.subscription.has_to() || item.ask {
                self.send_subscription(PresenceType::Unsubscribe, &user, &update.jid).await;
            }
            if item.subscription.has_from() {
                self.send_subscription(PresenceType::Unsubscribed, &user, &update.jid).await;
            }
            let version = storage.delete_roster_item(username, &contact).await?;
            item.subscription = Subscription::Remove;
            item.ask = false;
            self.push(username, &item, version.current).await;
            info!(username, contact = %contact, "Roster item removed");
            return Ok(iq.result());
        }

        let mut item = storage
            .fetch_roster_item(username, &contact)
            .await?
            .unwrap_or_else(|| RosterItem::new(username, contact.as_str()));
        item.name = update.name;
        item.groups = update.groups;
        let version = storage.upsert_roster_item(&item).await?;
        self.push(username, &item, version.current).await;
        Ok(iq.result())
    }

    /// Push a changed item to every resource that requested the roster.
    async fn push(&self, username: &str, item: &RosterItem, version: u64) {
        let ver = self.config.versioning.then_some(version);
        for stream in self.router.registry().streams(username) {
            if stream.context_value(ROSTER_REQUESTED).as_deref() != Some("true") {
                continue;
            }
            let jid = stream.jid();
            let push = Iq::request(
                IqType::Set,
                jid.to_bare(),
                jid,
                query_element(ver, [item_element(item)]),
            );
            stream.send_element(push.into_element()).await;
        }
    }

    async fn store_and_push(&self, item: &RosterItem) {
        match self.router.storage().upsert_roster_item(item).await {
            Ok(version) => self.push(&item.username, item, version.current).await,
            Err(e) => warn!(username = %item.username, error = %e, "Failed to store roster item"),
        }
    }

    async fn send_subscription(&self, presence_type: PresenceType, from: &Jid, to: &Jid) {
        let presence = Presence::build(presence_type, from.clone(), to.clone());
        self.outbound(&presence).await;
    }

    /// Apply a subscription presence. Outbound presences come from a local
    /// user; inbound ones are addressed to a local user.
    #[instrument(skip_all, fields(from = %presence.from(), to = %presence.to(), presence_type = ?presence.presence_type()))]
    pub async fn process_subscription(&self, presence: &Presence, direction: SubscriptionDirection) {
        match direction {
            SubscriptionDirection::Outbound => self.outbound(presence).await,
            SubscriptionDirection::Inbound => self.inbound(presence).await,
        }
    }

    async fn outbound(&self, presence: &Presence) {
        let user = presence.from().to_bare();
        let contact = presence.to().to_bare();
        let presence_type = presence.presence_type();
        let storage = self.router.storage();

        let existing = match storage.fetch_roster_item(user.node(), &contact.to_string()).await {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Failed to fetch roster item");
                return;
            }
        };
        let item = match (existing, presence_type) {
            (Some(item), _) => Some(item),
            (None, PresenceType::Subscribe | PresenceType::Subscribed) => {
                Some(RosterItem::new(user.node(), contact.to_string()))
            }
            (None, _) => None,
        };
        if let Some(mut item) = item {
            if subscription::apply(&mut item, presence_type, SubscriptionDirection::Outbound) {
                self.store_and_push(&item).await;
            }
        }
        if matches!(presence_type, PresenceType::Subscribed | PresenceType::Unsubscribed) {
            if let Err(e) = storage
                .delete_roster_notification(&contact.to_string(), user.node())
                .await
            {
                warn!(error = %e, "Failed to delete roster notification");
            }
        }

        // Subscription stanzas always travel between bare JIDs.
        let stamped = presence.readdressed(user.clone(), contact.clone());
        if self.router.hosts().is_local_host(contact.domain()) {
            self.inbound(&stamped).await;
        } else {
            deliver(&self.router, stamped).await;
        }

        match presence_type {
            PresenceType::Subscribed => self.send_presences(&user, &contact, false).await,
            PresenceType::Unsubscribed => self.send_presences(&user, &contact, true).await,
            _ => {}
        }
    }

    fn inbound<'a>(&'a self, presence: &'a Presence) -> BoxFuture<'a, ()> {
        async move {
            let user = presence.to().to_bare();
            let contact = presence.from().to_bare();
            let presence_type = presence.presence_type();
            let storage = self.router.storage();

            match storage.user_exists(user.node()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(user = %user, "Subscription presence for unknown account");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check account");
                    return;
                }
            }
            let item = match storage.fetch_roster_item(user.node(), &contact.to_string()).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch roster item");
                    return;
                }
            };

            if presence_type == PresenceType::Subscribe {
                if item.as_ref().is_some_and(|i| i.subscription.has_from()) {
                    // Already approved: answer on the user's behalf.
                    let approval = Presence::build(PresenceType::Subscribed, user.clone(), contact.clone());
                    if self.router.hosts().is_local_host(contact.domain()) {
                        self.inbound(&approval).await;
                    } else {
                        deliver(&self.router, approval).await;
                    }
                    return;
                }
                let notification = RosterNotification {
                    contact: contact.to_string(),
                    username: user.node().to_string(),
                    presence: presence.element().clone(),
                };
                if let Err(e) = storage.upsert_roster_notification(&notification).await {
                    warn!(error = %e, "Failed to store subscription request");
                }
                deliver(&self.router, presence.clone()).await;
                return;
            }

            let Some(mut item) = item else {
                debug!(user = %user, contact = %contact, "Subscription presence without roster item");
                return;
            };
            if presence_type == PresenceType::Unsubscribe {
                if let Err(e) = storage
                    .delete_roster_notification(&contact.to_string(), user.node())
                    .await
                {
                    warn!(error = %e, "Failed to delete roster notification");
                }
            }
            if !subscription::apply(&mut item, presence_type, SubscriptionDirection::Inbound) {
                return;
            }
            self.store_and_push(&item).await;
            deliver(&self.router, presence.clone()).await;
            if presence_type == PresenceType::Unsubscribe {
                self.send_presences(&user, &contact, true).await;
            }
        }
        .boxed()
    }

    /// Send the current (or unavailable) presence of every resource of
    /// `user` to `contact`.
    async fn send_presences(&self, user: &Jid, contact: &Jid, unavailable: bool) {
        for stream in self.router.registry().streams(user.node()) {
            let Some(presence) = stream.presence().filter(Presence::is_available) else {
                continue;
            };
            let presence = if unavailable {
                Presence::build(PresenceType::Unavailable, stream.jid(), contact.clone())
            } else {
                presence.readdressed(stream.jid(), contact.clone())
            };
            deliver(&self.router, presence).await;
        }
    }

    /// Redeliver subscription requests still waiting for an answer.
    pub async fn deliver_pending_requests(&self, stream: &Arc<dyn C2sStream>) {
        let username = stream.username();
        match self.router.storage().fetch_roster_notifications(&username).await {
            Ok(notifications) => {
                for notification in notifications {
                    stream.send_element(notification.presence).await;
                }
            }
            Err(e) => warn!(username, error = %e, "Failed to fetch roster notifications"),
        }
    }
}

#[async_trait]
impl IqHandler for Roster {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn server_features(&self) -> Vec<&'static str> {
        if self.config.versioning {
            vec![ns::ROSTER, ns::ROSTER_VER]
        } else {
            vec![ns::ROSTER]
        }
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_request()
            && iq.payload_ns("query", ns::ROSTER).is_some()
            && iq.to().resource().is_empty()
            && iq.to().matches_bare(iq.from())
    }

    async fn process_iq(&self, iq: &Iq) {
        let result = match parse_roster_iq(iq) {
            Ok(RosterRequest::Get { ver }) => self.get_roster(iq, ver).await,
            Ok(RosterRequest::Set(update)) => self.set_roster(iq, update).await,
            Err(condition) => Ok(iq.error_reply(condition)),
        };
        let response = result.unwrap_or_else(|e| {
            warn!(error = %e, "Roster operation failed");
            iq.internal_server_error()
        });
        reply(&self.router, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster_iq(iq_type: &str, query: XElement) -> Iq {
        let el = XElement::builder("iq")
            .attr("id", "r1")
            .attr("type", iq_type)
            .child(query)
            .build();
        Iq::new(
            el,
            Jid::parse("ortuman@jackal.im/balcony").unwrap(),
            Jid::parse("ortuman@jackal.im").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_get_with_version() {
        let iq = roster_iq("get", XElement::builder("query").attr("xmlns", ns::ROSTER).attr("ver", "7").build());
        assert_eq!(
            parse_roster_iq(&iq),
            Ok(RosterRequest::Get {
                ver: Some("7".to_string())
            })
        );
    }

    #[test]
    fn test_parse_set_item() {
        let item = XElement::builder("item")
            .attr("jid", "noelia@jackal.im/yard")
            .attr("name", "Noelia")
            .child(XElement::builder("group").text("Friends").build())
            .build();
        let iq = roster_iq("set", XElement::builder("query").attr("xmlns", ns::ROSTER).child(item).build());
        let RosterRequest::Set(update) = parse_roster_iq(&iq).unwrap() else {
            panic!("expected set");
        };
        assert_eq!(update.jid.to_string(), "noelia@jackal.im");
        assert_eq!(update.name, "Noelia");
        assert!(update.groups.contains("Friends"));
        assert!(!update.remove);
    }

    #[test]
    fn test_parse_set_requires_single_item() {
        let query = XElement::builder("query")
            .attr("xmlns", ns::ROSTER)
            .child(XElement::builder("item").attr("jid", "a@jackal.im").build())
            .child(XElement::builder("item").attr("jid", "b@jackal.im").build())
            .build();
        assert_eq!(
            parse_roster_iq(&roster_iq("set", query)),
            Err(StanzaErrorCondition::BadRequest)
        );
    }

    #[test]
    fn test_item_element() {
        let mut item = RosterItem::new("ortuman", "noelia@jackal.im");
        item.subscription = Subscription::To;
        item.ask = true;
        item.groups.insert("Work".to_string());
        let el = item_element(&item);
        assert_eq!(el.attr("jid"), Some("noelia@jackal.im"));
        assert_eq!(el.attr("subscription"), Some("to"));
        assert_eq!(el.attr("ask"), Some("subscribe"));
        assert_eq!(el.attr("name"), None);
        assert_eq!(el.child("group").map(|g| g.text()), Some("Work"));
    }
}
