//! XEP-0163: Personal Eventing Protocol (PEP) service.
//!
//! Every local account is a PubSub service addressed by its bare JID. The
//! owner creates, configures, publishes to and deletes nodes; contacts with
//! a presence subscription read items and subscribe. Notifications go to
//! the owner's resources, explicit subscribers and contacts whose entity
//! capabilities include `<node>+notify`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::node::{apply_config_form, config_form};
use super::stanzas::{
    configure_result, delete_event, items_event, items_result, parse_pubsub_iq, publish_result, retract_event,
    subscription_result, PubSubRequest, PublishedItem,
};
use super::PubSubConfig;
use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::modules::{deliver, reply, IqHandler};
use crate::router::Router;
use crate::stanza::{ErrorReply, Iq, Message};
use crate::storage::{
    Affiliation, NodeOptions, PubSubAffiliation, PubSubItem, PubSubNode, PubSubSubscription, StorageError,
};
use crate::xml::{ns, XElement};

const PEP_FEATURES: &[&str] = &[
    ns::PUBSUB,
    "http://jabber.org/protocol/pubsub#auto-create",
    "http://jabber.org/protocol/pubsub#config-node",
    "http://jabber.org/protocol/pubsub#create-nodes",
    "http://jabber.org/protocol/pubsub#delete-items",
    "http://jabber.org/protocol/pubsub#delete-nodes",
    "http://jabber.org/protocol/pubsub#filtered-notifications",
    "http://jabber.org/protocol/pubsub#pep",
    "http://jabber.org/protocol/pubsub#publish",
    "http://jabber.org/protocol/pubsub#retrieve-items",
    "http://jabber.org/protocol/pubsub#subscribe",
];

/// Outcome of a request: the result payload, if any, or an error condition.
type Outcome = Result<Result<Option<XElement>, StanzaErrorCondition>, StorageError>;

pub struct Pep {
    config: PubSubConfig,
    router: Arc<Router>,
}

impl Pep {
    pub fn new(config: PubSubConfig, router: Arc<Router>) -> Self {
        Self { config, router }
    }

    fn default_options(&self) -> NodeOptions {
        NodeOptions {
            max_items: self.config.max_items,
            ..NodeOptions::default()
        }
    }

    fn check_options(&self, options: NodeOptions) -> Result<NodeOptions, StanzaErrorCondition> {
        if options.max_items == 0 || options.max_items > self.config.max_items_limit {
            return Err(StanzaErrorCondition::NotAcceptable);
        }
        Ok(options)
    }

    /// Whether `requester` can read the PEP nodes of `owner`.
    async fn has_access(&self, owner: &Jid, requester: &Jid) -> Result<bool, StorageError> {
        if owner.matches_bare(requester) {
            return Ok(true);
        }
        let item = self
            .router
            .storage()
            .fetch_roster_item(owner.node(), &requester.to_bare().to_string())
            .await?;
        Ok(item.is_some_and(|i| i.subscription.has_from()))
    }

    #[instrument(skip_all, fields(host = %owner, node = %request.node()))]
    async fn handle(&self, owner: &Jid, requester: &Jid, request: PubSubRequest) -> Outcome {
        let storage = self.router.storage();
        let host = owner.to_string();
        let existing = storage.fetch_node(&host, request.node()).await?;

        match request {
            PubSubRequest::Create { node, config } => {
                if existing.is_some() {
                    return Ok(Err(StanzaErrorCondition::Conflict));
                }
                let options = match config {
                    Some(form) => match apply_config_form(&self.default_options(), &form)
                        .and_then(|o| self.check_options(o))
                    {
                        Ok(options) => options,
                        Err(condition) => return Ok(Err(condition)),
                    },
                    None => self.default_options(),
                };
                self.create_node(&host, &node, options).await?;
                Ok(Ok(Some(
                    XElement::builder("pubsub")
                        .attr("xmlns", ns::PUBSUB)
                        .child(XElement::builder("create").attr("node", node).build())
                        .build(),
                )))
            }
            PubSubRequest::ConfigureGet { node } => match existing {
                Some(n) => Ok(Ok(Some(configure_result(&node, config_form(&n.options))))),
                None => Ok(Err(StanzaErrorCondition::ItemNotFound)),
            },
            PubSubRequest::Configure { node, form } => {
                let Some(mut existing) = existing else {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                };
                match apply_config_form(&existing.options, &form).and_then(|o| self.check_options(o)) {
                    Ok(options) => existing.options = options,
                    Err(condition) => return Ok(Err(condition)),
                }
                storage.upsert_node(&existing).await?;
                debug!(node, max_items = existing.options.max_items, "Node configured");
                Ok(Ok(None))
            }
            PubSubRequest::Publish { node, item } => {
                let PublishedItem { id, payload: Some(payload) } = item else {
                    return Ok(Err(StanzaErrorCondition::BadRequest));
                };
                let node_info = match existing {
                    Some(n) => n,
                    None => self.create_node(&host, &node, self.default_options()).await?,
                };
                let item = PubSubItem {
                    id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    publisher: requester.to_string(),
                    payload,
                    published_at: Utc::now(),
                };
                self.publish(owner, &node_info, &item).await?;
                Ok(Ok(Some(publish_result(&node, &item.id))))
            }
            PubSubRequest::Items {
                node,
                max_items,
                item_ids,
            } => {
                if existing.is_none() {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                }
                if !self.has_access(owner, requester).await? {
                    return Ok(Err(StanzaErrorCondition::NotAuthorized));
                }
                let mut items = storage.fetch_node_items(&host, &node).await?;
                if !item_ids.is_empty() {
                    items.retain(|i| item_ids.contains(&i.id));
                }
                if let Some(max) = max_items {
                    let skip = items.len().saturating_sub(max);
                    items.drain(..skip);
                }
                Ok(Ok(Some(items_result(&node, &items))))
            }
            PubSubRequest::Retract { node, item_id, notify } => {
                let Some(node_info) = existing else {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                };
                if !storage.delete_node_item(&host, &node, &item_id).await? {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                }
                if notify || node_info.options.notify_retract {
                    self.notify(owner, &node, retract_event(&node, &item_id), false).await?;
                }
                Ok(Ok(None))
            }
            PubSubRequest::Subscribe { node, jid } => {
                if existing.is_none() {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                }
                let Ok(subscriber) = Jid::parse(&jid) else {
                    return Ok(Err(StanzaErrorCondition::JidMalformed));
                };
                if !subscriber.matches_bare(requester) {
                    return Ok(Err(StanzaErrorCondition::BadRequest));
                }
                if !self.has_access(owner, requester).await? {
                    return Ok(Err(StanzaErrorCondition::NotAuthorized));
                }
                let subid = Uuid::new_v4().to_string();
                storage
                    .upsert_node_subscription(
                        &host,
                        &node,
                        &PubSubSubscription {
                            subid: subid.clone(),
                            jid: subscriber.to_string(),
                            subscription: "subscribed".to_string(),
                        },
                    )
                    .await?;
                debug!(node, subscriber = %subscriber, "Subscribed");
                Ok(Ok(Some(subscription_result(&node, &jid, &subid))))
            }
            PubSubRequest::Unsubscribe { node, jid } => {
                if existing.is_none() {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                }
                match Jid::parse(&jid) {
                    Ok(subscriber) if subscriber.matches_bare(requester) => {}
                    _ => return Ok(Err(StanzaErrorCondition::BadRequest)),
                }
                if !storage.delete_node_subscription(&host, &node, &jid).await? {
                    return Ok(Err(StanzaErrorCondition::UnexpectedCondition));
                }
                Ok(Ok(None))
            }
            PubSubRequest::Delete { node } => {
                if existing.is_none() {
                    return Ok(Err(StanzaErrorCondition::ItemNotFound));
                }
                self.notify(owner, &node, delete_event(&node), false).await?;
                storage.delete_node(&host, &node).await?;
                debug!(node, "Node deleted");
                Ok(Ok(None))
            }
        }
    }

    async fn create_node(&self, host: &str, name: &str, options: NodeOptions) -> Result<PubSubNode, StorageError> {
        let storage = self.router.storage();
        let node = PubSubNode {
            host: host.to_string(),
            name: name.to_string(),
            options,
        };
        storage.upsert_node(&node).await?;
        storage
            .upsert_node_affiliation(
                host,
                name,
                &PubSubAffiliation {
                    jid: host.to_string(),
                    affiliation: Affiliation::Owner,
                },
            )
            .await?;
        debug!(host, node = name, "Node created");
        Ok(node)
    }

    async fn publish(&self, owner: &Jid, node: &PubSubNode, item: &PubSubItem) -> Result<(), StorageError> {
        self.router
            .storage()
            .upsert_node_item(&node.host, &node.name, item, node.options.max_items)
            .await?;
        let event = items_event(&node.name, item, node.options.deliver_payloads);
        self.notify(owner, &node.name, event, true).await
    }

    /// Send `event` to the owner's resources and to every subscriber. With
    /// `with_interest`, contacts advertising `<node>+notify` also get it.
    async fn notify(&self, owner: &Jid, node: &str, event: XElement, with_interest: bool) -> Result<(), StorageError> {
        let storage = self.router.storage();
        let mut recipients: BTreeSet<Jid> = BTreeSet::new();
        recipients.insert(owner.to_bare());

        for subscription in storage.fetch_node_subscriptions(&owner.to_string(), node).await? {
            if let Ok(jid) = Jid::parse(&subscription.jid) {
                recipients.insert(jid);
            }
        }
        if with_interest {
            recipients.extend(self.interested_contacts(owner, node).await?);
        }

        debug!(node, recipients = recipients.len(), "Sending event notifications");
        for to in recipients {
            deliver(&self.router, Message::headline(owner.to_bare(), to, [event.clone()])).await;
        }
        Ok(())
    }

    /// Full JIDs of contacts whose stored presence advertises interest in
    /// `node` through entity capabilities.
    async fn interested_contacts(&self, owner: &Jid, node: &str) -> Result<Vec<Jid>, StorageError> {
        let storage = self.router.storage();
        let feature = format!("{node}+notify");
        let mut interested = Vec::new();
        for item in storage.fetch_roster_items(owner.node()).await? {
            if !item.subscription.has_from() {
                continue;
            }
            let Ok(contact) = Jid::parse(&item.jid) else {
                continue;
            };
            for record in storage.fetch_presences_matching_jid(&contact).await? {
                let Some((caps_node, ver)) = &record.caps_key else {
                    continue;
                };
                if let Some(caps) = storage.fetch_capabilities(caps_node, ver).await? {
                    if caps.has_feature(&feature) {
                        interested.push(record.jid.clone());
                    }
                }
            }
        }
        Ok(interested)
    }
}

#[async_trait]
impl IqHandler for Pep {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn account_features(&self) -> Vec<&'static str> {
        PEP_FEATURES.to_vec()
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        let to = iq.to();
        iq.is_request()
            && (iq.payload_ns("pubsub", ns::PUBSUB).is_some() || iq.payload_ns("pubsub", ns::PUBSUB_OWNER).is_some())
            && !to.node().is_empty()
            && to.resource().is_empty()
            && self.router.hosts().is_local_host(to.domain())
    }

    async fn process_iq(&self, iq: &Iq) {
        let owner = iq.to();
        let requester = iq.from();
        let response = match parse_pubsub_iq(iq) {
            Err(condition) => iq.error_reply(condition),
            Ok(request) if request.requires_owner() && !owner.matches_bare(requester) => iq.forbidden(),
            Ok(request) => match self.handle(owner, requester, request).await {
                Ok(Ok(Some(payload))) => iq.result_with(payload),
                Ok(Ok(None)) => iq.result(),
                Ok(Err(condition)) => iq.error_reply(condition),
                Err(e) => {
                    warn!(host = %owner, error = %e, "PubSub operation failed");
                    iq.internal_server_error()
                }
            },
        };
        reply(&self.router, response).await;
    }
}
