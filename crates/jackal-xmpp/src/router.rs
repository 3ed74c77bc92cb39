//! Stanza routing.
//!
//! For each stanza, the router:
//! 1. Hands stanzas for external components to the component stream
//! 2. Sends stanzas for non-local domains to the s2s path
//! 3. Applies block lists of both ends (unless told not to)
//! 4. Delivers to the bound resources of the local recipient: one resource
//!    for full JIDs, the highest priority one for chat messages to a bare
//!    JID and every resource for everything else
//! 5. Hands messages for users with no bound resource to the offline
//!    archive

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::cluster::{Cluster, ClusterMessage, MessageKind, MessagePayload};
use crate::error::StanzaErrorCondition;
use crate::host::{HostConfig, Hosts};
use crate::jid::Jid;
use crate::registry::StreamRegistry;
use crate::s2s::S2sOutProvider;
use crate::stanza::{ErrorReply, Message, Stanza};
use crate::storage::{Storage, StorageError};
use crate::stream::{C2sStream, SendResult};
use crate::xml::XElement;

/// `router` configuration section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Served domains; the first one is the default host.
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("sender or recipient is blocked")]
    BlockedJid,

    #[error("resource not found")]
    ResourceNotFound,

    #[error("account does not exist")]
    NotExistingAccount,

    #[error("recipient has no available resource")]
    NotAuthenticated,

    #[error("remote server unreachable")]
    FailedRemoteConnect,

    #[error("recipient stream queue is full")]
    StreamQueueFull,

    #[error("recipient stream is closed")]
    StreamUnavailable,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RouteError {
    /// Condition of the error stanza reported back to the sender.
    pub fn stanza_error_condition(&self) -> StanzaErrorCondition {
        match self {
            RouteError::BlockedJid => StanzaErrorCondition::ServiceUnavailable,
            RouteError::ResourceNotFound => StanzaErrorCondition::ItemNotFound,
            RouteError::NotExistingAccount | RouteError::NotAuthenticated => {
                StanzaErrorCondition::ServiceUnavailable
            }
            RouteError::FailedRemoteConnect => StanzaErrorCondition::RemoteServerNotFound,
            RouteError::StreamQueueFull => StanzaErrorCondition::ResourceConstraint,
            RouteError::StreamUnavailable => StanzaErrorCondition::ServiceUnavailable,
            RouteError::Storage(_) => StanzaErrorCondition::InternalServerError,
        }
    }
}

fn delivered(result: SendResult) -> Result<(), RouteError> {
    match result {
        SendResult::Sent => Ok(()),
        SendResult::ChannelFull => Err(RouteError::StreamQueueFull),
        SendResult::ChannelClosed | SendResult::Rejected => Err(RouteError::StreamUnavailable),
    }
}

/// Sink for messages addressed to users with no bound resource.
#[async_trait]
pub trait OfflineArchiver: Send + Sync {
    /// Returns `true` when the message was taken care of (stored, or
    /// rejected with an error sent back to its sender).
    async fn archive_message(&self, message: &Message) -> bool;
}

/// Returns whether a block list `pattern` covers `jid`. Unset parts of the
/// pattern are wildcards.
pub fn blocklist_matches(pattern: &Jid, jid: &Jid) -> bool {
    if pattern.domain() != jid.domain() {
        return false;
    }
    let node_ok = pattern.node().is_empty() || pattern.node() == jid.node();
    let resource_ok = pattern.resource().is_empty() || pattern.resource() == jid.resource();
    node_ok && resource_ok
}

pub struct Router {
    hosts: Arc<Hosts>,
    registry: Arc<StreamRegistry>,
    storage: Arc<dyn Storage>,
    s2s: Option<Arc<dyn S2sOutProvider>>,
    cluster: OnceLock<Arc<Cluster>>,
    offline: OnceLock<Weak<dyn OfflineArchiver>>,
    components: DashMap<String, mpsc::Sender<XElement>>,
}

impl Router {
    pub fn new(
        hosts: Arc<Hosts>,
        registry: Arc<StreamRegistry>,
        storage: Arc<dyn Storage>,
        s2s: Option<Arc<dyn S2sOutProvider>>,
    ) -> Self {
        Self {
            hosts,
            registry,
            storage,
            s2s,
            cluster: OnceLock::new(),
            offline: OnceLock::new(),
            components: DashMap::new(),
        }
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Attach the cluster overlay. Later calls are ignored.
    pub fn set_cluster(&self, cluster: Arc<Cluster>) {
        if self.cluster.set(cluster).is_err() {
            warn!("Cluster already attached to router");
        }
    }

    pub fn cluster(&self) -> Option<&Arc<Cluster>> {
        self.cluster.get()
    }

    pub fn set_offline_archiver(&self, archiver: Weak<dyn OfflineArchiver>) {
        if self.offline.set(archiver).is_err() {
            warn!("Offline archiver already attached to router");
        }
    }

    /// Route subdomain `domain` to an external component. Returns `false`
    /// when the domain is already taken or served locally.
    pub fn register_component(&self, domain: &str, tx: mpsc::Sender<XElement>) -> bool {
        if self.hosts.is_local_host(domain) {
            return false;
        }
        match self.components.entry(domain.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
                true
            }
        }
    }

    pub fn unregister_component(&self, domain: &str) {
        self.components.remove(domain);
    }

    /// Register a bound local stream and announce it to the cluster.
    pub async fn bind(&self, stream: Arc<dyn C2sStream>) -> bool {
        if !self.registry.bind(stream.clone()) {
            return false;
        }
        self.notify_cluster(MessageKind::Bind, stream.as_ref()).await;
        true
    }

    /// Unregister a local stream, if it is still the one bound at its
    /// address, and announce it to the cluster.
    pub async fn unbind(&self, stream: &dyn C2sStream) {
        if self
            .registry
            .unbind_stream(stream.id(), &stream.username(), &stream.resource())
        {
            self.notify_cluster(MessageKind::Unbind, stream).await;
        }
    }

    /// Announce a presence change of a local stream to the cluster.
    pub async fn presence_updated(&self, stream: &dyn C2sStream) {
        self.notify_cluster(MessageKind::UpdatePresence, stream).await;
    }

    async fn notify_cluster(&self, kind: MessageKind, stream: &dyn C2sStream) {
        let Some(cluster) = self.cluster.get() else {
            return;
        };
        let payload = MessagePayload {
            jid: stream.jid(),
            stanza: match kind {
                MessageKind::Unbind => None,
                _ => stream.presence().map(Stanza::Presence),
            },
            context: Some(stream.context()),
        };
        cluster
            .broadcast(ClusterMessage::new(kind, cluster.local_node(), vec![payload]))
            .await;
    }

    /// Route a server-originated stanza, bypassing block lists.
    pub async fn must_route(&self, stanza: &Stanza) -> Result<(), RouteError> {
        self.route(stanza, false).await
    }

    /// Answer `stanza` with an error of `condition`, unless it is an error
    /// itself.
    pub async fn bounce(&self, stanza: &Stanza, condition: StanzaErrorCondition) {
        if stanza.is_error() {
            return;
        }
        let reply = stanza.error_reply(condition);
        if let Err(e) = self.must_route(&reply).await {
            debug!(error = %e, to = %reply.to(), "Failed to deliver error reply");
        }
    }

    #[instrument(skip(self, stanza), fields(from = %stanza.from(), to = %stanza.to()))]
    pub async fn route(&self, stanza: &Stanza, validate: bool) -> Result<(), RouteError> {
        let to = stanza.to();

        if let Some(tx) = self.components.get(to.domain()).map(|e| e.value().clone()) {
            return tx
                .send(stanza.element().clone())
                .await
                .map_err(|_| RouteError::FailedRemoteConnect);
        }

        if !self.hosts.is_local_host(to.domain()) {
            return self.route_remote(stanza).await;
        }

        if validate && self.is_blocked(stanza.from(), to).await? {
            debug!("Stanza blocked");
            return Err(RouteError::BlockedJid);
        }

        let streams = self.registry.streams(to.node());
        if streams.is_empty() {
            if !self.storage.user_exists(to.node()).await? {
                return Err(RouteError::NotExistingAccount);
            }
            if let Stanza::Message(message) = stanza {
                if let Some(archiver) = self.offline.get().and_then(Weak::upgrade) {
                    if archiver.archive_message(message).await {
                        return Ok(());
                    }
                }
            }
            return Err(RouteError::NotAuthenticated);
        }

        if to.is_full() {
            let stream = streams
                .iter()
                .find(|s| s.resource() == to.resource())
                .ok_or(RouteError::ResourceNotFound)?;
            return delivered(stream.send_element(stanza.element().clone()).await);
        }

        match stanza {
            Stanza::Message(_) => {
                let target = highest_priority(&streams);
                delivered(target.send_element(stanza.element().clone()).await)
            }
            _ => {
                // Broadcast succeeds when at least one resource took the stanza.
                let mut first_err = None;
                let mut sent = false;
                for stream in &streams {
                    match delivered(stream.send_element(stanza.element().clone()).await) {
                        Ok(()) => sent = true,
                        Err(e) => {
                            debug!(resource = %stream.resource(), error = %e, "Broadcast delivery failed");
                            first_err.get_or_insert(e);
                        }
                    }
                }
                match first_err {
                    Some(e) if !sent => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }

    async fn route_remote(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let Some(s2s) = &self.s2s else {
            return Err(RouteError::FailedRemoteConnect);
        };
        let local = self.hosts.default_host();
        let out = s2s.get_out(local, stanza.to().domain()).await.map_err(|e| {
            warn!(remote = %stanza.to().domain(), error = %e, "Failed to obtain s2s stream");
            RouteError::FailedRemoteConnect
        })?;
        out.send_element(stanza.element().clone()).await;
        Ok(())
    }

    /// A stanza is blocked when the recipient blocks the sender, or a local
    /// sender blocks the recipient.
    async fn is_blocked(&self, from: &Jid, to: &Jid) -> Result<bool, RouteError> {
        if !to.node().is_empty() && self.blocked_by(to.node(), from).await? {
            return Ok(true);
        }
        if !from.node().is_empty()
            && self.hosts.is_local_host(from.domain())
            && self.blocked_by(from.node(), to).await?
        {
            return Ok(true);
        }
        Ok(false)
    }

    async fn blocked_by(&self, username: &str, jid: &Jid) -> Result<bool, RouteError> {
        let items = self.storage.fetch_blocklist_items(username).await?;
        Ok(items.iter().any(|item| match Jid::parse(&item.jid) {
            Ok(pattern) => blocklist_matches(&pattern, jid),
            Err(_) => false,
        }))
    }
}

/// First stream with the highest presence priority; streams without
/// presence count as priority 0.
fn highest_priority(streams: &[Arc<dyn C2sStream>]) -> &Arc<dyn C2sStream> {
    let priority = |s: &Arc<dyn C2sStream>| s.presence().map_or(0, |p| p.priority());
    let mut target = &streams[0];
    for stream in &streams[1..] {
        if priority(stream) > priority(target) {
            target = stream;
        }
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    #[test]
    fn test_blocklist_patterns() {
        let target = jid("hamlet@jackal.im/garden");
        assert!(blocklist_matches(&jid("hamlet@jackal.im/garden"), &target));
        assert!(!blocklist_matches(&jid("hamlet@jackal.im/balcony"), &target));
        assert!(blocklist_matches(&jid("hamlet@jackal.im"), &target));
        assert!(!blocklist_matches(&jid("noelia@jackal.im"), &target));
        assert!(blocklist_matches(&jid("jackal.im/garden"), &target));
        assert!(!blocklist_matches(&jid("jackal.im/balcony"), &target));
        assert!(blocklist_matches(&jid("jackal.im"), &target));
        assert!(!blocklist_matches(&jid("example.org"), &target));
    }

    #[test]
    fn test_route_error_conditions() {
        assert_eq!(
            RouteError::BlockedJid.stanza_error_condition(),
            StanzaErrorCondition::ServiceUnavailable
        );
        assert_eq!(
            RouteError::ResourceNotFound.stanza_error_condition(),
            StanzaErrorCondition::ItemNotFound
        );
        assert_eq!(
            RouteError::FailedRemoteConnect.stanza_error_condition(),
            StanzaErrorCondition::RemoteServerNotFound
        );
        assert_eq!(
            RouteError::StreamQueueFull.stanza_error_condition(),
            StanzaErrorCondition::ResourceConstraint
        );
        assert_eq!(
            RouteError::StreamUnavailable.stanza_error_condition(),
            StanzaErrorCondition::ServiceUnavailable
        );
    }
}
