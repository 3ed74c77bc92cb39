use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Cluster, ClusterEvent, ClusterMessage, ClusterStream, MessageKind, MessagePayload};
use crate::router::Router;
use crate::stanza::Stanza;
use crate::stream::C2sStream;

/// Applies cluster events to the local stream registry.
pub struct ClusterDelegate {
    router: Arc<Router>,
    cluster: Arc<Cluster>,
}

impl ClusterDelegate {
    pub fn new(router: Arc<Router>, cluster: Arc<Cluster>) -> Self {
        Self { router, cluster }
    }

    /// Consume events until the channel closes or `shutdown` fires.
    pub async fn run(self, mut events: mpsc::Receiver<ClusterEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => break,
            }
        }
        debug!("Cluster delegate stopped");
    }

    pub async fn handle(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::NodeJoined(member) => {
                info!(node = %member.name, "Sending local bindings to new cluster node");
                self.send_local_bindings(&member.name).await;
            }
            ClusterEvent::NodeUpdated(member) => {
                debug!(node = %member.name, version = %member.meta.version, "Cluster node updated");
            }
            ClusterEvent::NodeLeft(node) => self.node_left(&node).await,
            ClusterEvent::Message(message) => self.apply(message).await,
        }
    }

    async fn send_local_bindings(&self, node: &str) {
        let payloads: Vec<_> = self
            .router
            .registry()
            .local_streams()
            .iter()
            .map(|stream| MessagePayload {
                jid: stream.jid(),
                stanza: stream.presence().map(Into::into),
                context: Some(stream.context()),
            })
            .collect();
        if payloads.is_empty() {
            return;
        }
        let message = ClusterMessage::new(MessageKind::BatchBind, self.cluster.local_node(), payloads);
        if let Err(e) = self.cluster.send(node, message).await {
            warn!(node, error = %e, "Failed to send local bindings");
        }
    }

    async fn node_left(&self, node: &str) {
        self.router.registry().remove_cluster_node(node);
        let storage = self.router.storage();
        if storage.is_cluster_compatible() {
            match storage.delete_allocation_presences(node).await {
                Ok(removed) => debug!(node, removed, "Removed presences of departed node"),
                Err(e) => warn!(node, error = %e, "Failed to remove presences of departed node"),
            }
        }
    }

    #[instrument(skip(self, message), fields(kind = ?message.kind, node = %message.node))]
    async fn apply(&self, message: ClusterMessage) {
        let registry = self.router.registry();
        let node = message.node;
        for payload in message.payloads {
            match message.kind {
                MessageKind::Bind | MessageKind::BatchBind => {
                    let presence = match payload.stanza {
                        Some(Stanza::Presence(p)) => Some(p),
                        _ => None,
                    };
                    let proxy = ClusterStream::new(
                        node.clone(),
                        payload.jid,
                        presence,
                        payload.context.unwrap_or_default(),
                        Arc::clone(&self.cluster),
                    );
                    let proxy: Arc<dyn C2sStream> = Arc::new(proxy);
                    if !registry.bind(Arc::clone(&proxy)) {
                        // A proxy left over from an earlier announcement is
                        // replaced; a local stream wins.
                        let (username, resource) = (proxy.username(), proxy.resource());
                        let stale = registry
                            .stream(&username, &resource)
                            .is_some_and(|s| s.cluster_node().is_some());
                        if stale {
                            registry.unbind(&username, &resource);
                            registry.bind(proxy);
                        } else {
                            warn!(jid = %proxy.jid(), "Remote bind conflicts with a local stream");
                        }
                    }
                }
                MessageKind::Unbind => {
                    let (username, resource) = (payload.jid.node(), payload.jid.resource());
                    let owned = registry
                        .stream(username, resource)
                        .is_some_and(|s| s.cluster_node() == Some(node.as_str()));
                    if owned {
                        registry.unbind(username, resource);
                    }
                }
                MessageKind::UpdatePresence => {
                    let Some(stream) = registry.stream(payload.jid.node(), payload.jid.resource()) else {
                        debug!(jid = %payload.jid, "Presence update for unknown stream");
                        continue;
                    };
                    if stream.cluster_node() != Some(node.as_str()) {
                        continue;
                    }
                    let presence = match payload.stanza {
                        Some(Stanza::Presence(p)) => Some(p),
                        _ => None,
                    };
                    stream.set_presence(presence);
                    if let Some(context) = payload.context {
                        for (key, value) in &context {
                            stream.set_context_value(key, value);
                        }
                    }
                }
                MessageKind::RouteStanza => {
                    let Some(stanza) = payload.stanza else {
                        continue;
                    };
                    match registry.stream(payload.jid.node(), payload.jid.resource()) {
                        Some(stream) if stream.cluster_node().is_none() => {
                            let result = stream.send_element(stanza.into_element()).await;
                            if !result.is_sent() {
                                warn!(jid = %payload.jid, ?result, "Failed to deliver routed stanza");
                            }
                        }
                        _ => debug!(jid = %payload.jid, "Routed stanza for stream not bound here"),
                    }
                }
            }
        }
    }
}
