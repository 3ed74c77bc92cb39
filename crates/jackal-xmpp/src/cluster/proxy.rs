use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::warn;

use super::{Cluster, ClusterMessage, MessageKind, MessagePayload};
use crate::error::StreamErrorCondition;
use crate::jid::Jid;
use crate::stanza::{Presence, Stanza};
use crate::stream::{C2sStream, SendResult, StreamContext};
use crate::xml::XElement;

#[derive(Debug, Default)]
struct ProxyState {
    presence: Option<Presence>,
    context: StreamContext,
}

/// A client stream bound on another cluster node.
///
/// Elements sent to it travel to the owning node as `RouteStanza`
/// messages; presence and context mirror what that node announced.
pub struct ClusterStream {
    id: String,
    node: String,
    jid: Jid,
    state: RwLock<ProxyState>,
    cluster: Arc<Cluster>,
}

impl ClusterStream {
    pub fn new(
        node: impl Into<String>,
        jid: Jid,
        presence: Option<Presence>,
        context: StreamContext,
        cluster: Arc<Cluster>,
    ) -> Self {
        let node = node.into();
        Self {
            id: format!("{node}:{jid}"),
            node,
            jid,
            state: RwLock::new(ProxyState { presence, context }),
            cluster,
        }
    }
}

impl fmt::Debug for ClusterStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterStream")
            .field("node", &self.node)
            .field("jid", &self.jid)
            .finish()
    }
}

#[async_trait]
impl C2sStream for ClusterStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn jid(&self) -> Jid {
        self.jid.clone()
    }

    fn is_secured(&self) -> bool {
        true
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    fn presence(&self) -> Option<Presence> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).presence.clone()
    }

    fn set_presence(&self, presence: Option<Presence>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).presence = presence;
    }

    fn context_value(&self, key: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .context
            .get(key)
            .cloned()
    }

    fn context(&self) -> StreamContext {
        self.state.read().unwrap_or_else(PoisonError::into_inner).context.clone()
    }

    fn set_context_value(&self, key: &str, value: &str) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .context
            .insert(key.to_string(), value.to_string());
    }

    fn cluster_node(&self) -> Option<&str> {
        Some(&self.node)
    }

    async fn send_element(&self, element: XElement) -> SendResult {
        let stanza = match Stanza::from_element(element) {
            Ok(stanza) => stanza,
            Err(e) => {
                warn!(node = %self.node, error = %e, "Only stanzas can be routed to cluster peers");
                return SendResult::Rejected;
            }
        };
        let message = ClusterMessage::new(
            MessageKind::RouteStanza,
            self.cluster.local_node(),
            vec![MessagePayload {
                jid: self.jid.clone(),
                stanza: Some(stanza),
                context: None,
            }],
        );
        match self.cluster.send(&self.node, message).await {
            Ok(()) => SendResult::Sent,
            Err(e) => {
                warn!(node = %self.node, jid = %self.jid, error = %e, "Failed to route stanza to cluster node");
                SendResult::ChannelClosed
            }
        }
    }

    async fn disconnect(&self, _condition: Option<StreamErrorCondition>) {
        // The owning node closes its own streams.
    }
}
