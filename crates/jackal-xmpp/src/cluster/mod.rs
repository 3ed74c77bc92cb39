//! Cluster overlay.
//!
//! Turns a single-node router into a cluster-aware one:
//! - [`Memberlist`]: TCP membership with join, ping/suspicion and leave
//! - [`ClusterMessage`]: binary codec for binding and routing messages
//! - [`ClusterStream`]: proxy for a session bound on a peer node
//! - [`ClusterDelegate`]: applies membership events and peer messages to
//!   the local stream registry

mod delegate;
mod memberlist;
mod message;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::xml::binary::CodecError;

pub use delegate::ClusterDelegate;
pub use memberlist::Memberlist;
pub use message::{ClusterMessage, MessageKind, MessagePayload, FORMAT_VERSION};
pub use proxy::ClusterStream;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("control frame error: {0}")]
    Control(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unknown cluster node {0}")]
    UnknownNode(String),

    #[error("cluster is shutting down")]
    Closed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Stable node name; must be unique within the cluster.
    pub name: String,
    pub bind: String,
    pub port: u16,
    /// Address other nodes use to reach this one. Defaults to the bound
    /// listener address.
    pub advertise_addr: Option<String>,
    /// Seed peers contacted on start.
    pub hosts: Vec<String>,
    /// Upper bound for an inbound connection to complete its handshake.
    #[serde(with = "humantime_serde")]
    pub in_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// A peer silent for this long is considered gone.
    #[serde(with = "humantime_serde")]
    pub suspicion_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind: "0.0.0.0".to_string(),
            port: 5010,
            advertise_addr: None,
            hosts: Vec::new(),
            in_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            suspicion_timeout: Duration::from_secs(5),
        }
    }
}

/// Metadata every node publishes to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub version: String,
    pub runtime_version: String,
}

impl NodeMeta {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: format!("rust-{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// Nodes interoperate when they share the same major.minor version.
    pub fn is_compatible(&self, other: &NodeMeta) -> bool {
        fn major_minor(v: &str) -> Vec<&str> {
            v.split('.').take(2).collect()
        }
        major_minor(&self.version) == major_minor(&other.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    pub addr: String,
    pub meta: NodeMeta,
}

/// Events delivered to the [`ClusterDelegate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeJoined(ClusterMember),
    NodeUpdated(ClusterMember),
    NodeLeft(String),
    Message(ClusterMessage),
}

/// Node-addressable message passing over the membership layer.
pub struct Cluster {
    memberlist: Arc<Memberlist>,
}

impl Cluster {
    /// Bind the cluster port, contact the seed hosts and start delivering
    /// events to `events`.
    pub async fn start(config: ClusterConfig, events: mpsc::Sender<ClusterEvent>) -> Result<Arc<Self>, ClusterError> {
        let memberlist = Memberlist::start(config, events).await?;
        Ok(Arc::new(Self { memberlist }))
    }

    pub fn local_node(&self) -> &str {
        self.memberlist.local().name.as_str()
    }

    /// Address peers use to reach this node.
    pub fn local_addr(&self) -> &str {
        self.memberlist.local().addr.as_str()
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.memberlist.members()
    }

    /// Send `message` to node `node`.
    #[instrument(skip(self, message), fields(kind = ?message.kind), name = "cluster.send")]
    pub async fn send(&self, node: &str, message: ClusterMessage) -> Result<(), ClusterError> {
        self.memberlist.send(node, message.encode()).await
    }

    /// Send `message` to every known peer.
    pub async fn broadcast(&self, message: ClusterMessage) {
        let raw = message.encode();
        for member in self.memberlist.members() {
            if let Err(e) = self.memberlist.send(&member.name, raw.clone()).await {
                debug!(node = %member.name, error = %e, "Cluster broadcast send failed");
            }
        }
    }

    /// Announce departure to every peer and close the transport.
    pub async fn shutdown(&self) {
        self.memberlist.leave().await;
    }
}
