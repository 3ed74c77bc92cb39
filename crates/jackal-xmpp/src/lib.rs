//! # jackal-xmpp
//!
//! XMPP server library: everything the `jackal` binary wires together.
//!
//! This crate implements an XMPP server following RFC 6120/6121 and a set
//! of IM extensions.
//!
//! ## Architecture
//!
//! - **Hosts**: served domains and their TLS certificates
//! - **Sessions**: XML stream framing over a socket or WebSocket transport
//! - **C2S**: client listeners; every bound stream is an actor reachable
//!   through a [`C2sStream`] handle kept in the [`StreamRegistry`]
//! - **Router**: delivers stanzas to local streams, cluster peers, remote
//!   servers (S2S with dialback) or the offline archive
//! - **Cluster**: peers share bound streams and forward stanzas to each
//!   other
//! - **Components**: external XEP-0114 components own a subdomain
//! - **Modules**: roster, presence, disco, PEP and the XEPs listed below
//! - **Storage**: repository traits with an in-memory backend
//!
//! ## XEP Support
//!
//! - XEP-0030 (Service Discovery)
//! - XEP-0049 (Private XML Storage)
//! - XEP-0054 (vcard-temp)
//! - XEP-0060 / XEP-0163 (PubSub, Personal Eventing Protocol)
//! - XEP-0092 (Software Version)
//! - XEP-0114 (Jabber Component Protocol)
//! - XEP-0115 (Entity Capabilities)
//! - XEP-0160 (Offline Messages)
//! - XEP-0191 (Blocking Command)
//! - XEP-0199 (XMPP Ping)
//! - XEP-0220 (Server Dialback)
//! - XEP-0237 (Roster Versioning)

pub mod auth;
pub mod c2s;
pub mod cluster;
pub mod component;
pub mod disco;
pub mod error;
pub mod host;
pub mod jid;
pub mod modules;
pub mod presence;
pub mod pubsub;
pub mod registry;
pub mod roster;
pub mod router;
pub mod s2s;
pub mod session;
pub mod stanza;
pub mod storage;
pub mod stream;
pub mod transport;
pub mod xep;
pub mod xml;

mod types;

pub use c2s::{C2sConfig, C2sListener};
pub use cluster::{Cluster, ClusterConfig};
pub use component::{ComponentConfig, ComponentListener};
pub use error::{StanzaErrorCondition, StreamErrorCondition, XmppError};
pub use host::{HostConfig, Hosts};
pub use crate::jid::Jid;
pub use modules::{Modules, ModulesConfig};
pub use registry::StreamRegistry;
pub use router::{RouteError, Router, RouterConfig};
pub use s2s::{S2s, S2sConfig, S2sListener};
pub use stanza::Stanza;
pub use storage::{MemoryStorage, Storage};
pub use stream::{C2sStream, LocalStream, SendResult};
pub use types::*;
pub use xml::XElement;
