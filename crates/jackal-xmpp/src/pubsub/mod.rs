//! XEP-0060: Publish-Subscribe & XEP-0163: Personal Eventing Protocol
//!
//! PEP is the profile served here: the bare JID of an account is the
//! service address and nodes are auto-created on first publish.
//!
//! ## Supported operations
//!
//! - create, configure (owner namespace), delete
//! - publish with notifications, retract
//! - retrieve items
//! - subscribe, unsubscribe
//!
//! ## XML Namespaces
//!
//! - `http://jabber.org/protocol/pubsub` - Main PubSub namespace
//! - `http://jabber.org/protocol/pubsub#event` - Event notifications
//! - `http://jabber.org/protocol/pubsub#owner` - Node owner operations

pub mod node;
pub mod pep;
pub mod stanzas;

use serde::Deserialize;

pub use pep::Pep;
pub use stanzas::{parse_pubsub_iq, PubSubRequest, PublishedItem};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// `pubsub#max_items` of new nodes.
    pub max_items: usize,
    /// Highest `pubsub#max_items` an owner may configure.
    pub max_items_limit: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_items_limit: 1000,
        }
    }
}
