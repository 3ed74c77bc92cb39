//! Persisted entities.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::auth::scram::PasswordMaterial;
use crate::jid::Jid;
use crate::stanza::Message;
use crate::xml::XElement;

/// A registered account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub password: PasswordMaterial,
    pub last_presence: Option<XElement>,
    pub last_presence_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(username: impl Into<String>, password: PasswordMaterial) -> Self {
        Self {
            username: username.into(),
            password,
            last_presence: None,
            last_presence_at: None,
        }
    }
}

/// Roster subscription state (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    From,
    To,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::From => "from",
            Subscription::To => "to",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Subscription::None),
            "from" => Some(Subscription::From),
            "to" => Some(Subscription::To),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }

    /// The contact receives the owner's presence.
    pub fn has_from(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }

    /// The owner receives the contact's presence.
    pub fn has_to(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

/// One contact in a user's roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub username: String,
    /// Bare JID of the contact.
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
    pub ask: bool,
    pub version: u64,
    pub groups: BTreeSet<String>,
}

impl RosterItem {
    pub fn new(username: impl Into<String>, jid: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            jid: jid.into(),
            name: String::new(),
            subscription: Subscription::None,
            ask: false,
            version: 0,
            groups: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RosterVersion {
    pub current: u64,
    pub last_deletion: u64,
}

/// A subscription request waiting for the user to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterNotification {
    /// Bare JID of the requesting contact.
    pub contact: String,
    pub username: String,
    pub presence: XElement,
}

/// A blocked JID pattern; unset parts of `jid` are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockListItem {
    pub username: String,
    pub jid: String,
}

/// Entity capabilities resolved from a disco#info answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub node: String,
    pub ver: String,
    pub features: BTreeSet<String>,
}

impl Capabilities {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

/// Last available presence of a bound resource.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub jid: Jid,
    pub presence: XElement,
    /// `(node, ver)` of the advertised capabilities.
    pub caps_key: Option<(String, String)>,
    pub allocation_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Node configuration (`pubsub#...` options).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    pub max_items: usize,
    pub title: String,
    pub notify_retract: bool,
    pub deliver_payloads: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            max_items: 10,
            title: String::new(),
            notify_retract: true,
            deliver_payloads: true,
        }
    }
}

/// A pubsub node. `host` is the owning service: a bare account JID for PEP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubNode {
    pub host: String,
    pub name: String,
    pub options: NodeOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubItem {
    pub id: String,
    pub publisher: String,
    pub payload: XElement,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubSubscription {
    pub subid: String,
    pub jid: String,
    pub subscription: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    Owner,
    Publisher,
    Member,
    None,
    Outcast,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubAffiliation {
    pub jid: String,
    pub affiliation: Affiliation,
}

/// A message stored for a user without available resources.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineMessage {
    pub message: Message,
    pub stored_at: DateTime<Utc>,
}
