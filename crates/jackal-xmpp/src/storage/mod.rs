//! Persistence contract.
//!
//! Each concern gets its own repository trait; a backend implements all of
//! them plus [`Storage`], which is what the rest of the server holds.

use async_trait::async_trait;
use thiserror::Error;

use crate::jid::Jid;
use crate::stanza::Message;
use crate::xml::XElement;

pub mod memory;
pub mod model;

pub use memory::MemoryStorage;
pub use model::*;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage is closed")]
    Closed,

    #[error("constraint violation: {0}")]
    Constraint(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError>;

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Remove the user together with every row owned by it in the other
    /// repositories, atomically.
    async fn delete_user(&self, username: &str) -> Result<(), StorageError>;

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait RosterRepository: Send + Sync {
    /// Insert or update an item, bumping the owner's roster version. The
    /// stored item carries the new version, which is returned.
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<RosterVersion, StorageError>;

    /// Delete an item, bumping both the current and the last-deletion
    /// versions. Deleting a missing item leaves the version untouched.
    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<RosterVersion, StorageError>;

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError>;

    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, StorageError>;

    async fn fetch_roster_item(&self, username: &str, jid: &str) -> Result<Option<RosterItem>, StorageError>;

    async fn fetch_roster_version(&self, username: &str) -> Result<RosterVersion, StorageError>;

    async fn upsert_roster_notification(&self, notification: &RosterNotification) -> Result<(), StorageError>;

    async fn delete_roster_notification(&self, contact: &str, username: &str) -> Result<(), StorageError>;

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        username: &str,
    ) -> Result<Option<RosterNotification>, StorageError>;

    async fn fetch_roster_notifications(&self, username: &str) -> Result<Vec<RosterNotification>, StorageError>;
}

#[async_trait]
pub trait PresencesRepository: Send + Sync {
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StorageError>;

    /// A bare JID matches every resource of the account.
    async fn fetch_presences_matching_jid(&self, jid: &Jid) -> Result<Vec<PresenceRecord>, StorageError>;

    async fn delete_presence(&self, jid: &Jid) -> Result<(), StorageError>;

    /// Remove every presence persisted by the given server instance.
    async fn delete_allocation_presences(&self, allocation_id: &str) -> Result<usize, StorageError>;

    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), StorageError>;

    async fn fetch_capabilities(&self, node: &str, ver: &str) -> Result<Option<Capabilities>, StorageError>;
}

#[async_trait]
pub trait VCardRepository: Send + Sync {
    async fn upsert_vcard(&self, username: &str, vcard: &XElement) -> Result<(), StorageError>;

    async fn fetch_vcard(&self, username: &str) -> Result<Option<XElement>, StorageError>;
}

#[async_trait]
pub trait PrivateRepository: Send + Sync {
    async fn upsert_private(&self, username: &str, namespace: &str, element: &XElement) -> Result<(), StorageError>;

    async fn fetch_private(&self, username: &str, namespace: &str) -> Result<Option<XElement>, StorageError>;
}

#[async_trait]
pub trait BlockListRepository: Send + Sync {
    async fn insert_blocklist_item(&self, item: &BlockListItem) -> Result<(), StorageError>;

    async fn delete_blocklist_item(&self, item: &BlockListItem) -> Result<(), StorageError>;

    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<BlockListItem>, StorageError>;

    async fn delete_blocklist_items(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait PubSubRepository: Send + Sync {
    async fn upsert_node(&self, node: &PubSubNode) -> Result<(), StorageError>;

    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<PubSubNode>, StorageError>;

    async fn fetch_nodes(&self, host: &str) -> Result<Vec<PubSubNode>, StorageError>;

    /// Delete a node and all of its items, subscriptions and affiliations.
    async fn delete_node(&self, host: &str, name: &str) -> Result<(), StorageError>;

    /// Insert or replace an item, then trim the node to its newest
    /// `max_items` items.
    async fn upsert_node_item(
        &self,
        host: &str,
        name: &str,
        item: &PubSubItem,
        max_items: usize,
    ) -> Result<(), StorageError>;

    /// Items in publication order, oldest first.
    async fn fetch_node_items(&self, host: &str, name: &str) -> Result<Vec<PubSubItem>, StorageError>;

    /// Returns whether an item was removed.
    async fn delete_node_item(&self, host: &str, name: &str, item_id: &str) -> Result<bool, StorageError>;

    async fn upsert_node_subscription(
        &self,
        host: &str,
        name: &str,
        subscription: &PubSubSubscription,
    ) -> Result<(), StorageError>;

    async fn delete_node_subscription(&self, host: &str, name: &str, jid: &str) -> Result<bool, StorageError>;

    async fn fetch_node_subscriptions(&self, host: &str, name: &str) -> Result<Vec<PubSubSubscription>, StorageError>;

    async fn upsert_node_affiliation(
        &self,
        host: &str,
        name: &str,
        affiliation: &PubSubAffiliation,
    ) -> Result<(), StorageError>;

    async fn fetch_node_affiliations(&self, host: &str, name: &str) -> Result<Vec<PubSubAffiliation>, StorageError>;
}

#[async_trait]
pub trait OfflineRepository: Send + Sync {
    async fn insert_offline_message(&self, username: &str, message: &Message) -> Result<(), StorageError>;

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError>;

    /// Stored messages, oldest first.
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<OfflineMessage>, StorageError>;

    /// Drop the oldest stored message, if any.
    async fn delete_oldest_offline_message(&self, username: &str) -> Result<(), StorageError>;

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError>;
}

/// The storage container: every repository plus lifecycle hooks.
#[async_trait]
pub trait Storage:
    UserRepository
    + RosterRepository
    + PresencesRepository
    + VCardRepository
    + PrivateRepository
    + BlockListRepository
    + PubSubRepository
    + OfflineRepository
{
    /// Release backend resources. Operations after close fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;

    /// Whether several server instances may share this backend.
    fn is_cluster_compatible(&self) -> bool;
}
