//! In-process storage backend.
//!
//! Everything lives behind one lock, so every operation (including the
//! multi-table `delete_user`) is atomic. Data does not survive a restart and
//! cannot be shared between instances.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::*;

type NodeKey = (String, String);

#[derive(Debug, Default)]
struct NodeState {
    node: Option<PubSubNode>,
    items: Vec<PubSubItem>,
    subscriptions: Vec<PubSubSubscription>,
    affiliations: Vec<PubSubAffiliation>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, User>,
    roster_items: HashMap<String, Vec<RosterItem>>,
    roster_versions: HashMap<String, RosterVersion>,
    roster_notifications: HashMap<String, Vec<RosterNotification>>,
    presences: HashMap<String, PresenceRecord>,
    capabilities: HashMap<(String, String), Capabilities>,
    vcards: HashMap<String, XElement>,
    private: HashMap<(String, String), XElement>,
    blocklist: HashMap<String, BTreeSet<BlockListItem>>,
    pubsub: HashMap<NodeKey, NodeState>,
    offline: HashMap<String, VecDeque<OfflineMessage>>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.state.read().await)
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.state.write().await)
    }
}

fn node_key(host: &str, name: &str) -> NodeKey {
    (host.to_string(), name.to_string())
}

#[async_trait]
impl UserRepository for MemoryStorage {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.write().await?.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.read().await?.users.get(username).cloned())
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        state.users.remove(username);
        state.roster_items.remove(username);
        state.roster_versions.remove(username);
        state.roster_notifications.remove(username);
        state.presences.retain(|_, p| p.jid.node() != username);
        state.vcards.remove(username);
        state.private.retain(|(user, _), _| user != username);
        state.blocklist.remove(username);
        state.offline.remove(username);
        debug!(username, "User deleted");
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        Ok(self.read().await?.users.contains_key(username))
    }
}

#[async_trait]
impl RosterRepository for MemoryStorage {
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<RosterVersion, StorageError> {
        let mut state = self.write().await?;
        let version = state.roster_versions.entry(item.username.clone()).or_default();
        version.current += 1;
        let version = *version;

        let mut item = item.clone();
        item.version = version.current;
        let items = state.roster_items.entry(item.username.clone()).or_default();
        match items.iter_mut().find(|i| i.jid == item.jid) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        Ok(version)
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<RosterVersion, StorageError> {
        let mut state = self.write().await?;
        let removed = state
            .roster_items
            .get_mut(username)
            .map(|items| {
                let before = items.len();
                items.retain(|i| i.jid != jid);
                before != items.len()
            })
            .unwrap_or(false);

        let version = state.roster_versions.entry(username.to_string()).or_default();
        if removed {
            version.current += 1;
            version.last_deletion = version.current;
        }
        Ok(*version)
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self.read().await?.roster_items.get(username).cloned().unwrap_or_default())
    }

    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self
            .read()
            .await?
            .roster_items
            .get(username)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| groups.iter().any(|g| i.groups.contains(g)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_roster_item(&self, username: &str, jid: &str) -> Result<Option<RosterItem>, StorageError> {
        Ok(self
            .read()
            .await?
            .roster_items
            .get(username)
            .and_then(|items| items.iter().find(|i| i.jid == jid).cloned()))
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<RosterVersion, StorageError> {
        Ok(self.read().await?.roster_versions.get(username).copied().unwrap_or_default())
    }

    async fn upsert_roster_notification(&self, notification: &RosterNotification) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        let pending = state
            .roster_notifications
            .entry(notification.username.clone())
            .or_default();
        match pending.iter_mut().find(|n| n.contact == notification.contact) {
            Some(existing) => *existing = notification.clone(),
            None => pending.push(notification.clone()),
        }
        Ok(())
    }

    async fn delete_roster_notification(&self, contact: &str, username: &str) -> Result<(), StorageError> {
        if let Some(pending) = self.write().await?.roster_notifications.get_mut(username) {
            pending.retain(|n| n.contact != contact);
        }
        Ok(())
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        username: &str,
    ) -> Result<Option<RosterNotification>, StorageError> {
        Ok(self
            .read()
            .await?
            .roster_notifications
            .get(username)
            .and_then(|pending| pending.iter().find(|n| n.contact == contact).cloned()))
    }

    async fn fetch_roster_notifications(&self, username: &str) -> Result<Vec<RosterNotification>, StorageError> {
        Ok(self
            .read()
            .await?
            .roster_notifications
            .get(username)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PresencesRepository for MemoryStorage {
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StorageError> {
        self.write()
            .await?
            .presences
            .insert(record.jid.to_string(), record.clone());
        Ok(())
    }

    async fn fetch_presences_matching_jid(&self, jid: &Jid) -> Result<Vec<PresenceRecord>, StorageError> {
        let state = self.read().await?;
        let mut records: Vec<PresenceRecord> = state
            .presences
            .values()
            .filter(|p| {
                p.jid.node() == jid.node()
                    && p.jid.domain() == jid.domain()
                    && (jid.is_bare() || p.jid.resource() == jid.resource())
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.jid.cmp(&b.jid));
        Ok(records)
    }

    async fn delete_presence(&self, jid: &Jid) -> Result<(), StorageError> {
        self.write().await?.presences.remove(&jid.to_string());
        Ok(())
    }

    async fn delete_allocation_presences(&self, allocation_id: &str) -> Result<usize, StorageError> {
        let mut state = self.write().await?;
        let before = state.presences.len();
        state.presences.retain(|_, p| p.allocation_id != allocation_id);
        Ok(before - state.presences.len())
    }

    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), StorageError> {
        self.write()
            .await?
            .capabilities
            .insert((caps.node.clone(), caps.ver.clone()), caps.clone());
        Ok(())
    }

    async fn fetch_capabilities(&self, node: &str, ver: &str) -> Result<Option<Capabilities>, StorageError> {
        Ok(self
            .read()
            .await?
            .capabilities
            .get(&(node.to_string(), ver.to_string()))
            .cloned())
    }
}

#[async_trait]
impl VCardRepository for MemoryStorage {
    async fn upsert_vcard(&self, username: &str, vcard: &XElement) -> Result<(), StorageError> {
        self.write().await?.vcards.insert(username.to_string(), vcard.clone());
        Ok(())
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<XElement>, StorageError> {
        Ok(self.read().await?.vcards.get(username).cloned())
    }
}

#[async_trait]
impl PrivateRepository for MemoryStorage {
    async fn upsert_private(&self, username: &str, namespace: &str, element: &XElement) -> Result<(), StorageError> {
        self.write()
            .await?
            .private
            .insert((username.to_string(), namespace.to_string()), element.clone());
        Ok(())
    }

    async fn fetch_private(&self, username: &str, namespace: &str) -> Result<Option<XElement>, StorageError> {
        Ok(self
            .read()
            .await?
            .private
            .get(&(username.to_string(), namespace.to_string()))
            .cloned())
    }
}

#[async_trait]
impl BlockListRepository for MemoryStorage {
    async fn insert_blocklist_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        self.write()
            .await?
            .blocklist
            .entry(item.username.clone())
            .or_default()
            .insert(item.clone());
        Ok(())
    }

    async fn delete_blocklist_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        if let Some(items) = self.write().await?.blocklist.get_mut(&item.username) {
            items.remove(item);
        }
        Ok(())
    }

    async fn fetch_blocklist_items(&self, username: &str) -> Result<Vec<BlockListItem>, StorageError> {
        Ok(self
            .read()
            .await?
            .blocklist
            .get(username)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_blocklist_items(&self, username: &str) -> Result<(), StorageError> {
        self.write().await?.blocklist.remove(username);
        Ok(())
    }
}

#[async_trait]
impl PubSubRepository for MemoryStorage {
    async fn upsert_node(&self, node: &PubSubNode) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        state
            .pubsub
            .entry(node_key(&node.host, &node.name))
            .or_default()
            .node = Some(node.clone());
        Ok(())
    }

    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<PubSubNode>, StorageError> {
        Ok(self
            .read()
            .await?
            .pubsub
            .get(&node_key(host, name))
            .and_then(|n| n.node.clone()))
    }

    async fn fetch_nodes(&self, host: &str) -> Result<Vec<PubSubNode>, StorageError> {
        let state = self.read().await?;
        let mut nodes: Vec<PubSubNode> = state
            .pubsub
            .iter()
            .filter(|((h, _), _)| h == host)
            .filter_map(|(_, n)| n.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn delete_node(&self, host: &str, name: &str) -> Result<(), StorageError> {
        self.write().await?.pubsub.remove(&node_key(host, name));
        Ok(())
    }

    async fn upsert_node_item(
        &self,
        host: &str,
        name: &str,
        item: &PubSubItem,
        max_items: usize,
    ) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        let node = state.pubsub.entry(node_key(host, name)).or_default();
        node.items.retain(|i| i.id != item.id);
        node.items.push(item.clone());
        if node.items.len() > max_items {
            let excess = node.items.len() - max_items;
            node.items.drain(..excess);
        }
        Ok(())
    }

    async fn fetch_node_items(&self, host: &str, name: &str) -> Result<Vec<PubSubItem>, StorageError> {
        Ok(self
            .read()
            .await?
            .pubsub
            .get(&node_key(host, name))
            .map(|n| n.items.clone())
            .unwrap_or_default())
    }

    async fn delete_node_item(&self, host: &str, name: &str, item_id: &str) -> Result<bool, StorageError> {
        let mut state = self.write().await?;
        Ok(match state.pubsub.get_mut(&node_key(host, name)) {
            Some(node) => {
                let before = node.items.len();
                node.items.retain(|i| i.id != item_id);
                before != node.items.len()
            }
            None => false,
        })
    }

    async fn upsert_node_subscription(
        &self,
        host: &str,
        name: &str,
        subscription: &PubSubSubscription,
    ) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        let node = state.pubsub.entry(node_key(host, name)).or_default();
        match node.subscriptions.iter_mut().find(|s| s.jid == subscription.jid) {
            Some(existing) => *existing = subscription.clone(),
            None => node.subscriptions.push(subscription.clone()),
        }
        Ok(())
    }

    async fn delete_node_subscription(&self, host: &str, name: &str, jid: &str) -> Result<bool, StorageError> {
        let mut state = self.write().await?;
        Ok(match state.pubsub.get_mut(&node_key(host, name)) {
            Some(node) => {
                let before = node.subscriptions.len();
                node.subscriptions.retain(|s| s.jid != jid);
                before != node.subscriptions.len()
            }
            None => false,
        })
    }

    async fn fetch_node_subscriptions(&self, host: &str, name: &str) -> Result<Vec<PubSubSubscription>, StorageError> {
        Ok(self
            .read()
            .await?
            .pubsub
            .get(&node_key(host, name))
            .map(|n| n.subscriptions.clone())
            .unwrap_or_default())
    }

    async fn upsert_node_affiliation(
        &self,
        host: &str,
        name: &str,
        affiliation: &PubSubAffiliation,
    ) -> Result<(), StorageError> {
        let mut state = self.write().await?;
        let node = state.pubsub.entry(node_key(host, name)).or_default();
        match node.affiliations.iter_mut().find(|a| a.jid == affiliation.jid) {
            Some(existing) => *existing = affiliation.clone(),
            None => node.affiliations.push(affiliation.clone()),
        }
        Ok(())
    }

    async fn fetch_node_affiliations(&self, host: &str, name: &str) -> Result<Vec<PubSubAffiliation>, StorageError> {
        Ok(self
            .read()
            .await?
            .pubsub
            .get(&node_key(host, name))
            .map(|n| n.affiliations.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl OfflineRepository for MemoryStorage {
    async fn insert_offline_message(&self, username: &str, message: &Message) -> Result<(), StorageError> {
        self.write()
            .await?
            .offline
            .entry(username.to_string())
            .or_default()
            .push_back(OfflineMessage {
                message: message.clone(),
                stored_at: Utc::now(),
            });
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        Ok(self.read().await?.offline.get(username).map_or(0, |q| q.len()))
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<OfflineMessage>, StorageError> {
        Ok(self
            .read()
            .await?
            .offline
            .get(username)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_oldest_offline_message(&self, username: &str) -> Result<(), StorageError> {
        if let Some(queue) = self.write().await?.offline.get_mut(username) {
            queue.pop_front();
        }
        Ok(())
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.write().await?.offline.remove(username);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_cluster_compatible(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scram::PasswordMaterial;

    fn user(name: &str) -> User {
        User::new(name, PasswordMaterial::derive("pencil", 64).unwrap())
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let storage = MemoryStorage::new();
        storage.upsert_user(&user("ortuman")).await.unwrap();
        assert!(storage.user_exists("ortuman").await.unwrap());
        assert!(!storage.user_exists("hamlet").await.unwrap());

        storage.upsert_vcard("ortuman", &XElement::new("vCard")).await.unwrap();
        storage
            .insert_blocklist_item(&BlockListItem {
                username: "ortuman".into(),
                jid: "hamlet@jackal.im".into(),
            })
            .await
            .unwrap();

        storage.delete_user("ortuman").await.unwrap();
        assert!(storage.fetch_user("ortuman").await.unwrap().is_none());
        assert!(storage.fetch_vcard("ortuman").await.unwrap().is_none());
        assert!(storage.fetch_blocklist_items("ortuman").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_roster_versions_increase() {
        let storage = MemoryStorage::new();
        let v1 = storage
            .upsert_roster_item(&RosterItem::new("ortuman", "noelia@jackal.im"))
            .await
            .unwrap();
        let v2 = storage
            .upsert_roster_item(&RosterItem::new("ortuman", "hamlet@jackal.im"))
            .await
            .unwrap();
        assert!(v2.current > v1.current);

        let item = storage
            .fetch_roster_item("ortuman", "hamlet@jackal.im")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.version, v2.current);

        let v3 = storage.delete_roster_item("ortuman", "hamlet@jackal.im").await.unwrap();
        assert_eq!(v3.current, v2.current + 1);
        assert_eq!(v3.last_deletion, v3.current);

        let v4 = storage.delete_roster_item("ortuman", "missing@jackal.im").await.unwrap();
        assert_eq!(v4, v3);
    }

    #[tokio::test]
    async fn test_roster_groups_filter() {
        let storage = MemoryStorage::new();
        let mut item = RosterItem::new("ortuman", "noelia@jackal.im");
        item.groups.insert("friends".into());
        storage.upsert_roster_item(&item).await.unwrap();
        storage
            .upsert_roster_item(&RosterItem::new("ortuman", "hamlet@jackal.im"))
            .await
            .unwrap();

        let items = storage
            .fetch_roster_items_in_groups("ortuman", &["friends".to_string()])
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].jid, "noelia@jackal.im");
    }

    #[tokio::test]
    async fn test_presences_by_allocation() {
        let storage = MemoryStorage::new();
        for (res, alloc) in [("balcony", "a1"), ("garden", "a2")] {
            storage
                .upsert_presence(&PresenceRecord {
                    jid: Jid::parse(&format!("ortuman@jackal.im/{res}")).unwrap(),
                    presence: XElement::new("presence"),
                    caps_key: None,
                    allocation_id: alloc.into(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let bare = Jid::parse("ortuman@jackal.im").unwrap();
        assert_eq!(storage.fetch_presences_matching_jid(&bare).await.unwrap().len(), 2);

        assert_eq!(storage.delete_allocation_presences("a1").await.unwrap(), 1);
        let left = storage.fetch_presences_matching_jid(&bare).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].jid.resource(), "garden");
    }

    #[tokio::test]
    async fn test_node_items_bounded() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            let item = PubSubItem {
                id: format!("i{i}"),
                publisher: "ortuman@jackal.im".into(),
                payload: XElement::new("entry"),
                published_at: Utc::now(),
            };
            storage
                .upsert_node_item("ortuman@jackal.im", "urn:xmpp:microblog:0", &item, 3)
                .await
                .unwrap();
        }
        let items = storage
            .fetch_node_items("ortuman@jackal.im", "urn:xmpp:microblog:0")
            .await
            .unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i2", "i3", "i4"]);
    }

    #[tokio::test]
    async fn test_closed_storage_fails() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.user_exists("ortuman").await,
            Err(StorageError::Closed)
        ));
        assert!(!storage.is_cluster_compatible());
    }
}
