use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::stream::C2sStream;

/// Registry of bound streams.
///
/// Sharded by username; each shard holds the short list of that user's
/// resources. No lock is held while talking to a stream.
pub struct StreamRegistry {
    streams: DashMap<String, Vec<Arc<dyn C2sStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        info!("Creating stream registry");
        Self {
            streams: DashMap::new(),
        }
    }

    /// Register a bound stream. Returns `false` (and leaves the registry
    /// untouched) when the `(username, resource)` key is already taken.
    #[instrument(skip(self, stream), fields(jid = %stream.jid()))]
    pub fn bind(&self, stream: Arc<dyn C2sStream>) -> bool {
        let resource = stream.resource();
        let mut entry = self.streams.entry(stream.username()).or_default();
        if entry.iter().any(|s| s.resource() == resource) {
            debug!("Resource already bound");
            return false;
        }
        entry.push(stream);
        debug!("Stream bound");
        true
    }

    /// Remove the stream bound at `(username, resource)`.
    #[instrument(skip(self))]
    pub fn unbind(&self, username: &str, resource: &str) -> Option<Arc<dyn C2sStream>> {
        self.remove_where(username, |s| s.resource() == resource)
    }

    /// Remove the stream bound at `(username, resource)` only if it is the
    /// stream identified by `stream_id`. A replaced stream that finishes
    /// after its successor bound must not unbind the successor.
    pub fn unbind_stream(&self, stream_id: &str, username: &str, resource: &str) -> bool {
        self.remove_where(username, |s| s.id() == stream_id && s.resource() == resource)
            .is_some()
    }

    fn remove_where(
        &self,
        username: &str,
        pred: impl Fn(&Arc<dyn C2sStream>) -> bool,
    ) -> Option<Arc<dyn C2sStream>> {
        let removed = {
            let mut entry = self.streams.get_mut(username)?;
            let pos = entry.iter().position(&pred)?;
            entry.remove(pos)
        };
        self.streams.remove_if(username, |_, v| v.is_empty());
        debug!(username, resource = %removed.resource(), "Stream unbound");
        Some(removed)
    }

    pub fn stream(&self, username: &str, resource: &str) -> Option<Arc<dyn C2sStream>> {
        self.streams
            .get(username)
            .and_then(|e| e.iter().find(|s| s.resource() == resource).cloned())
    }

    /// Every bound resource of `username`, in bind order.
    pub fn streams(&self, username: &str) -> Vec<Arc<dyn C2sStream>> {
        self.streams.get(username).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn all_streams(&self) -> Vec<Arc<dyn C2sStream>> {
        self.streams.iter().flat_map(|e| e.value().clone()).collect()
    }

    /// Streams owned by this node (excludes cluster proxies).
    pub fn local_streams(&self) -> Vec<Arc<dyn C2sStream>> {
        self.streams
            .iter()
            .flat_map(|e| e.value().clone())
            .filter(|s| s.cluster_node().is_none())
            .collect()
    }

    /// Drop every proxy owned by cluster node `node`.
    pub fn remove_cluster_node(&self, node: &str) -> usize {
        let mut removed = 0;
        self.streams.retain(|_, streams| {
            let before = streams.len();
            streams.retain(|s| s.cluster_node() != Some(node));
            removed += before - streams.len();
            !streams.is_empty()
        });
        if removed > 0 {
            info!(node, removed, "Removed streams of departed cluster node");
        }
        removed
    }

    /// Number of bound streams.
    pub fn len(&self) -> usize {
        self.streams.iter().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("stream_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;
    use crate::stream::LocalStream;

    fn stream(id: &str, jid: &str) -> Arc<dyn C2sStream> {
        let (stream, _rx) = LocalStream::new(id, Jid::parse(jid).unwrap(), 4);
        Arc::new(stream)
    }

    #[test]
    fn test_bind_is_idempotent() {
        let registry = StreamRegistry::new();
        assert!(registry.bind(stream("s1", "ortuman@jackal.im/balcony")));
        assert!(!registry.bind(stream("s2", "ortuman@jackal.im/balcony")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stream("ortuman", "balcony").unwrap().id(), "s1");
    }

    #[test]
    fn test_streams_and_unbind() {
        let registry = StreamRegistry::new();
        registry.bind(stream("s1", "ortuman@jackal.im/balcony"));
        registry.bind(stream("s2", "ortuman@jackal.im/garden"));
        registry.bind(stream("s3", "noelia@jackal.im/yard"));

        let ids: Vec<_> = registry.streams("ortuman").iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        assert!(registry.unbind("ortuman", "balcony").is_some());
        assert!(registry.unbind("ortuman", "balcony").is_none());
        assert!(registry.stream("ortuman", "balcony").is_none());
        assert_eq!(registry.len(), 2);

        registry.unbind("ortuman", "garden");
        assert!(registry.streams("ortuman").is_empty());
    }

    #[test]
    fn test_unbind_stream_checks_id() {
        let registry = StreamRegistry::new();
        registry.bind(stream("new", "ortuman@jackal.im/balcony"));
        assert!(!registry.unbind_stream("old", "ortuman", "balcony"));
        assert!(registry.unbind_stream("new", "ortuman", "balcony"));
        assert!(registry.is_empty());
    }
}
