//! XEP-0160: Best Practices for Handling Offline Messages
//!
//! Chat and normal messages with a body, addressed to an existing user with
//! no bound resource, are stamped with a XEP-0203 `<delay/>` and stored.
//! They are delivered and purged on the user's next initial presence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::StanzaErrorCondition;
use crate::router::{OfflineArchiver, Router};
use crate::stanza::{Message, Stanza};
use crate::stream::C2sStream;
use crate::xml::{ns, XElement};

/// What to do with a new message once a user's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new message with `service-unavailable`.
    #[default]
    RejectNew,
    /// Drop the oldest stored message to make room.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum number of stored messages per user.
    pub queue_size: usize,
    pub overflow: OverflowPolicy,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            overflow: OverflowPolicy::RejectNew,
        }
    }
}

/// Copy of `message` carrying a delay stamp from `domain`.
pub fn stamp_delay(message: &Message, domain: &str) -> Message {
    let delay = XElement::builder("delay")
        .attr("xmlns", ns::DELAY)
        .attr("from", domain)
        .attr("stamp", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
        .text("Offline Storage")
        .build();
    message.with_child(delay)
}

pub struct Offline {
    config: OfflineConfig,
    router: Arc<Router>,
}

impl Offline {
    pub fn new(config: OfflineConfig, router: Arc<Router>) -> Self {
        Self { config, router }
    }

    /// Send stored messages to a stream that just became available and
    /// purge them.
    #[instrument(skip_all, fields(jid = %stream.jid()))]
    pub async fn deliver(&self, stream: &Arc<dyn C2sStream>) {
        let username = stream.username();
        let storage = self.router.storage();
        let messages = match storage.fetch_offline_messages(&username).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "Failed to fetch offline messages");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        for offline in messages {
            let result = stream.send_element(offline.message.into_element()).await;
            if !result.is_sent() {
                // Keep the archive; a later session gets the whole batch again.
                warn!(?result, count, "Offline delivery interrupted, archive kept");
                return;
            }
        }
        if let Err(e) = storage.delete_offline_messages(&username).await {
            warn!(error = %e, "Failed to purge offline messages");
            return;
        }
        info!(count, "Delivered offline messages");
    }

    async fn reject(&self, message: &Message) {
        self.router
            .bounce(&Stanza::Message(message.clone()), StanzaErrorCondition::ServiceUnavailable)
            .await;
    }
}

#[async_trait]
impl OfflineArchiver for Offline {
    #[instrument(skip_all, fields(to = %message.to()))]
    async fn archive_message(&self, message: &Message) -> bool {
        if !(message.is_chat() || message.is_normal()) || message.body().is_none() {
            return false;
        }
        let username = message.to().node();
        let storage = self.router.storage();

        let stored = match storage.count_offline_messages(username).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count offline messages");
                return false;
            }
        };
        if stored >= self.config.queue_size {
            match self.config.overflow {
                OverflowPolicy::RejectNew => {
                    debug!(stored, "Offline queue full, rejecting message");
                    self.reject(message).await;
                    return true;
                }
                OverflowPolicy::DropOldest => {
                    if let Err(e) = storage.delete_oldest_offline_message(username).await {
                        warn!(error = %e, "Failed to drop oldest offline message");
                        return false;
                    }
                }
            }
        }

        let stamped = stamp_delay(message, message.to().domain());
        match storage.insert_offline_message(username, &stamped).await {
            Ok(()) => {
                debug!("Message archived");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to archive message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Hosts;
    use crate::jid::Jid;
    use crate::registry::StreamRegistry;
    use crate::storage::{MemoryStorage, OfflineRepository};

    fn chat(body: Option<&str>) -> Message {
        let mut el = XElement::builder("message").attr("type", "chat");
        if let Some(body) = body {
            el = el.child(XElement::builder("body").text(body).build());
        }
        Message::new(
            el.build(),
            Jid::parse("hamlet@jackal.im/castle").unwrap(),
            Jid::parse("ophelia@jackal.im").unwrap(),
        )
        .unwrap()
    }

    fn offline(config: OfflineConfig) -> (Offline, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let router = Router::new(
            Arc::new(Hosts::plain(["jackal.im"]).unwrap()),
            Arc::new(StreamRegistry::new()),
            storage.clone(),
            None,
        );
        (Offline::new(config, Arc::new(router)), storage)
    }

    #[test]
    fn test_overflow_policy_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            overflow: OverflowPolicy,
        }
        let w: Wrapper = serde_json::from_str(r#"{"overflow":"drop-oldest"}"#).unwrap();
        assert_eq!(w.overflow, OverflowPolicy::DropOldest);
        assert_eq!(OfflineConfig::default().overflow, OverflowPolicy::RejectNew);
    }

    #[test]
    fn test_stamp_delay() {
        let stamped = stamp_delay(&chat(Some("hi")), "jackal.im");
        let delay = stamped.element().child_ns("delay", ns::DELAY).unwrap();
        assert_eq!(delay.attr("from"), Some("jackal.im"));
        assert!(delay.attr("stamp").is_some_and(|s| s.ends_with('Z')));
    }

    #[tokio::test]
    async fn test_skips_messages_without_body() {
        let (offline, storage) = offline(OfflineConfig::default());
        assert!(!offline.archive_message(&chat(None)).await);
        assert_eq!(storage.count_offline_messages("ophelia").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_quota() {
        let (offline, storage) = offline(OfflineConfig {
            queue_size: 2,
            overflow: OverflowPolicy::DropOldest,
        });
        for body in ["one", "two", "three"] {
            assert!(offline.archive_message(&chat(Some(body))).await);
        }
        let stored = storage.fetch_offline_messages("ophelia").await.unwrap();
        let bodies: Vec<_> = stored.iter().filter_map(|m| m.message.body()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_reject_new_when_full() {
        let (offline, storage) = offline(OfflineConfig {
            queue_size: 1,
            overflow: OverflowPolicy::RejectNew,
        });
        assert!(offline.archive_message(&chat(Some("one"))).await);
        assert!(offline.archive_message(&chat(Some("two"))).await);
        assert_eq!(storage.count_offline_messages("ophelia").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deliver_keeps_archive_when_stream_is_full() {
        use crate::stream::LocalStream;

        let (offline, storage) = offline(OfflineConfig::default());
        assert!(offline.archive_message(&chat(Some("one"))).await);
        assert!(offline.archive_message(&chat(Some("two"))).await);

        let address = Jid::parse("ophelia@jackal.im/balcony").unwrap();
        let (small, _rx) = LocalStream::new("s1", address.clone(), 1);
        let small: Arc<dyn C2sStream> = Arc::new(small);
        offline.deliver(&small).await;
        assert_eq!(storage.count_offline_messages("ophelia").await.unwrap(), 2);

        let (roomy, mut rx) = LocalStream::new("s2", address, 8);
        let roomy: Arc<dyn C2sStream> = Arc::new(roomy);
        offline.deliver(&roomy).await;
        assert_eq!(storage.count_offline_messages("ophelia").await.unwrap(), 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
