//! Presence hub (RFC 6121 Section 4).
//!
//! Tracks the availability of local resources and fans it out:
//! - available/unavailable presence from a client goes to the user's other
//!   resources and to every contact with a `from`/`both` subscription
//! - the first available presence of a resource probes the contacts the
//!   user is subscribed to
//! - probes from remote servers are answered for subscribed contacts
//! - advertised entity capabilities are resolved once per `(node, ver)`

pub mod subscription;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

pub use subscription::SubscriptionDirection;

use crate::jid::Jid;
use crate::modules::{deliver, IqHandler};
use crate::router::Router;
use crate::stanza::{Caps, Iq, IqType, Presence, PresenceType};
use crate::storage::{Capabilities, PresenceRecord, RosterItem};
use crate::stream::C2sStream;
use crate::xep::xep0115;

/// Allocation id of presences stored by a node outside a cluster.
pub const LOCAL_ALLOCATION_ID: &str = "local";

const CAPS_REQUEST_TTL: Duration = Duration::from_secs(60);

struct PendingCaps {
    caps: Caps,
    sent_at: Instant,
}

pub struct PresenceHub {
    router: Arc<Router>,
    caps_enabled: bool,
    pending_caps: DashMap<String, PendingCaps>,
}

impl PresenceHub {
    pub fn new(router: Arc<Router>, caps_enabled: bool) -> Self {
        Self {
            router,
            caps_enabled,
            pending_caps: DashMap::new(),
        }
    }

    fn allocation_id(&self) -> String {
        self.router
            .cluster()
            .map_or_else(|| LOCAL_ALLOCATION_ID.to_string(), |c| c.local_node().to_string())
    }

    /// Apply a presence a client addressed to its own account. Returns
    /// `true` for the initial presence of the resource.
    #[instrument(skip_all, fields(jid = %presence.from()))]
    pub async fn process_own_presence(&self, stream: &Arc<dyn C2sStream>, presence: &Presence) -> bool {
        let was_available = stream.presence().is_some_and(|p| p.is_available());
        stream.set_presence(Some(presence.clone()));
        self.router.presence_updated(stream.as_ref()).await;

        if presence.is_available() {
            self.store_presence(presence).await;
            if self.caps_enabled {
                if let Some(caps) = presence.caps() {
                    self.resolve_caps(presence.from(), caps).await;
                }
            }
            self.broadcast(stream, presence).await;
            if !was_available {
                self.probe_contacts(stream).await;
                return true;
            }
            return false;
        }

        if let Err(e) = self.router.storage().delete_presence(presence.from()).await {
            warn!(error = %e, "Failed to delete presence");
        }
        if was_available {
            self.broadcast(stream, presence).await;
        }
        false
    }

    /// A bound stream went away: announce it unavailable if it was
    /// available.
    pub async fn stream_gone(&self, stream: &Arc<dyn C2sStream>) {
        if !stream.presence().is_some_and(|p| p.is_available()) {
            return;
        }
        let jid = stream.jid();
        let unavailable = Presence::build(PresenceType::Unavailable, jid.clone(), jid.to_bare());
        stream.set_presence(Some(unavailable.clone()));
        if let Err(e) = self.router.storage().delete_presence(&jid).await {
            warn!(error = %e, "Failed to delete presence");
        }
        self.broadcast(stream, &unavailable).await;
    }

    /// Answer a probe for a local user on behalf of its available
    /// resources.
    pub async fn answer_probe(&self, probe: &Presence) {
        let user = probe.to();
        let prober = probe.from().to_bare();
        let item = match self
            .router
            .storage()
            .fetch_roster_item(user.node(), &prober.to_string())
            .await
        {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Failed to fetch roster item");
                return;
            }
        };
        if !item.is_some_and(|i| i.subscription.has_from()) {
            debug!(prober = %prober, user = %user, "Ignoring probe from unsubscribed entity");
            return;
        }
        for stream in self.router.registry().streams(user.node()) {
            if let Some(p) = stream.presence().filter(Presence::is_available) {
                deliver(&self.router, p.readdressed(stream.jid(), probe.from().clone())).await;
            }
        }
    }

    async fn store_presence(&self, presence: &Presence) {
        let record = PresenceRecord {
            jid: presence.from().clone(),
            presence: presence.element().clone(),
            caps_key: presence.caps().map(|c| (c.node.clone(), c.ver.clone())),
            allocation_id: self.allocation_id(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.router.storage().upsert_presence(&record).await {
            warn!(error = %e, "Failed to store presence");
        }
    }

    async fn contacts(&self, username: &str) -> Vec<RosterItem> {
        match self.router.storage().fetch_roster_items(username).await {
            Ok(items) => items,
            Err(e) => {
                warn!(username, error = %e, "Failed to fetch roster items");
                Vec::new()
            }
        }
    }

    async fn broadcast(&self, stream: &Arc<dyn C2sStream>, presence: &Presence) {
        let from = stream.jid();
        for other in self.router.registry().streams(from.node()) {
            if other.id() != stream.id() {
                other
                    .send_element(presence.readdressed(from.clone(), other.jid()).into_element())
                    .await;
            }
        }
        for item in self.contacts(from.node()).await {
            if !item.subscription.has_from() {
                continue;
            }
            let Ok(contact) = Jid::parse(&item.jid) else {
                continue;
            };
            deliver(&self.router, presence.readdressed(from.clone(), contact)).await;
        }
    }

    async fn probe_contacts(&self, stream: &Arc<dyn C2sStream>) {
        let jid = stream.jid();
        for item in self.contacts(jid.node()).await {
            if !item.subscription.has_to() {
                continue;
            }
            let Ok(contact) = Jid::parse(&item.jid) else {
                continue;
            };
            if self.router.hosts().is_local_host(contact.domain()) {
                for contact_stream in self.router.registry().streams(contact.node()) {
                    if let Some(p) = contact_stream.presence().filter(Presence::is_available) {
                        stream
                            .send_element(p.readdressed(contact_stream.jid(), jid.clone()).into_element())
                            .await;
                    }
                }
            } else {
                deliver(&self.router, Presence::build(PresenceType::Probe, jid.to_bare(), contact)).await;
            }
        }
    }

    async fn resolve_caps(&self, entity: &Jid, caps: &Caps) {
        match self.router.storage().fetch_capabilities(&caps.node, &caps.ver).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to fetch capabilities");
                return;
            }
        }
        self.pending_caps.retain(|_, p| p.sent_at.elapsed() < CAPS_REQUEST_TTL);
        if self.pending_caps.iter().any(|p| p.caps.node == caps.node && p.caps.ver == caps.ver) {
            return;
        }
        let iq = Iq::request(
            IqType::Get,
            Jid::domain_jid(entity.domain()).unwrap_or_else(|_| self.router.hosts().default_jid().clone()),
            entity.clone(),
            xep0115::disco_info_query(caps),
        );
        debug!(node = %caps.node, ver = %caps.ver, "Requesting capabilities");
        self.pending_caps.insert(
            iq.id().to_string(),
            PendingCaps {
                caps: caps.clone(),
                sent_at: Instant::now(),
            },
        );
        deliver(&self.router, iq).await;
    }
}

#[async_trait]
impl IqHandler for PresenceHub {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn server_features(&self) -> Vec<&'static str> {
        if self.caps_enabled {
            vec![crate::xml::ns::CAPS]
        } else {
            Vec::new()
        }
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        !iq.is_request() && self.pending_caps.contains_key(iq.id())
    }

    async fn process_iq(&self, iq: &Iq) {
        let Some((_, pending)) = self.pending_caps.remove(iq.id()) else {
            return;
        };
        let Some(query) = iq.payload().filter(|_| iq.iq_type() == IqType::Result) else {
            debug!(node = %pending.caps.node, "Capabilities request failed");
            return;
        };
        if !xep0115::verify(&pending.caps, query) {
            warn!(node = %pending.caps.node, ver = %pending.caps.ver, "Capabilities do not match advertised hash");
            return;
        }
        let capabilities = Capabilities {
            node: pending.caps.node,
            ver: pending.caps.ver,
            features: xep0115::features_from_info(query),
        };
        if let Err(e) = self.router.storage().upsert_capabilities(&capabilities).await {
            warn!(error = %e, "Failed to store capabilities");
        }
    }
}
