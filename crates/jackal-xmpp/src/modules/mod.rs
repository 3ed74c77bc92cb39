//! Server-side IM modules.
//!
//! IQ-based modules implement [`IqHandler`]; [`Modules`] owns the enabled
//! set and is what a client stream talks to for everything that is not a
//! plain routed stanza:
//!
//! ```text
//! c2s stream --iq--------> Modules --matches_iq--> roster / vcard / ping ...
//!            --presence--> Modules --> presence hub, roster subscriptions,
//!                                      offline delivery on initial presence
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::disco::Disco;
use crate::presence::{PresenceHub, SubscriptionDirection};
use crate::pubsub::{Pep, PubSubConfig};
use crate::roster::{Roster, RosterConfig};
use crate::router::{OfflineArchiver, Router};
use crate::stanza::{ErrorReply, Iq, Presence, PresenceType, Stanza};
use crate::stream::C2sStream;
use crate::xep::xep0049::PrivateStorage;
use crate::xep::xep0054::VCards;
use crate::xep::xep0092::{Version, VersionConfig};
use crate::xep::xep0160::{Offline, OfflineConfig};
use crate::xep::xep0191::Blocking;
use crate::xep::xep0199::{Ping, PingConfig};
use crate::xml::XElement;

/// A module answering IQs.
#[async_trait]
pub trait IqHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Features announced in disco#info of the server domain.
    fn server_features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Features announced in disco#info of a local account.
    fn account_features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn matches_iq(&self, iq: &Iq) -> bool;

    /// Handle a matched IQ. Replies are routed back to its sender.
    async fn process_iq(&self, iq: &Iq);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Names of the enabled modules.
    pub enabled: Vec<String>,
    pub roster: RosterConfig,
    pub offline: OfflineConfig,
    pub version: VersionConfig,
    pub ping: PingConfig,
    pub pubsub: PubSubConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: [
                "roster", "offline", "blocking", "private", "vcard", "version", "ping", "disco", "pubsub",
                "caps",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            roster: RosterConfig::default(),
            offline: OfflineConfig::default(),
            version: VersionConfig::default(),
            ping: PingConfig::default(),
            pubsub: PubSubConfig::default(),
        }
    }
}

impl ModulesConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|m| m == name)
    }
}

/// Route an IQ reply, logging failures.
pub(crate) async fn reply(router: &Router, iq: Iq) {
    let stanza = Stanza::Iq(iq);
    if let Err(e) = router.must_route(&stanza).await {
        debug!(to = %stanza.to(), error = %e, "Failed to deliver IQ reply");
    }
}

/// Route a server-originated stanza, logging failures.
pub(crate) async fn deliver(router: &Router, stanza: impl Into<Stanza>) {
    let stanza = stanza.into();
    if let Err(e) = router.must_route(&stanza).await {
        debug!(to = %stanza.to(), error = %e, "Failed to deliver stanza");
    }
}

/// The enabled module set.
pub struct Modules {
    router: Arc<Router>,
    handlers: Vec<Arc<dyn IqHandler>>,
    hub: Arc<PresenceHub>,
    roster: Option<Arc<Roster>>,
    offline: Option<Arc<Offline>>,
    ping: Option<Arc<Ping>>,
}

impl Modules {
    pub fn new(config: &ModulesConfig, router: Arc<Router>) -> Arc<Self> {
        let mut handlers: Vec<Arc<dyn IqHandler>> = Vec::new();

        let roster = config.is_enabled("roster").then(|| {
            let roster = Arc::new(Roster::new(config.roster.clone(), Arc::clone(&router)));
            handlers.push(roster.clone());
            roster
        });

        let hub = Arc::new(PresenceHub::new(Arc::clone(&router), config.is_enabled("caps")));
        handlers.push(hub.clone());

        let offline = config.is_enabled("offline").then(|| {
            let offline = Arc::new(Offline::new(config.offline.clone(), Arc::clone(&router)));
            let archiver: Arc<dyn OfflineArchiver> = offline.clone();
            router.set_offline_archiver(Arc::downgrade(&archiver));
            offline
        });

        if config.is_enabled("blocking") {
            handlers.push(Arc::new(Blocking::new(Arc::clone(&router))));
        }
        if config.is_enabled("private") {
            handlers.push(Arc::new(PrivateStorage::new(Arc::clone(&router))));
        }
        if config.is_enabled("vcard") {
            handlers.push(Arc::new(VCards::new(Arc::clone(&router))));
        }
        if config.is_enabled("version") {
            handlers.push(Arc::new(Version::new(config.version.clone(), Arc::clone(&router))));
        }
        if config.is_enabled("pubsub") {
            handlers.push(Arc::new(Pep::new(config.pubsub.clone(), Arc::clone(&router))));
        }
        let ping = config.is_enabled("ping").then(|| {
            let ping = Arc::new(Ping::new(config.ping.clone(), Arc::clone(&router)));
            handlers.push(ping.clone());
            ping
        });
        if config.is_enabled("disco") {
            let disco = Disco::new(Arc::clone(&router), &handlers);
            handlers.push(Arc::new(disco));
        }

        info!(modules = ?handlers.iter().map(|h| h.name()).collect::<Vec<_>>(), "Modules enabled");
        Arc::new(Self {
            router,
            handlers,
            hub,
            roster,
            offline,
            ping,
        })
    }

    /// Extra `<stream:features/>` children offered after authentication.
    pub fn stream_features(&self) -> Vec<XElement> {
        self.roster
            .as_ref()
            .and_then(|r| r.stream_feature())
            .into_iter()
            .collect()
    }

    /// Handle an IQ sent by a local client. Returns `false` when no module
    /// claims it and it should be routed.
    pub async fn process_iq(&self, iq: &Iq) -> bool {
        match self.handlers.iter().find(|h| h.matches_iq(iq)) {
            Some(handler) => {
                debug!(module = handler.name(), id = %iq.id(), "Processing IQ");
                handler.process_iq(iq).await;
                true
            }
            None => false,
        }
    }

    /// Answer an unhandled request addressed to the server itself.
    pub async fn reject_iq(&self, iq: &Iq) {
        if iq.is_request() {
            reply(&self.router, iq.service_unavailable()).await;
        }
    }

    /// Handle a presence sent by a local client. Returns `false` when it is
    /// a directed presence that should simply be routed.
    pub async fn process_presence(&self, stream: &Arc<dyn C2sStream>, presence: &Presence) -> bool {
        let presence_type = presence.presence_type();
        if presence_type.is_subscription() {
            match &self.roster {
                Some(roster) => roster.process_subscription(presence, SubscriptionDirection::Outbound).await,
                None => deliver(&self.router, presence.clone()).await,
            }
            return true;
        }
        let to = presence.to();
        let to_self = to.resource().is_empty() && to.matches_bare(presence.from());
        if !to_self {
            return false;
        }
        match presence_type {
            PresenceType::Available | PresenceType::Unavailable => {
                let initial = self.hub.process_own_presence(stream, presence).await;
                if initial {
                    if let Some(roster) = &self.roster {
                        roster.deliver_pending_requests(stream).await;
                    }
                    if let Some(offline) = &self.offline {
                        offline.deliver(stream).await;
                    }
                }
            }
            other => debug!(presence_type = ?other, "Ignoring presence addressed to own account"),
        }
        true
    }

    /// Handle a presence received from a remote server for a local user.
    /// Returns `false` when it should simply be routed.
    pub async fn process_remote_presence(&self, presence: &Presence) -> bool {
        let presence_type = presence.presence_type();
        if presence_type.is_subscription() {
            if let Some(roster) = &self.roster {
                roster.process_subscription(presence, SubscriptionDirection::Inbound).await;
                return true;
            }
            return false;
        }
        if presence_type == PresenceType::Probe {
            self.hub.answer_probe(presence).await;
            return true;
        }
        false
    }

    /// A client stream finished resource binding.
    pub fn stream_bound(&self, stream: &Arc<dyn C2sStream>) {
        if let Some(ping) = &self.ping {
            ping.start(stream);
        }
    }

    /// A bound client stream is going away.
    pub async fn stream_unbound(&self, stream: &Arc<dyn C2sStream>) {
        if let Some(ping) = &self.ping {
            ping.stop(stream.id());
        }
        self.hub.stream_gone(stream).await;
    }

    pub fn shutdown(&self) {
        if let Some(ping) = &self.ping {
            ping.stop_all();
        }
    }
}
