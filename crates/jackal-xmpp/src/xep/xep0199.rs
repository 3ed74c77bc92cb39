//! XEP-0199: XMPP Ping
//!
//! Answers client pings addressed to the server. With `send` enabled the
//! server also pings every bound resource each `send_interval` and closes
//! streams that do not answer within `ack_timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StreamErrorCondition;
use crate::jid::Jid;
use crate::modules::{reply, IqHandler};
use crate::router::Router;
use crate::stanza::{Iq, IqType};
use crate::stream::C2sStream;
use crate::xml::{ns, XElement};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Ping bound resources periodically.
    pub send: bool,
    #[serde(with = "humantime_serde")]
    pub send_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            send: false,
            send_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(32),
        }
    }
}

pub fn ping_element() -> XElement {
    XElement::builder("ping").attr("xmlns", ns::PING).build()
}

type PendingPings = DashMap<String, oneshot::Sender<()>>;

pub struct Ping {
    config: PingConfig,
    router: Arc<Router>,
    pending: Arc<PendingPings>,
    tasks: DashMap<String, CancellationToken>,
}

impl Ping {
    pub fn new(config: PingConfig, router: Arc<Router>) -> Self {
        Self {
            config,
            router,
            pending: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
        }
    }

    /// Start pinging a bound stream. No-op unless server pings are enabled.
    pub fn start(&self, stream: &Arc<dyn C2sStream>) {
        if !self.config.send {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.tasks.insert(stream.id().to_string(), token.clone()) {
            previous.cancel();
        }
        tokio::spawn(ping_loop(
            self.config.clone(),
            Arc::clone(stream),
            Arc::clone(&self.pending),
            token,
        ));
    }

    pub fn stop(&self, stream_id: &str) {
        if let Some((_, token)) = self.tasks.remove(stream_id) {
            token.cancel();
        }
    }

    pub fn stop_all(&self) {
        let count = self.tasks.len();
        for entry in self.tasks.iter() {
            entry.value().cancel();
        }
        self.tasks.clear();
        if count > 0 {
            info!(count, "Stopped server pings");
        }
    }
}

async fn ping_loop(
    config: PingConfig,
    stream: Arc<dyn C2sStream>,
    pending: Arc<PendingPings>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.send_interval);
    // First tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let jid = stream.jid();
        let from = match Jid::domain_jid(jid.domain()) {
            Ok(from) => from,
            Err(_) => return,
        };
        let iq = Iq::request(IqType::Get, from, jid, ping_element());
        let id = iq.id().to_string();
        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), tx);
        stream.send_element(iq.into_element()).await;

        let answered = tokio::select! {
            _ = shutdown.cancelled() => {
                pending.remove(&id);
                return;
            }
            answer = tokio::time::timeout(config.ack_timeout, rx) => matches!(answer, Ok(Ok(()))),
        };
        if !answered {
            pending.remove(&id);
            debug!(stream = %stream.id(), "Ping timed out");
            stream.disconnect(Some(StreamErrorCondition::ConnectionTimeout)).await;
            return;
        }
    }
}

#[async_trait]
impl IqHandler for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::PING]
    }

    fn matches_iq(&self, iq: &Iq) -> bool {
        if iq.is_request() {
            iq.is_get() && iq.to().is_server() && iq.payload_ns("ping", ns::PING).is_some()
        } else {
            self.pending.contains_key(iq.id())
        }
    }

    async fn process_iq(&self, iq: &Iq) {
        if iq.is_request() {
            reply(&self.router, iq.result()).await;
            return;
        }
        if let Some((_, ack)) = self.pending.remove(iq.id()) {
            let _ = ack.send(());
        }
    }
}
