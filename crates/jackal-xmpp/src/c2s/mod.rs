//! Client-to-server (C2S) listeners.
//!
//! Each configured listener accepts either raw TCP (with STARTTLS) or
//! RFC 7395 WebSocket connections. Every connection runs as one task that
//! owns its session; once bound, the rest of the server reaches it through
//! its [`LocalStream`](crate::stream::LocalStream) handle.

mod stream;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use crate::modules::Modules;
use crate::router::Router;
use crate::transport::{SocketTransport, Transport};
use crate::types::{ResourceConflict, SaslMechanism, TransportType};
use crate::xml::parser::DEFAULT_MAX_STANZA_SIZE;
use crate::XmppError;

/// One client listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct C2sConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub transport: TransportType,
    pub bind: String,
    pub port: u16,
    /// Time a connection has to authenticate and bind a resource.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_stanza_size: usize,
    pub resource_conflict: ResourceConflict,
    /// Offered SASL mechanisms, in preference order.
    pub sasl: Vec<SaslMechanism>,
    /// WebSocket endpoint path.
    pub url_path: String,
    /// Capacity of each bound stream's outgoing queue.
    pub queue_size: usize,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            transport: TransportType::Socket,
            bind: "0.0.0.0".to_string(),
            port: 5222,
            connect_timeout: Duration::from_secs(5),
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            resource_conflict: ResourceConflict::default(),
            sasl: SaslMechanism::all(),
            url_path: "/xmpp-websocket".to_string(),
            queue_size: 256,
        }
    }
}

/// Accepts client connections and tracks their tasks.
pub struct C2sListener {
    config: Arc<C2sConfig>,
    router: Arc<Router>,
    modules: Arc<Modules>,
    tasks: TaskTracker,
}

impl C2sListener {
    pub fn new(config: C2sConfig, router: Arc<Router>, modules: Arc<Modules>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            router,
            modules,
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &C2sConfig {
        &self.config
    }

    /// Accept connections until `shutdown` fires, then wait for the open
    /// connections to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), XmppError> {
        match self.config.transport {
            TransportType::Socket => self.clone().accept_sockets(shutdown).await?,
            TransportType::WebSocket => websocket::serve(self.clone(), shutdown).await?,
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!(listener = %self.config.id, "C2S listener stopped");
        Ok(())
    }

    async fn accept_sockets(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), XmppError> {
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        info!(listener = %self.config.id, addr = %listener.local_addr()?, "XMPP C2S server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let span = info_span!(
                            "c2s",
                            listener = %self.config.id,
                            peer = %peer_addr,
                            jid = tracing::field::Empty,
                        );
                        self.spawn(SocketTransport::new(tcp), shutdown.child_token(), span);
                    }
                    Err(e) => warn!(error = %e, "Failed to accept C2S connection"),
                },
            }
        }
    }

    fn spawn<T: Transport + 'static>(self: &Arc<Self>, transport: T, shutdown: CancellationToken, span: tracing::Span) {
        let listener = Arc::clone(self);
        self.tasks
            .spawn(async move { listener.serve(transport, shutdown).await }.instrument(span));
    }

    /// Drive one client connection over `transport` until it ends.
    pub async fn serve<T: Transport>(&self, transport: T, shutdown: CancellationToken) {
        let ctx = stream::C2sContext {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            modules: Arc::clone(&self.modules),
        };
        stream::serve(transport, ctx, shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: C2sConfig = serde_json::from_value(serde_json::json!({
            "id": "ws",
            "type": "websocket",
            "port": 5280,
            "connect_timeout": "3s",
            "resource_conflict": "override",
            "sasl": ["scram_sha_256", "plain"],
        }))
        .unwrap();
        assert_eq!(config.transport, TransportType::WebSocket);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.resource_conflict, ResourceConflict::Override);
        assert_eq!(config.sasl, vec![SaslMechanism::ScramSha256, SaslMechanism::Plain]);
        assert_eq!(config.url_path, "/xmpp-websocket");
        assert_eq!(config.bind, "0.0.0.0");
    }
}
