//! External components (XEP-0114).
//!
//! A component connects to a listener, names its subdomain in the stream
//! opener and proves knowledge of the shared secret with a `<handshake/>`
//! carrying `hex(sha1(stream_id + secret))`. Afterwards the router hands it
//! every stanza addressed to its subdomain, and stanzas it sends are routed
//! like server-originated ones.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::StreamErrorCondition;
use crate::router::Router;
use crate::session::{Received, Session, SessionConfig, SessionError, SessionRole};
use crate::transport::SocketTransport;
use crate::xml::XElement;
use crate::XmppError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub bind: String,
    pub port: u16,
    pub secret: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub max_stanza_size: usize,
    pub queue_size: usize,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5275,
            secret: String::new(),
            connect_timeout: Duration::from_secs(5),
            max_stanza_size: 131_072,
            queue_size: 256,
        }
    }
}

/// Expected `<handshake/>` content for `stream_id`.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ComponentListener {
    config: Arc<ComponentConfig>,
    router: Arc<Router>,
}

impl ComponentListener {
    pub fn new(config: ComponentConfig, router: Arc<Router>) -> Self {
        Self {
            config: Arc::new(config),
            router,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        if self.config.secret.is_empty() {
            return Err(XmppError::config("component listener requires a secret"));
        }
        let listener = TcpListener::bind((self.config.bind.as_str(), self.config.port)).await?;
        info!(addr = %listener.local_addr()?, "XMPP component listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Component listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let config = Arc::clone(&self.config);
                        let router = Arc::clone(&self.router);
                        let shutdown = shutdown.child_token();
                        tokio::spawn(
                            handle_connection(tcp, peer_addr, config, router, shutdown)
                                .instrument(info_span!("component", peer = %peer_addr, domain = tracing::field::Empty)),
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to accept component connection"),
                },
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ComponentConfig>,
    router: Arc<Router>,
    shutdown: CancellationToken,
) {
    debug!(peer = %peer_addr, "New component connection");
    let session_config = SessionConfig {
        role: SessionRole::Component,
        max_stanza_size: config.max_stanza_size,
        initiating: false,
    };
    let session = Session::new(SocketTransport::new(tcp), Arc::clone(router.hosts()), session_config);
    let mut stream = ComponentStream {
        session,
        config,
        router,
        domain: None,
    };
    if let Err(e) = stream.run(shutdown).await {
        debug!(error = %e, "Component stream failed");
    }
    if let Some(domain) = stream.domain.take() {
        stream.router.unregister_component(&domain);
        info!(domain = %domain, "Component disconnected");
    }
    stream.session.shutdown().await;
}

struct ComponentStream {
    session: Session<SocketTransport>,
    config: Arc<ComponentConfig>,
    router: Arc<Router>,
    /// Set once the handshake succeeded and the domain is registered.
    domain: Option<String>,
}

impl ComponentStream {
    async fn run(&mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let (tx, mut rx) = mpsc::channel::<XElement>(self.config.queue_size.max(1));
        let mut tx = Some(tx);
        let deadline = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(deadline);

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.fail(StreamErrorCondition::SystemShutdown).await;
                    return Ok(());
                }
                _ = &mut deadline, if self.domain.is_none() => {
                    self.fail(StreamErrorCondition::ConnectionTimeout).await;
                    return Ok(());
                }
                Some(element) = rx.recv() => {
                    self.session.send(&element).await?;
                    continue;
                }
                received = self.session.receive() => received,
            };
            match received {
                Ok(Received::Opened(_)) => {
                    let remote = self.session.remote_domain().to_string();
                    if remote.is_empty() || self.router.hosts().is_local_host(&remote) {
                        self.fail(StreamErrorCondition::HostUnknown).await;
                        return Ok(());
                    }
                    tracing::Span::current().record("domain", remote.as_str());
                    self.session.open(&[]).await?;
                }
                Ok(Received::Element(el)) if el.name() == "handshake" && self.domain.is_none() => {
                    let expected = handshake_digest(self.session.stream_id(), &self.config.secret);
                    if !el.text().trim().eq_ignore_ascii_case(&expected) {
                        info!("Component handshake rejected");
                        self.fail(StreamErrorCondition::NotAuthorized).await;
                        return Ok(());
                    }
                    let domain = self.session.remote_domain().to_string();
                    let Some(tx) = tx.take() else {
                        return Ok(());
                    };
                    if !self.router.register_component(&domain, tx) {
                        warn!(domain = %domain, "Component domain already taken");
                        self.fail(StreamErrorCondition::Conflict).await;
                        return Ok(());
                    }
                    self.session.send(&XElement::new("handshake")).await?;
                    info!(domain = %domain, "Component connected");
                    self.domain = Some(domain);
                }
                Ok(Received::Element(el)) => {
                    debug!(name = %el.name(), "Unexpected element on component stream");
                    self.fail(StreamErrorCondition::UnsupportedStanzaType).await;
                    return Ok(());
                }
                Ok(Received::Stanza(stanza)) => {
                    if self.domain.is_none() {
                        self.fail(StreamErrorCondition::NotAuthorized).await;
                        return Ok(());
                    }
                    if let Err(e) = self.router.must_route(&stanza).await {
                        self.router.bounce(&stanza, e.stanza_error_condition()).await;
                    }
                }
                Err(SessionError::Closed) => {
                    let _ = self.session.close().await;
                    return Ok(());
                }
                Err(SessionError::Stream(condition)) => {
                    self.fail(condition).await;
                    return Ok(());
                }
                Err(SessionError::Stanza { element, condition }) => {
                    debug!(name = %element.name(), condition = %condition, "Dropping invalid component stanza");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&mut self, condition: StreamErrorCondition) {
        if let Err(e) = self.session.send_stream_error(condition).await {
            debug!(error = %e, "Failed to send stream error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_digest() {
        assert_eq!(
            handshake_digest("3BF96D32", "Ilovemyself"),
            "019a6794e95fb115b3a0f9da621818e035d6db7a"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: ComponentConfig = serde_json::from_value(serde_json::json!({
            "port": 5347,
            "secret": "s3cr3t",
        }))
        .unwrap();
        assert_eq!(config.port, 5347);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }
}
