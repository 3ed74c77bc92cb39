//! Server-to-Server (S2S) federation.
//!
//! - Outbound streams, one per (local domain, remote domain) pair, dialled
//!   on demand: SRV lookup, optional STARTTLS, then server dialback
//! - Inbound listener on port 5269 verifying the peer's dialback keys
//!   against its authoritative server
//! - Answering `db:verify` requests for keys this server generated
//!
//! The router only sees [`S2sOutProvider`] and [`S2sOut`].

pub mod dialback;
pub mod dns;
pub mod inbound;
pub mod outbound;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::host::Hosts;
use crate::router::Router;
use crate::session::SessionError;
use crate::xml::XElement;

pub use dialback::{DialbackKey, DialbackResult};
pub use dns::{DnsError, ResolvedTarget, SrvResolver, DEFAULT_S2S_PORT};
pub use inbound::S2sListener;
pub use outbound::OutStream;

#[derive(Debug, Error)]
pub enum S2sError {
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("dial to {0} timed out")]
    Timeout(String),

    #[error("remote server {0} rejected dialback")]
    DialbackRejected(String),

    #[error("unexpected element during negotiation: {0}")]
    Negotiation(String),

    #[error("s2s is shutting down")]
    Closed,
}

/// S2S listener and dialling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S2sConfig {
    pub bind: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Upper bound for an inbound stream to complete dialback.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub dialback_secret: String,
    pub max_stanza_size: usize,
    /// Capacity of each outbound stream queue.
    pub queue_size: usize,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_S2S_PORT,
            dial_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            dialback_secret: String::new(),
            max_stanza_size: 131_072,
            queue_size: 256,
        }
    }
}

/// Outgoing stream towards one remote domain.
#[async_trait]
pub trait S2sOut: Send + Sync {
    fn local_domain(&self) -> &str;

    fn remote_domain(&self) -> &str;

    /// Queue an element for delivery; stanzas sent while the stream is
    /// negotiating are delivered once dialback succeeds.
    async fn send_element(&self, element: XElement);
}

/// Source of outgoing streams, consumed by the router.
#[async_trait]
pub trait S2sOutProvider: Send + Sync {
    async fn get_out(&self, local: &str, remote: &str) -> Result<Arc<dyn S2sOut>, S2sError>;
}

/// Outbound stream pool plus the shared dialback material.
pub struct S2s {
    config: S2sConfig,
    hosts: Arc<Hosts>,
    dialback: DialbackKey,
    connector: TlsConnector,
    resolver: SrvResolver,
    outs: DashMap<(String, String), Arc<OutStream>>,
    router: OnceLock<Weak<Router>>,
    this: Weak<S2s>,
}

impl S2s {
    pub fn new(config: S2sConfig, hosts: Arc<Hosts>) -> Result<Arc<Self>, S2sError> {
        let secret = if config.dialback_secret.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.dialback_secret.clone()
        };
        let dialback = DialbackKey::new(secret.as_bytes())?;
        let connector = outbound::tls_connector()?;
        Ok(Arc::new_cyclic(|this| Self {
            dialback,
            connector,
            resolver: SrvResolver::new(),
            config,
            hosts,
            outs: DashMap::new(),
            router: OnceLock::new(),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &S2sConfig {
        &self.config
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn dialback(&self) -> &DialbackKey {
        &self.dialback
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub(crate) fn resolver(&self) -> &SrvResolver {
        &self.resolver
    }

    /// Attach the router that receives bounced and inbound stanzas.
    pub fn set_router(&self, router: Weak<Router>) {
        if self.router.set(router).is_err() {
            warn!("Router already attached to s2s");
        }
    }

    pub(crate) fn router(&self) -> Option<Arc<Router>> {
        self.router.get().and_then(Weak::upgrade)
    }

    pub(crate) fn remove_out(&self, local: &str, remote: &str, id: &str) {
        self.outs
            .remove_if(&(local.to_string(), remote.to_string()), |_, out| out.id() == id);
    }

    /// Number of live outbound streams.
    pub fn out_count(&self) -> usize {
        self.outs.len()
    }

    /// Disconnect every outbound stream.
    pub async fn shutdown(&self) {
        let outs: Vec<_> = self.outs.iter().map(|e| e.value().clone()).collect();
        self.outs.clear();
        for out in outs {
            out.disconnect().await;
        }
        info!("S2S outbound streams closed");
    }
}

#[async_trait]
impl S2sOutProvider for S2s {
    async fn get_out(&self, local: &str, remote: &str) -> Result<Arc<dyn S2sOut>, S2sError> {
        let this = self.this.upgrade().ok_or(S2sError::Closed)?;
        let key = (local.to_string(), remote.to_string());
        let out = self
            .outs
            .entry(key)
            .or_insert_with(|| {
                debug!(local = %local, remote = %remote, "Dialling remote server");
                OutStream::spawn(this, local.to_string(), remote.to_string())
            })
            .value()
            .clone();
        Ok(out as Arc<dyn S2sOut>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = S2sConfig::default();
        assert_eq!(config.port, 5269);
        assert_eq!(config.dial_timeout, Duration::from_secs(15));
        assert_eq!(config.max_stanza_size, 131_072);
    }

    #[test]
    fn test_config_from_json() {
        let config: S2sConfig =
            serde_json::from_str(r#"{"port": 15269, "dial_timeout": "3s", "dialback_secret": "s3cr3t"}"#).unwrap();
        assert_eq!(config.port, 15269);
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.dialback_secret, "s3cr3t");
        assert_eq!(config.bind, "0.0.0.0");
    }
}
