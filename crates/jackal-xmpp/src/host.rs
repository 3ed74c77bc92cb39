//! Host table: the domains served by this instance and their certificates.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::jid::Jid;
use crate::XmppError;

/// Certificate files for one host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostTlsConfig {
    pub privkey_path: String,
    pub cert_path: String,
}

/// A served domain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub tls: Option<HostTlsConfig>,
}

/// SNI-driven certificate selection.
#[derive(Debug)]
struct SniResolver {
    certs: HashMap<String, Arc<CertifiedKey>>,
    default_host: String,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.certs.get(&name.to_ascii_lowercase()))
            .or_else(|| self.certs.get(&self.default_host))
            .cloned()
    }
}

/// Domains served by this instance. Read-only after startup.
#[derive(Clone)]
pub struct Hosts {
    default_host: String,
    default_jid: Jid,
    names: Vec<String>,
    tls: Option<TlsAcceptor>,
}

impl Hosts {
    /// Build the host table, loading certificates from disk.
    ///
    /// Hosts without configured certificate files get a self-signed one.
    /// The first host is the default one.
    pub fn new(configs: &[HostConfig]) -> Result<Self, XmppError> {
        let first = configs
            .first()
            .ok_or_else(|| XmppError::config("at least one host must be configured"))?;

        let mut certs = HashMap::with_capacity(configs.len());
        let mut names = Vec::with_capacity(configs.len());
        for host in configs {
            let name = host.name.to_ascii_lowercase();
            let key = match &host.tls {
                Some(tls) => load_certified_key(tls)?,
                None => {
                    warn!(host = %name, "No certificate configured, generating a self-signed one");
                    self_signed_key(&name)?
                }
            };
            certs.insert(name.clone(), key);
            names.push(name);
        }

        let resolver = SniResolver {
            certs,
            default_host: first.name.to_ascii_lowercase(),
        };
        let server_config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));

        info!(hosts = ?names, "Host table ready");
        Ok(Self {
            default_jid: Jid::domain_jid(&first.name)?,
            default_host: first.name.to_ascii_lowercase(),
            names,
            tls: Some(TlsAcceptor::from(Arc::new(server_config))),
        })
    }

    /// Hosts served without TLS, for deployments that terminate TLS in front
    /// of the server.
    pub fn plain<I, S>(names: I) -> Result<Self, XmppError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|n| n.into().to_ascii_lowercase())
            .collect();
        let default_host = names
            .first()
            .cloned()
            .ok_or_else(|| XmppError::config("at least one host must be configured"))?;
        Ok(Self {
            default_jid: Jid::domain_jid(&default_host)?,
            default_host,
            names,
            tls: None,
        })
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// The default host as a domain JID.
    pub fn default_jid(&self) -> &Jid {
        &self.default_jid
    }

    pub fn host_names(&self) -> &[String] {
        &self.names
    }

    pub fn is_local_host(&self, domain: &str) -> bool {
        self.names.iter().any(|n| n == domain)
    }

    /// Acceptor used for STARTTLS upgrades, when certificates are available.
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("default_host", &self.default_host)
            .field("names", &self.names)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn load_certified_key(tls: &HostTlsConfig) -> Result<Arc<CertifiedKey>, XmppError> {
    let cert_file = File::open(&tls.cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", tls.cert_path, e))
    })?;
    let key_file = File::open(&tls.privkey_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", tls.privkey_path, e))
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| XmppError::config(format!("Invalid certificate {}: {}", tls.cert_path, e)))?;
    if certs.is_empty() {
        return Err(XmppError::config(format!("No certificate found in {}", tls.cert_path)));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| XmppError::config(format!("Invalid key {}: {}", tls.privkey_path, e)))?
        .ok_or_else(|| XmppError::config(format!("No private key found in {}", tls.privkey_path)))?;

    certified_key(certs, key)
}

fn self_signed_key(host: &str) -> Result<Arc<CertifiedKey>, XmppError> {
    let generated = rcgen::generate_simple_self_signed(vec![host.to_string()])
        .map_err(|e| XmppError::Certificate(e.to_string()))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()));
    certified_key(vec![generated.cert.der().clone()], key)
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, XmppError> {
    let signing_key = ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}
