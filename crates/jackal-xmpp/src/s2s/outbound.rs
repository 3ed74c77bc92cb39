//! Outbound S2S streams.
//!
//! Each [`OutStream`] is an actor owning one TCP connection to a remote
//! domain. Elements queued before dialback completes are delivered once the
//! remote server accepts our key; if negotiation fails they are bounced back
//! to their senders as `remote-server-not-found`.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, info_span, warn, Instrument};

use super::dialback::{self, DialbackResult};
use super::{S2s, S2sError, S2sOut};
use crate::error::StanzaErrorCondition;
use crate::jid::Jid;
use crate::session::{Received, Session, SessionConfig, SessionError, SessionRole};
use crate::stanza::Stanza;
use crate::transport::{SocketTransport, TlsUpgrade};
use crate::xml::{ns, XElement};

enum OutCommand {
    Send(XElement),
    Disconnect,
}

pub struct OutStream {
    id: String,
    local: String,
    remote: String,
    tx: mpsc::Sender<OutCommand>,
}

impl OutStream {
    /// Start dialling `remote` on behalf of `local` and return the handle.
    pub(crate) fn spawn(s2s: Arc<S2s>, local: String, remote: String) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(s2s.config().queue_size.max(1));
        let out = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            local,
            remote,
            tx,
        });
        let span = info_span!("s2s.out", local = %out.local, remote = %out.remote);
        tokio::spawn(run(s2s, out.id.clone(), out.local.clone(), out.remote.clone(), rx).instrument(span));
        out
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(OutCommand::Disconnect).await;
    }
}

#[async_trait]
impl S2sOut for OutStream {
    fn local_domain(&self) -> &str {
        &self.local
    }

    fn remote_domain(&self) -> &str {
        &self.remote
    }

    async fn send_element(&self, element: XElement) {
        if self.tx.send(OutCommand::Send(element)).await.is_err() {
            debug!(remote = %self.remote, "Outbound stream already closed");
        }
    }
}

async fn run(s2s: Arc<S2s>, id: String, local: String, remote: String, mut rx: mpsc::Receiver<OutCommand>) {
    let established = tokio::time::timeout(s2s.config().dial_timeout, establish(&s2s, &local, &remote)).await;
    let mut session = match established {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            warn!(error = %e, "Outbound S2S negotiation failed");
            s2s.remove_out(&local, &remote, &id);
            bounce_queued(&s2s, &mut rx).await;
            return;
        }
        Err(_) => {
            warn!("Outbound S2S negotiation timed out");
            s2s.remove_out(&local, &remote, &id);
            bounce_queued(&s2s, &mut rx).await;
            return;
        }
    };
    info!("Outbound S2S stream established");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(OutCommand::Send(element)) => {
                    if let Err(e) = session.send(&element).await {
                        warn!(error = %e, "Failed to write to remote server");
                        break;
                    }
                }
                Some(OutCommand::Disconnect) | None => {
                    let _ = session.close().await;
                    break;
                }
            },
            received = session.receive() => match received {
                Ok(Received::Stanza(stanza)) => {
                    debug!(kind = ?stanza.kind(), "Ignoring stanza received on outbound stream");
                }
                Ok(_) => {}
                Err(SessionError::Closed) => {
                    debug!("Remote server closed the stream");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Outbound S2S stream failed");
                    break;
                }
            },
        }
    }

    s2s.remove_out(&local, &remote, &id);
    session.shutdown().await;
    bounce_queued(&s2s, &mut rx).await;
    info!("Outbound S2S stream closed");
}

async fn bounce_queued(s2s: &S2s, rx: &mut mpsc::Receiver<OutCommand>) {
    rx.close();
    let Some(router) = s2s.router() else {
        return;
    };
    while let Ok(command) = rx.try_recv() {
        let OutCommand::Send(element) = command else {
            continue;
        };
        if let Ok(stanza) = Stanza::from_element(element) {
            router.bounce(&stanza, StanzaErrorCondition::RemoteServerNotFound).await;
        }
    }
}

/// Dial, negotiate and authenticate through dialback.
async fn establish(s2s: &S2s, local: &str, remote: &str) -> Result<Session<SocketTransport>, S2sError> {
    let mut session = dial(s2s, local, remote).await?;
    let peer_id = session.peer_stream_id().unwrap_or_default().to_string();
    let key = s2s.dialback().generate(&peer_id, remote, local);
    session.send(&dialback::result_request(local, remote, &key)).await?;

    loop {
        match session.receive().await? {
            Received::Element(el) if el.name() == "db:result" => {
                return match el.attr("type").and_then(DialbackResult::from_name) {
                    Some(DialbackResult::Valid) => Ok(session),
                    _ => Err(S2sError::DialbackRejected(remote.to_string())),
                };
            }
            Received::Element(el) => debug!(name = %el.name(), "Ignoring element while awaiting dialback"),
            Received::Stanza(_) | Received::Opened(_) => {
                return Err(S2sError::Negotiation("stanza before dialback".to_string()))
            }
        }
    }
}

/// Open a `jabber:server` stream to `remote`, upgrading to TLS when
/// offered.
pub(crate) async fn dial(s2s: &S2s, local: &str, remote: &str) -> Result<Session<SocketTransport>, S2sError> {
    let mut tcp = None;
    let mut last_error = None;
    for target in s2s.resolver().resolve(remote).await? {
        match TcpStream::connect(target.address()).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => {
                debug!(target = %target.address(), error = %e, "S2S connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    let tcp = match (tcp, last_error) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) => return Err(S2sError::Io(e)),
        (None, None) => return Err(S2sError::Timeout(remote.to_string())),
    };

    let config = SessionConfig {
        role: SessionRole::Server,
        max_stanza_size: s2s.config().max_stanza_size,
        initiating: true,
    };
    let mut session = Session::new(SocketTransport::new(tcp), Arc::clone(s2s.hosts()), config);
    let local_jid = Jid::domain_jid(local).map_err(|e| S2sError::Negotiation(e.to_string()))?;
    session.set_jid(local_jid);
    session.set_remote_domain(remote);

    let features = open_stream(&mut session).await?;
    if features.child_ns("starttls", ns::TLS).is_some() {
        session
            .send(&XElement::builder("starttls").attr("xmlns", ns::TLS).build())
            .await?;
        match session.receive().await? {
            Received::Element(el) if el.name() == "proceed" => {}
            _ => return Err(S2sError::Negotiation("STARTTLS refused".to_string())),
        }
        let server_name =
            ServerName::try_from(remote.to_string()).map_err(|e| S2sError::Negotiation(e.to_string()))?;
        session
            .start_tls(TlsUpgrade::Client {
                connector: s2s.connector().clone(),
                server_name,
            })
            .await?;
        open_stream(&mut session).await?;
    }
    Ok(session)
}

async fn open_stream(session: &mut Session<SocketTransport>) -> Result<XElement, S2sError> {
    session.open(&[("xmlns:db", ns::DIALBACK)]).await?;
    match session.receive().await? {
        Received::Opened(_) => {}
        _ => return Err(S2sError::Negotiation("expected stream opener".to_string())),
    }
    match session.receive().await? {
        Received::Element(el) if el.name() == "stream:features" => Ok(el),
        Received::Element(el) => Err(S2sError::Negotiation(el.name().to_string())),
        _ => Err(S2sError::Negotiation("expected stream features".to_string())),
    }
}

/// Peer identity is proven by dialback, so the certificate chain of the
/// remote server is not checked against a trust store.
#[derive(Debug)]
struct DialbackCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for DialbackCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub(crate) fn tls_connector() -> Result<TlsConnector, S2sError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DialbackCertVerifier(provider)))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_connector_builds() {
        assert!(tls_connector().is_ok());
    }
}
