//! Inbound S2S streams.
//!
//! Handles incoming connections from remote XMPP servers: optional
//! STARTTLS, dialback (`db:result` verified against the originating
//! server's authoritative host, `db:verify` answered from our own keys),
//! then stanza delivery through the router.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use super::dialback::{self, DialbackResult};
use super::outbound::dial;
use super::{S2s, S2sError};
use crate::error::StreamErrorCondition;
use crate::modules::Modules;
use crate::router::Router;
use crate::session::{Received, Session, SessionConfig, SessionError, SessionRole};
use crate::stanza::Stanza;
use crate::transport::{SocketTransport, TlsUpgrade};
use crate::xml::{ns, XElement};
use crate::XmppError;

/// S2S listener accepting connections from remote XMPP servers.
pub struct S2sListener {
    s2s: Arc<S2s>,
    router: Arc<Router>,
    modules: Option<Arc<Modules>>,
}

impl S2sListener {
    pub fn new(s2s: Arc<S2s>, router: Arc<Router>) -> Self {
        Self {
            s2s,
            router,
            modules: None,
        }
    }

    /// Hand subscription and probe presences from remote servers to the
    /// IM modules instead of routing them verbatim.
    pub fn with_modules(mut self, modules: Arc<Modules>) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), XmppError> {
        let config = self.s2s.config();
        let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        info!(addr = %listener.local_addr()?, "XMPP S2S server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("S2S listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let s2s = Arc::clone(&self.s2s);
                        let router = Arc::clone(&self.router);
                        let modules = self.modules.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = handle_connection(stream, peer_addr, s2s, router, modules).await {
                                    warn!(error = %e, "S2S connection error");
                                }
                            }
                            .instrument(info_span!(
                                "s2s.in",
                                peer = %peer_addr,
                                remote_domain = tracing::field::Empty,
                            )),
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to accept S2S connection"),
                },
            }
        }
    }
}

async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    s2s: Arc<S2s>,
    router: Arc<Router>,
    modules: Option<Arc<Modules>>,
) -> Result<(), S2sError> {
    debug!(peer = %peer_addr, "New S2S connection");
    let config = SessionConfig {
        role: SessionRole::Server,
        max_stanza_size: s2s.config().max_stanza_size,
        initiating: false,
    };
    let session = Session::new(SocketTransport::new(tcp), Arc::clone(s2s.hosts()), config);
    let mut stream = InboundStream {
        session,
        s2s,
        router,
        modules,
        verified: false,
    };
    let result = stream.run().await;
    stream.session.shutdown().await;
    result
}

struct InboundStream {
    session: Session<SocketTransport>,
    s2s: Arc<S2s>,
    router: Arc<Router>,
    modules: Option<Arc<Modules>>,
    verified: bool,
}

impl InboundStream {
    async fn run(&mut self) -> Result<(), S2sError> {
        let deadline = tokio::time::sleep(self.s2s.config().connect_timeout);
        tokio::pin!(deadline);

        loop {
            let received = tokio::select! {
                _ = &mut deadline, if !self.verified => {
                    info!("Inbound S2S stream did not complete dialback in time");
                    self.fail(StreamErrorCondition::ConnectionTimeout).await;
                    return Ok(());
                }
                received = self.session.receive() => received,
            };
            match received {
                Ok(Received::Opened(opener)) => self.on_open(&opener).await?,
                Ok(Received::Element(el)) => {
                    if !self.on_element(el).await? {
                        return Ok(());
                    }
                }
                Ok(Received::Stanza(stanza)) => {
                    if !self.verified {
                        self.fail(StreamErrorCondition::NotAuthorized).await;
                        return Ok(());
                    }
                    self.deliver(stanza).await;
                }
                Err(SessionError::Closed) => {
                    debug!("Remote server closed the stream");
                    let _ = self.session.close().await;
                    return Ok(());
                }
                Err(SessionError::Stream(condition)) => {
                    self.fail(condition).await;
                    return Ok(());
                }
                Err(SessionError::Stanza { element, condition }) => {
                    debug!(name = %element.name(), condition = %condition, "Dropping invalid stanza");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn on_open(&mut self, opener: &XElement) -> Result<(), S2sError> {
        if let Some(from) = opener.attr("from") {
            tracing::Span::current().record("remote_domain", from);
        }
        self.session.open(&[("xmlns:db", ns::DIALBACK)]).await?;

        let mut features = XElement::builder("stream:features");
        if !self.session.is_secured() && self.s2s.hosts().tls_acceptor().is_some() {
            features = features.child(XElement::builder("starttls").attr("xmlns", ns::TLS).build());
        }
        let features = features
            .child(XElement::builder("dialback").attr("xmlns", ns::DIALBACK_FEATURE).build())
            .build();
        self.session.send(&features).await?;
        Ok(())
    }

    /// Returns `false` once the stream must end.
    async fn on_element(&mut self, el: XElement) -> Result<bool, S2sError> {
        match el.name() {
            "starttls" if !self.session.is_secured() => {
                let Some(acceptor) = self.s2s.hosts().tls_acceptor() else {
                    self.fail(StreamErrorCondition::PolicyViolation).await;
                    return Ok(false);
                };
                self.session
                    .send(&XElement::builder("proceed").attr("xmlns", ns::TLS).build())
                    .await?;
                self.session.start_tls(TlsUpgrade::Server(acceptor)).await?;
                debug!("Inbound S2S stream secured");
                Ok(true)
            }
            "db:result" => self.on_dialback_result(&el).await,
            "db:verify" => {
                self.on_dialback_verify(&el).await?;
                Ok(true)
            }
            other => {
                debug!(name = %other, "Unexpected element on inbound S2S stream");
                self.fail(StreamErrorCondition::UnsupportedStanzaType).await;
                Ok(false)
            }
        }
    }

    /// The remote server claims to be `from`; verify the key with its
    /// authoritative host.
    #[instrument(skip(self, el), name = "s2s.in.dialback_result")]
    async fn on_dialback_result(&mut self, el: &XElement) -> Result<bool, S2sError> {
        let (Some(from), Some(to)) = (el.attr("from"), el.attr("to")) else {
            self.fail(StreamErrorCondition::InvalidFrom).await;
            return Ok(false);
        };
        if !self.s2s.hosts().is_local_host(to) {
            self.fail(StreamErrorCondition::HostUnknown).await;
            return Ok(false);
        }
        let stream_id = self.session.stream_id().to_string();
        let valid = match verify_remote_key(&self.s2s, to, from, &stream_id, el.text()).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(remote = %from, error = %e, "Dialback verification failed");
                false
            }
        };
        let result = DialbackResult::from(valid);
        self.session
            .send(&dialback::result_response(to, from, result))
            .await?;
        if !valid {
            self.fail(StreamErrorCondition::NotAuthorized).await;
            return Ok(false);
        }
        self.session.set_remote_domain(from);
        self.verified = true;
        info!(remote = %from, "Inbound S2S stream verified");
        Ok(true)
    }

    /// Answer a verification request for a key this server generated.
    async fn on_dialback_verify(&mut self, el: &XElement) -> Result<(), S2sError> {
        let (Some(from), Some(to), Some(id)) = (el.attr("from"), el.attr("to"), el.attr("id")) else {
            return Ok(());
        };
        let valid = self.s2s.dialback().verify(el.text(), id, from, to);
        debug!(from = %from, to = %to, valid, "Answering dialback verify");
        self.session
            .send(&dialback::verify_response(to, from, id, DialbackResult::from(valid)))
            .await?;
        Ok(())
    }

    async fn deliver(&self, stanza: Stanza) {
        if let (Some(modules), Stanza::Presence(presence)) = (&self.modules, &stanza) {
            if modules.process_remote_presence(presence).await {
                return;
            }
        }
        if let Err(e) = self.router.must_route(&stanza).await {
            self.router.bounce(&stanza, e.stanza_error_condition()).await;
        }
    }

    async fn fail(&mut self, condition: StreamErrorCondition) {
        if let Err(e) = self.session.send_stream_error(condition).await {
            debug!(error = %e, "Failed to send stream error");
        }
    }
}

/// Ask the authoritative server of `remote` whether it issued `key` for
/// stream `stream_id`.
async fn verify_remote_key(s2s: &S2s, local: &str, remote: &str, stream_id: &str, key: &str) -> Result<bool, S2sError> {
    let verify = async {
        let mut session = dial(s2s, local, remote).await?;
        session
            .send(&dialback::verify_request(local, remote, stream_id, key))
            .await?;
        let valid = loop {
            match session.receive().await? {
                Received::Element(el) if el.name() == "db:verify" && el.attr("id") == Some(stream_id) => {
                    break el.attr("type").and_then(DialbackResult::from_name) == Some(DialbackResult::Valid);
                }
                _ => continue,
            }
        };
        let _ = session.close().await;
        session.shutdown().await;
        Ok(valid)
    };
    tokio::time::timeout(s2s.config().dial_timeout, verify)
        .await
        .map_err(|_| S2sError::Timeout(remote.to_string()))?
}
