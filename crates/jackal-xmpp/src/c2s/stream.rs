//! Client stream negotiation and the bound stream loop.
//!
//! ```text
//! Connecting --open--> Connected --starttls--> (reset) Connected
//!            --auth/response--> Authenticating --success--> (reset) Authenticated
//!            --bind--> Bound --close/error/disconnect--> Disconnected
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::C2sConfig;
use crate::auth::{self, AuthStep, Authenticator, SaslError};
use crate::error::StreamErrorCondition;
use crate::jid::Jid;
use crate::modules::Modules;
use crate::router::Router;
use crate::session::{Received, Session, SessionConfig, SessionError, SessionRole};
use crate::stanza::{error_element, ErrorReply, Iq, Stanza};
use crate::stream::{C2sStream, LocalStream, StreamCommand};
use crate::transport::{TlsUpgrade, Transport};
use crate::types::{ConnectionState, ResourceConflict, SaslMechanism, TransportType};
use crate::xml::{ns, XElement};

pub(super) struct C2sContext {
    pub config: Arc<C2sConfig>,
    pub router: Arc<Router>,
    pub modules: Arc<Modules>,
}

enum Event {
    Shutdown,
    Timeout,
    Command(Option<StreamCommand>),
    Received(Result<Received, SessionError>),
}

pub(super) async fn serve<T: Transport>(transport: T, ctx: C2sContext, shutdown: CancellationToken) {
    let config = SessionConfig {
        role: SessionRole::Client,
        max_stanza_size: ctx.config.max_stanza_size,
        initiating: false,
    };
    let session = Session::new(transport, Arc::clone(ctx.router.hosts()), config);
    let (handle, commands) = LocalStream::new(
        uuid::Uuid::new_v4().to_string(),
        session.jid().clone(),
        ctx.config.queue_size,
    );
    handle.set_secured(session.is_secured());

    let mut conn = C2sConnection {
        session,
        ctx,
        handle: Arc::new(handle),
        commands,
        state: ConnectionState::Connecting,
        authenticator: None,
    };
    conn.run(shutdown).await;
    conn.teardown().await;
}

struct C2sConnection<T> {
    session: Session<T>,
    ctx: C2sContext,
    handle: Arc<LocalStream>,
    commands: mpsc::Receiver<StreamCommand>,
    state: ConnectionState,
    /// SASL exchange waiting for a `<response/>`.
    authenticator: Option<Box<dyn Authenticator>>,
}

impl<T: Transport> C2sConnection<T> {
    fn stream(&self) -> Arc<dyn C2sStream> {
        self.handle.clone()
    }

    async fn run(&mut self, shutdown: CancellationToken) {
        let deadline = tokio::time::sleep(self.ctx.config.connect_timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => Event::Shutdown,
                _ = &mut deadline, if self.state != ConnectionState::Bound => Event::Timeout,
                command = self.commands.recv() => Event::Command(command),
                received = self.session.receive() => Event::Received(received),
            };
            let proceed = match event {
                Event::Shutdown => {
                    self.fail(StreamErrorCondition::SystemShutdown).await;
                    Ok(false)
                }
                Event::Timeout => {
                    info!(state = %self.state, "Client stream did not bind in time");
                    self.fail(StreamErrorCondition::ConnectionTimeout).await;
                    Ok(false)
                }
                Event::Command(Some(command)) => self.on_command(command).await,
                Event::Command(None) => Ok(false),
                Event::Received(received) => self.on_received(received).await,
            };
            match proceed {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    debug!(error = %e, "Client stream failed");
                    break;
                }
            }
        }
    }

    async fn teardown(&mut self) {
        if self.state == ConnectionState::Bound {
            let stream = self.stream();
            self.ctx.router.unbind(stream.as_ref()).await;
            self.ctx.modules.stream_unbound(&stream).await;
            info!(jid = %stream.jid(), "Client stream unbound");
        }
        self.state = ConnectionState::Disconnected;
        self.session.shutdown().await;
    }

    async fn on_command(&mut self, command: StreamCommand) -> Result<bool, SessionError> {
        match command {
            StreamCommand::SendElement(element) => {
                self.session.send(&element).await?;
                Ok(true)
            }
            StreamCommand::Disconnect(Some(condition)) => {
                self.fail(condition).await;
                Ok(false)
            }
            StreamCommand::Disconnect(None) => {
                self.session.close().await?;
                Ok(false)
            }
        }
    }

    /// Returns `false` once the stream must end.
    async fn on_received(&mut self, received: Result<Received, SessionError>) -> Result<bool, SessionError> {
        match received {
            Ok(Received::Opened(_)) => {
                self.on_open().await?;
                Ok(true)
            }
            Ok(Received::Element(el)) => self.on_element(el).await,
            Ok(Received::Stanza(stanza)) => self.on_stanza(stanza).await,
            Err(SessionError::Closed) => {
                debug!("Client closed the stream");
                let _ = self.session.close().await;
                Ok(false)
            }
            Err(SessionError::Stream(condition)) => {
                self.fail(condition).await;
                Ok(false)
            }
            Err(SessionError::Stanza { element, condition }) => {
                if self.state != ConnectionState::Bound {
                    self.fail(StreamErrorCondition::NotAuthorized).await;
                    return Ok(false);
                }
                self.session.send(&error_element(&element, condition)).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_open(&mut self) -> Result<(), SessionError> {
        self.session.open(&[]).await?;
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
        let features = self.features();
        self.session.send(&features).await
    }

    /// A socket stream must be secured first when the host has a
    /// certificate.
    fn tls_required(&self) -> bool {
        self.session.transport_type() == TransportType::Socket
            && !self.session.is_secured()
            && self.ctx.router.hosts().tls_acceptor().is_some()
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.state, ConnectionState::Authenticated | ConnectionState::Bound)
    }

    fn features(&self) -> XElement {
        let mut features = XElement::builder("stream:features");
        if self.session.transport_type() == TransportType::WebSocket {
            features = features.attr("xmlns:stream", ns::STREAM);
        }
        if self.tls_required() {
            return features
                .child(
                    XElement::builder("starttls")
                        .attr("xmlns", ns::TLS)
                        .child(XElement::new("required"))
                        .build(),
                )
                .build();
        }
        if !self.is_authenticated() {
            let mechanisms = self.ctx.config.sasl.iter().map(|m| {
                XElement::builder("mechanism").text(m.as_str()).build()
            });
            return features
                .child(
                    XElement::builder("mechanisms")
                        .attr("xmlns", ns::SASL)
                        .children(mechanisms)
                        .build(),
                )
                .build();
        }
        features
            .child(XElement::builder("bind").attr("xmlns", ns::BIND).build())
            .child(
                XElement::builder("session")
                    .attr("xmlns", ns::SESSION)
                    .child(XElement::new("optional"))
                    .build(),
            )
            .children(self.ctx.modules.stream_features())
            .build()
    }

    async fn on_element(&mut self, el: XElement) -> Result<bool, SessionError> {
        if self.tls_required() {
            if el.name() == "starttls" && el.namespace() == Some(ns::TLS) {
                return self.start_tls().await;
            }
            debug!(name = %el.name(), "Element before STARTTLS");
            self.fail(StreamErrorCondition::NotAuthorized).await;
            return Ok(false);
        }
        if self.is_authenticated() {
            debug!(name = %el.name(), "Unexpected element on authenticated stream");
            self.fail(StreamErrorCondition::UnsupportedStanzaType).await;
            return Ok(false);
        }
        if el.namespace() != Some(ns::SASL) {
            self.fail(StreamErrorCondition::NotAuthorized).await;
            return Ok(false);
        }
        match el.name() {
            "auth" => self.on_auth(&el).await,
            "response" => {
                let Some(authenticator) = self.authenticator.take() else {
                    return self
                        .sasl_failure(SaslError::MalformedRequest("no exchange in progress".into()))
                        .await;
                };
                match decode_payload(el.text()) {
                    Ok(input) => self.sasl_step(authenticator, &input).await,
                    Err(e) => self.sasl_failure(e).await,
                }
            }
            "abort" => self.sasl_failure(SaslError::Aborted).await,
            other => {
                debug!(name = %other, "Unknown SASL element");
                self.fail(StreamErrorCondition::NotAuthorized).await;
                Ok(false)
            }
        }
    }

    async fn start_tls(&mut self) -> Result<bool, SessionError> {
        let Some(acceptor) = self.ctx.router.hosts().tls_acceptor() else {
            self.fail(StreamErrorCondition::PolicyViolation).await;
            return Ok(false);
        };
        self.session
            .send(&XElement::builder("proceed").attr("xmlns", ns::TLS).build())
            .await?;
        self.session.start_tls(TlsUpgrade::Server(acceptor)).await?;
        self.handle.set_secured(true);
        debug!("Client stream secured");
        Ok(true)
    }

    #[instrument(skip_all, fields(mechanism = el.attr("mechanism").unwrap_or_default()))]
    async fn on_auth(&mut self, el: &XElement) -> Result<bool, SessionError> {
        let mechanism = el
            .attr("mechanism")
            .and_then(SaslMechanism::from_name)
            .filter(|m| self.ctx.config.sasl.contains(m));
        let Some(mechanism) = mechanism else {
            return self.sasl_failure(SaslError::InvalidMechanism).await;
        };
        let authenticator = auth::authenticator(
            mechanism,
            self.session.jid().domain(),
            Arc::clone(self.ctx.router.storage()),
        );
        self.state = ConnectionState::Authenticating;

        if el.text().is_empty() {
            // No initial response: ask for it with an empty challenge.
            self.authenticator = Some(authenticator);
            self.session.send(&sasl_element("challenge", &[])).await?;
            return Ok(true);
        }
        match decode_payload(el.text()) {
            Ok(input) => self.sasl_step(authenticator, &input).await,
            Err(e) => self.sasl_failure(e).await,
        }
    }

    async fn sasl_step(
        &mut self,
        mut authenticator: Box<dyn Authenticator>,
        input: &[u8],
    ) -> Result<bool, SessionError> {
        match authenticator.process(input).await {
            Ok(AuthStep::Challenge(data)) => {
                self.authenticator = Some(authenticator);
                self.session.send(&sasl_element("challenge", &data)).await?;
                Ok(true)
            }
            Ok(AuthStep::Success {
                username,
                additional_data,
            }) => self.on_authenticated(&username, additional_data.as_deref()).await,
            Err(e) => self.sasl_failure(e).await,
        }
    }

    async fn sasl_failure(&mut self, error: SaslError) -> Result<bool, SessionError> {
        debug!(error = %error, "SASL authentication failed");
        self.authenticator = None;
        self.state = ConnectionState::Connected;
        self.session.send(&error.to_failure_element()).await?;
        Ok(true)
    }

    async fn on_authenticated(&mut self, username: &str, data: Option<&[u8]>) -> Result<bool, SessionError> {
        let jid = match Jid::new(username, self.session.jid().domain(), "", false) {
            Ok(jid) => jid,
            Err(e) => {
                warn!(username, error = %e, "Authenticated username is not a valid JID node");
                return self
                    .sasl_failure(SaslError::TemporaryAuthFailure(e.to_string()))
                    .await;
            }
        };
        self.session
            .send(&sasl_element("success", data.unwrap_or_default()))
            .await?;
        self.session.set_jid(jid.clone());
        self.handle.set_jid(jid.clone());
        self.handle.set_authenticated(true);
        self.state = ConnectionState::Authenticated;
        self.session.reset();
        tracing::Span::current().record("jid", tracing::field::display(&jid));
        info!(jid = %jid, "Client authenticated");
        Ok(true)
    }

    async fn on_stanza(&mut self, stanza: Stanza) -> Result<bool, SessionError> {
        match (self.state, stanza) {
            (ConnectionState::Bound, stanza) => {
                self.process_stanza(stanza).await?;
                Ok(true)
            }
            (ConnectionState::Authenticated, Stanza::Iq(iq))
                if iq.is_set() && iq.payload_ns("bind", ns::BIND).is_some() =>
            {
                self.bind(&iq).await?;
                Ok(true)
            }
            (state, stanza) => {
                debug!(state = %state, kind = ?stanza.kind(), "Stanza before resource binding");
                self.fail(StreamErrorCondition::NotAuthorized).await;
                Ok(false)
            }
        }
    }

    #[instrument(skip_all)]
    async fn bind(&mut self, iq: &Iq) -> Result<(), SessionError> {
        let username = self.session.jid().node().to_string();
        let domain = self.session.jid().domain().to_string();
        let requested = iq
            .payload_ns("bind", ns::BIND)
            .and_then(|b| b.child("resource"))
            .map(|r| r.text().trim())
            .filter(|r| !r.is_empty());
        let mut resource = requested.map_or_else(generate_resource, String::from);

        if let Some(existing) = self.ctx.router.registry().stream(&username, &resource) {
            match self.ctx.config.resource_conflict {
                ResourceConflict::Replace => {
                    info!(resource = %resource, "Replacing stream bound to the same resource");
                    existing.disconnect(Some(StreamErrorCondition::Conflict)).await;
                    self.ctx.router.unbind(existing.as_ref()).await;
                }
                ResourceConflict::Reject => {
                    debug!(resource = %resource, "Rejecting bind of a resource in use");
                    return self.session.send(iq.conflict().element()).await;
                }
                ResourceConflict::Override => resource = generate_resource(),
            }
        }

        let jid = match Jid::new(&username, &domain, &resource, false) {
            Ok(jid) => jid,
            Err(e) => {
                debug!(resource = %resource, error = %e, "Invalid resource");
                return self.session.send(iq.bad_request().element()).await;
            }
        };
        self.handle.set_jid(jid.clone());
        let stream = self.stream();
        if !self.ctx.router.bind(stream.clone()).await {
            self.handle.set_jid(jid.to_bare());
            return self.session.send(iq.conflict().element()).await;
        }
        self.session.set_jid(jid.clone());
        self.state = ConnectionState::Bound;
        self.ctx.modules.stream_bound(&stream);
        tracing::Span::current().record("jid", tracing::field::display(&jid));
        info!(jid = %jid, "Client stream bound");

        let result = XElement::builder("iq")
            .attr("type", "result")
            .attr("id", iq.id())
            .child(
                XElement::builder("bind")
                    .attr("xmlns", ns::BIND)
                    .child(XElement::builder("jid").text(jid.to_string()).build())
                    .build(),
            )
            .build();
        self.session.send(&result).await
    }

    async fn process_stanza(&mut self, stanza: Stanza) -> Result<(), SessionError> {
        match &stanza {
            Stanza::Iq(iq) => {
                if iq.payload_ns("session", ns::SESSION).is_some() {
                    return self.session.send(iq.result().element()).await;
                }
                if iq.payload_ns("bind", ns::BIND).is_some() {
                    return self.session.send(iq.not_allowed().element()).await;
                }
                if self.ctx.modules.process_iq(iq).await {
                    return Ok(());
                }
                // Requests without `to`, or addressed to the server, are ours
                // to answer; requests to a bare account JID go to its resources.
                let to = iq.to();
                let for_server = iq.element().attr("to").is_none()
                    || (to.is_server() && self.ctx.router.hosts().is_local_host(to.domain()));
                if for_server {
                    self.ctx.modules.reject_iq(iq).await;
                    return Ok(());
                }
            }
            Stanza::Presence(presence) => {
                if self.ctx.modules.process_presence(&self.stream(), presence).await {
                    return Ok(());
                }
            }
            Stanza::Message(_) => {}
        }
        if let Err(e) = self.ctx.router.route(&stanza, true).await {
            debug!(to = %stanza.to(), error = %e, "Failed to route stanza");
            self.ctx.router.bounce(&stanza, e.stanza_error_condition()).await;
        }
        Ok(())
    }

    async fn fail(&mut self, condition: StreamErrorCondition) {
        if let Err(e) = self.session.send_stream_error(condition).await {
            debug!(error = %e, "Failed to send stream error");
        }
    }
}

fn generate_resource() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Decode a SASL payload; `=` stands for an empty response.
fn decode_payload(text: &str) -> Result<Vec<u8>, SaslError> {
    match text.trim() {
        "" | "=" => Ok(Vec::new()),
        encoded => BASE64.decode(encoded).map_err(|_| SaslError::IncorrectEncoding),
    }
}

fn sasl_element(name: &str, data: &[u8]) -> XElement {
    let builder = XElement::builder(name).attr("xmlns", ns::SASL);
    if data.is_empty() {
        builder.build()
    } else {
        builder.text(BASE64.encode(data)).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload("="), Ok(Vec::new()));
        assert_eq!(decode_payload(" AGp1bGlldAByMG0zMA== "), Ok(b"\0juliet\0r0m30".to_vec()));
        assert_eq!(decode_payload("%%%"), Err(SaslError::IncorrectEncoding));
    }

    #[test]
    fn test_sasl_element_encodes_data() {
        assert_eq!(sasl_element("success", &[]).text(), "");
        assert_eq!(sasl_element("challenge", b"r=abc").text(), "cj1hYmM=");
    }
}
