//! XML stream session.
//!
//! Owns the transport and the incremental parser of one connection and
//! frames the stream: opener and closer, stream errors, and promotion of
//! incoming elements to typed stanzas with address validation.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{StanzaErrorCondition, StreamErrorCondition};
use crate::host::Hosts;
use crate::jid::Jid;
use crate::stanza::{Stanza, StanzaKind};
use crate::transport::{TlsUpgrade, Transport};
use crate::types::TransportType;
use crate::xml::{ns, Parser, ParserError, ParsingMode, XElement};

const READ_BUFFER_SIZE: usize = 4096;

/// Which kind of peer the stream talks to; selects the default namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
    Component,
}

impl SessionRole {
    pub fn namespace(&self) -> &'static str {
        match self {
            SessionRole::Client => ns::JABBER_CLIENT,
            SessionRole::Server => ns::JABBER_SERVER,
            SessionRole::Component => ns::COMPONENT_ACCEPT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: SessionRole,
    pub max_stanza_size: usize,
    /// The local side opened the connection (outbound s2s).
    pub initiating: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer closed the stream or the transport.
    #[error("session closed")]
    Closed,

    #[error("stream already open")]
    AlreadyOpen,

    /// Fatal: a stream error must be sent and the stream closed.
    #[error("stream error: {0}")]
    Stream(StreamErrorCondition),

    /// Recoverable: an error stanza goes back to the sender.
    #[error("invalid stanza: {condition}")]
    Stanza {
        element: XElement,
        condition: StanzaErrorCondition,
    },

    #[error("transport error: {0}")]
    Io(#[source] io::Error),
}

impl From<ParserError> for SessionError {
    fn from(e: ParserError) -> Self {
        match e {
            ParserError::StreamClosedByPeer | ParserError::UnexpectedEof => SessionError::Closed,
            ParserError::TooLargeStanza => SessionError::Stream(StreamErrorCondition::PolicyViolation),
            ParserError::Syntax(_) | ParserError::UnexpectedEndElement(_) => {
                SessionError::Stream(StreamErrorCondition::InvalidXml)
            }
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => SessionError::Closed,
            io::ErrorKind::TimedOut => SessionError::Stream(StreamErrorCondition::ConnectionTimeout),
            _ => SessionError::Io(e),
        }
    }
}

/// What [`Session::receive`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// The peer's stream opener.
    Opened(XElement),
    /// A non-stanza element (negotiation, dialback, ...).
    Element(XElement),
    Stanza(Stanza),
}

pub struct Session<T> {
    id: String,
    config: SessionConfig,
    hosts: Arc<Hosts>,
    transport: T,
    parser: Parser,
    read_buf: Vec<u8>,
    opened: AtomicBool,
    started: bool,
    jid: Jid,
    remote_domain: String,
    peer_stream_id: Option<String>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, hosts: Arc<Hosts>, config: SessionConfig) -> Self {
        let mode = parsing_mode(transport.transport_type());
        let jid = hosts.default_jid().clone();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parser: Parser::new(mode, config.max_stanza_size),
            config,
            hosts,
            transport,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            opened: AtomicBool::new(false),
            started: false,
            jid,
            remote_domain: String::new(),
            peer_stream_id: None,
        }
    }

    /// Locally generated stream id.
    pub fn stream_id(&self) -> &str {
        &self.id
    }

    /// Stream id announced by the peer, when it sent one.
    pub fn peer_stream_id(&self) -> Option<&str> {
        self.peer_stream_id.as_deref()
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// Local address of the stream: the served domain before binding and
    /// the bound full JID afterwards.
    pub fn set_jid(&mut self, jid: Jid) {
        self.jid = jid;
    }

    pub fn remote_domain(&self) -> &str {
        &self.remote_domain
    }

    pub fn set_remote_domain(&mut self, domain: impl Into<String>) {
        self.remote_domain = domain.into();
    }

    pub fn is_secured(&self) -> bool {
        self.transport.is_secured()
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.transport_type()
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Send the stream opener. Fails with [`SessionError::AlreadyOpen`] on
    /// the second call for the same stream.
    pub async fn open(&mut self, extra_attrs: &[(&str, &str)]) -> Result<(), SessionError> {
        if self
            .opened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyOpen);
        }

        let mut out = String::new();
        let builder = match self.transport.transport_type() {
            TransportType::Socket => {
                out.push_str("<?xml version=\"1.0\"?>");
                XElement::builder("stream:stream")
                    .attr("xmlns", self.config.role.namespace())
                    .attr("xmlns:stream", ns::STREAM)
            }
            TransportType::WebSocket => XElement::builder("open").attr("xmlns", ns::FRAMING),
        };
        let mut builder = extra_attrs
            .iter()
            .fold(builder, |b, (label, value)| b.attr(*label, *value))
            .attr("version", "1.0")
            .attr("from", self.jid.domain());
        if self.config.initiating {
            builder = builder.attr("to", self.remote_domain.as_str());
        } else if self.transport.transport_type() == TransportType::Socket {
            // WebSocket openers carry no stream id.
            builder = builder.attr("id", self.id.as_str());
        }
        let opener = builder.build();
        opener.write_open_tag(&mut out, self.transport.transport_type() == TransportType::WebSocket);

        trace!(stream_id = %self.id, opener = %out, "Opening stream");
        self.write_raw(out.as_bytes()).await
    }

    /// Read the next element from the peer.
    ///
    /// Cancel safe: bytes already read stay buffered in the parser.
    pub async fn receive(&mut self) -> Result<Received, SessionError> {
        loop {
            if let Some(element) = self.parser.next_element()? {
                return self.process(element);
            }
            let n = self.transport.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(self.parser.finish().into());
            }
            self.parser.feed(&self.read_buf[..n]);
        }
    }

    fn process(&mut self, element: XElement) -> Result<Received, SessionError> {
        if !self.started {
            self.validate_opener(&element)?;
            self.started = true;
            return Ok(Received::Opened(element));
        }
        if !element.is_stanza() {
            return Ok(Received::Element(element));
        }
        self.build_stanza(element).map(Received::Stanza)
    }

    fn validate_opener(&mut self, element: &XElement) -> Result<(), SessionError> {
        match self.transport.transport_type() {
            TransportType::Socket => {
                if element.name() != "stream:stream" {
                    return Err(SessionError::Stream(StreamErrorCondition::UnsupportedStanzaType));
                }
                if element.namespace() != Some(self.config.role.namespace()) {
                    return Err(SessionError::Stream(StreamErrorCondition::InvalidNamespace));
                }
                if element.attr("xmlns:stream") != Some(ns::STREAM) {
                    return Err(SessionError::Stream(StreamErrorCondition::InvalidNamespace));
                }
            }
            TransportType::WebSocket => {
                if element.name() != "open" {
                    return Err(SessionError::Stream(StreamErrorCondition::UnsupportedStanzaType));
                }
                if element.namespace() != Some(ns::FRAMING) {
                    return Err(SessionError::Stream(StreamErrorCondition::InvalidNamespace));
                }
            }
        }
        // XEP-0114 streams predate stream versioning.
        if self.config.role != SessionRole::Component && element.attr("version") != Some("1.0") {
            return Err(SessionError::Stream(StreamErrorCondition::UnsupportedVersion));
        }

        let to = element.attr("to").filter(|to| !to.is_empty());
        if let Some(to) = to {
            let domain = Jid::domain_jid(to).map_err(|_| SessionError::Stream(StreamErrorCondition::HostUnknown))?;
            if self.config.role == SessionRole::Component {
                // A component names its own subdomain.
                self.remote_domain = domain.domain().to_string();
            } else if !self.hosts.is_local_host(domain.domain()) {
                return Err(SessionError::Stream(StreamErrorCondition::HostUnknown));
            }
            if !self.config.initiating {
                self.jid = domain;
            }
        }
        if let Some(from) = element.attr("from").filter(|f| !f.is_empty()) {
            if self.config.role == SessionRole::Server && !self.config.initiating {
                self.remote_domain = from.to_string();
            }
        }
        if let Some(id) = element.attr("id") {
            self.peer_stream_id = Some(id.to_string());
        }
        debug!(stream_id = %self.id, domain = %self.jid.domain(), "Stream opener accepted");
        Ok(())
    }

    fn build_stanza(&self, element: XElement) -> Result<Stanza, SessionError> {
        if let Some(namespace) = element.namespace() {
            if namespace != self.config.role.namespace() {
                return Err(SessionError::Stream(StreamErrorCondition::InvalidNamespace));
            }
        }
        let from = self.resolve_from(&element)?;
        let to = match element.attr("to").filter(|to| !to.is_empty()) {
            Some(to) => match Jid::parse(to) {
                Ok(jid) => jid,
                Err(_) => {
                    return Err(SessionError::Stanza {
                        element,
                        condition: StanzaErrorCondition::JidMalformed,
                    })
                }
            },
            None => match self.config.role {
                SessionRole::Client => self.jid.to_bare(),
                SessionRole::Server | SessionRole::Component => self.jid.to_domain(),
            },
        };

        let Some(kind) = StanzaKind::from_name(element.name()) else {
            return Err(SessionError::Stream(StreamErrorCondition::UnsupportedStanzaType));
        };
        Stanza::new(kind, element.clone(), from, to).map_err(|e| SessionError::Stanza {
            element,
            condition: e.condition,
        })
    }

    fn resolve_from(&self, element: &XElement) -> Result<Jid, SessionError> {
        let invalid_from = SessionError::Stream(StreamErrorCondition::InvalidFrom);
        let raw = element.attr("from").filter(|f| !f.is_empty());
        match self.config.role {
            SessionRole::Client => {
                let Some(raw) = raw else {
                    return Ok(self.jid.clone());
                };
                let from = Jid::parse(raw).map_err(|_| SessionError::Stream(StreamErrorCondition::InvalidFrom))?;
                let matches = from.node() == self.jid.node()
                    && from.domain() == self.jid.domain()
                    && (from.resource().is_empty() || from.resource() == self.jid.resource());
                if matches {
                    Ok(self.jid.clone())
                } else {
                    Err(invalid_from)
                }
            }
            SessionRole::Server | SessionRole::Component => {
                let from = raw
                    .and_then(|raw| Jid::parse(raw).ok())
                    .ok_or(SessionError::Stream(StreamErrorCondition::InvalidFrom))?;
                if from.domain() != self.remote_domain {
                    return Err(invalid_from);
                }
                Ok(from)
            }
        }
    }

    /// Write an element. Stanzas lose their `xmlns`: they travel in the
    /// stream's default namespace.
    pub async fn send(&mut self, element: &XElement) -> Result<(), SessionError> {
        let out = if element.is_stanza() && element.attr("xmlns").is_some() {
            element.to_builder().remove_attr("xmlns").build().to_string()
        } else {
            element.to_string()
        };
        trace!(stream_id = %self.id, element = %out, "Sending element");
        self.write_raw(out.as_bytes()).await
    }

    /// Write the stream closer. The transport stays open.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let closer = match self.transport.transport_type() {
            TransportType::Socket => "</stream:stream>".to_string(),
            TransportType::WebSocket => XElement::builder("close")
                .attr("xmlns", ns::FRAMING)
                .build()
                .to_string(),
        };
        self.write_raw(closer.as_bytes()).await
    }

    /// Send a stream error, opening the stream first if needed, and close
    /// the stream.
    pub async fn send_stream_error(&mut self, condition: StreamErrorCondition) -> Result<(), SessionError> {
        if !self.is_open() {
            self.open(&[]).await?;
        }
        let mut element = condition.to_element();
        if self.transport.transport_type() == TransportType::WebSocket {
            element = element.into_builder().attr("xmlns:stream", ns::STREAM).build();
        }
        debug!(stream_id = %self.id, condition = %condition, "Sending stream error");
        self.send(&element).await?;
        self.close().await
    }

    /// Upgrade the transport to TLS and restart the stream.
    pub async fn start_tls(&mut self, upgrade: TlsUpgrade) -> Result<(), SessionError> {
        self.transport.start_tls(upgrade).await?;
        self.reset();
        Ok(())
    }

    /// Restart the stream (after TLS or SASL): the peer sends a new opener
    /// and a new stream id is generated.
    pub fn reset(&mut self) {
        self.parser = Parser::new(self.parser.mode(), self.config.max_stanza_size);
        self.opened.store(false, Ordering::Release);
        self.started = false;
        self.id = uuid::Uuid::new_v4().to_string();
    }

    /// Close the underlying transport.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.transport.close().await {
            debug!(stream_id = %self.id, error = %e, "Error closing transport");
        }
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.transport.write(data).await?;
        self.transport.flush().await?;
        Ok(())
    }
}

fn parsing_mode(transport: TransportType) -> ParsingMode {
    match transport {
        TransportType::Socket => ParsingMode::SocketStream,
        TransportType::WebSocket => ParsingMode::WebSocketStream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SocketTransport;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Byte stream announcing WebSocket framing, one frame per write.
    struct FramedDuplex(SocketTransport<DuplexStream>);

    #[async_trait]
    impl Transport for FramedDuplex {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf).await
        }

        async fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.0.write(data).await
        }

        async fn flush(&mut self) -> io::Result<()> {
            self.0.flush().await
        }

        async fn start_tls(&mut self, _upgrade: TlsUpgrade) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no TLS over WebSocket"))
        }

        async fn close(&mut self) -> io::Result<()> {
            self.0.close().await
        }

        fn transport_type(&self) -> TransportType {
            TransportType::WebSocket
        }

        fn is_secured(&self) -> bool {
            true
        }
    }

    const WS_OPENER: &str = "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='jackal.im' version='1.0'/>";

    fn ws_session() -> (Session<FramedDuplex>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let hosts = Arc::new(Hosts::plain(["jackal.im"]).unwrap());
        let session = Session::new(
            FramedDuplex(SocketTransport::new(local)),
            hosts,
            SessionConfig {
                role: SessionRole::Client,
                max_stanza_size: 1024,
                initiating: false,
            },
        );
        (session, remote)
    }

    const CLIENT_OPENER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' version='1.0' to='jackal.im'>";

    fn session(role: SessionRole) -> (Session<SocketTransport<DuplexStream>>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let hosts = Arc::new(Hosts::plain(["jackal.im"]).unwrap());
        let session = Session::new(
            SocketTransport::new(local),
            hosts,
            SessionConfig {
                role,
                max_stanza_size: 1024,
                initiating: false,
            },
        );
        (session, remote)
    }

    async fn read_all(peer: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_open_emits_prolog_and_opener() {
        let (mut session, mut peer) = session(SessionRole::Client);
        session.open(&[]).await.unwrap();
        let out = read_all(&mut peer).await;
        assert_eq!(
            out,
            format!(
                "<?xml version=\"1.0\"?><stream:stream xmlns=\"jabber:client\" \
                 xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\" \
                 from=\"jackal.im\" id=\"{}\">",
                session.stream_id()
            )
        );
        assert!(matches!(session.open(&[]).await, Err(SessionError::AlreadyOpen)));
    }

    #[tokio::test]
    async fn test_receive_opener_and_stanza() {
        let (mut session, mut peer) = session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.as_bytes()).await.unwrap();
        assert!(matches!(session.receive().await.unwrap(), Received::Opened(_)));
        assert_eq!(session.jid().domain(), "jackal.im");

        session.set_jid(Jid::parse("ortuman@jackal.im/balcony").unwrap());
        peer.write_all(b"<message type='chat' to='noelia@jackal.im'><body>hi</body></message>")
            .await
            .unwrap();
        match session.receive().await.unwrap() {
            Received::Stanza(Stanza::Message(msg)) => {
                assert_eq!(msg.from().to_string(), "ortuman@jackal.im/balcony");
                assert_eq!(msg.to().to_string(), "noelia@jackal.im");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let (mut session, mut peer) = session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.replace("jackal.im", "example.org").as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            session.receive().await,
            Err(SessionError::Stream(StreamErrorCondition::HostUnknown))
        ));
    }

    #[tokio::test]
    async fn test_opener_validation() {
        let cases = [
            (CLIENT_OPENER.replace("version='1.0'", "version='2.0'"), StreamErrorCondition::UnsupportedVersion),
            (CLIENT_OPENER.replace("jabber:client", "jabber:server"), StreamErrorCondition::InvalidNamespace),
            ("<stream xmlns='jabber:client'>".to_string(), StreamErrorCondition::UnsupportedStanzaType),
        ];
        for (opener, expected) in cases {
            let (mut session, mut peer) = session(SessionRole::Client);
            peer.write_all(opener.as_bytes()).await.unwrap();
            match session.receive().await {
                Err(SessionError::Stream(cond)) => assert_eq!(cond, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_from() {
        let (mut session, mut peer) = session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();
        session.set_jid(Jid::parse("ortuman@jackal.im/balcony").unwrap());

        peer.write_all(b"<presence from='noelia@jackal.im/yard'/>").await.unwrap();
        assert!(matches!(
            session.receive().await,
            Err(SessionError::Stream(StreamErrorCondition::InvalidFrom))
        ));
    }

    #[tokio::test]
    async fn test_invalid_stanza_is_recoverable() {
        let (mut session, mut peer) = session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();
        session.set_jid(Jid::parse("ortuman@jackal.im/balcony").unwrap());

        peer.write_all(b"<iq type='get' id='1'/><presence/>").await.unwrap();
        match session.receive().await {
            Err(SessionError::Stanza { condition, .. }) => assert_eq!(condition, StanzaErrorCondition::BadRequest),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(session.receive().await, Ok(Received::Stanza(Stanza::Presence(_)))));
    }

    #[tokio::test]
    async fn test_peer_close_and_too_large() {
        let (mut session, mut peer) = session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();
        peer.write_all(b"</stream:stream>").await.unwrap();
        assert!(matches!(session.receive().await, Err(SessionError::Closed)));

        let (mut session, mut peer) = self::session(SessionRole::Client);
        peer.write_all(CLIENT_OPENER.as_bytes()).await.unwrap();
        session.receive().await.unwrap();
        let big = format!("<message><body>{}</body></message>", "a".repeat(2048));
        peer.write_all(big.as_bytes()).await.unwrap();
        assert!(matches!(
            session.receive().await,
            Err(SessionError::Stream(StreamErrorCondition::PolicyViolation))
        ));
    }

    #[tokio::test]
    async fn test_stream_error_opens_first() {
        let (mut session, mut peer) = session(SessionRole::Client);
        session
            .send_stream_error(StreamErrorCondition::ConnectionTimeout)
            .await
            .unwrap();
        let mut out = String::new();
        while !out.ends_with("</stream:stream>") {
            out.push_str(&read_all(&mut peer).await);
        }
        assert!(out.starts_with("<?xml version=\"1.0\"?><stream:stream"));
        assert!(out.contains(
            "<stream:error><connection-timeout xmlns=\"urn:ietf:params:xml:ns:xmpp-streams\"/></stream:error>"
        ));
    }

    #[tokio::test]
    async fn test_server_session_checks_remote_domain() {
        let (mut session, mut peer) = session(SessionRole::Server);
        peer.write_all(
            b"<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' \
              version='1.0' from='example.org' to='jackal.im'>",
        )
        .await
        .unwrap();
        session.receive().await.unwrap();
        assert_eq!(session.remote_domain(), "example.org");

        peer.write_all(b"<message from='romeo@example.org/orchard' to='juliet@jackal.im'/>")
            .await
            .unwrap();
        assert!(matches!(session.receive().await, Ok(Received::Stanza(_))));

        peer.write_all(b"<message from='iago@example.net' to='juliet@jackal.im'/>")
            .await
            .unwrap();
        assert!(matches!(
            session.receive().await,
            Err(SessionError::Stream(StreamErrorCondition::InvalidFrom))
        ));
    }

    #[tokio::test]
    async fn test_websocket_open_and_close_exchange() {
        let (mut session, mut peer) = ws_session();
        peer.write_all(WS_OPENER.as_bytes()).await.unwrap();
        assert!(matches!(session.receive().await.unwrap(), Received::Opened(_)));

        session.open(&[]).await.unwrap();
        assert_eq!(
            read_all(&mut peer).await,
            "<open xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\" version=\"1.0\" from=\"jackal.im\"/>"
        );

        session.set_jid(Jid::parse("ortuman@jackal.im/balcony").unwrap());
        peer.write_all(b"<presence/>").await.unwrap();
        assert!(matches!(session.receive().await, Ok(Received::Stanza(Stanza::Presence(_)))));

        peer.write_all(b"<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>")
            .await
            .unwrap();
        assert!(matches!(session.receive().await, Err(SessionError::Closed)));
        session.close().await.unwrap();
        assert_eq!(
            read_all(&mut peer).await,
            "<close xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\"/>"
        );
    }

    #[tokio::test]
    async fn test_websocket_stream_error_is_framed() {
        let (mut session, mut peer) = ws_session();
        session
            .send_stream_error(StreamErrorCondition::ConnectionTimeout)
            .await
            .unwrap();
        let closer = "<close xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\"/>";
        let mut out = String::new();
        while !out.ends_with(closer) {
            out.push_str(&read_all(&mut peer).await);
        }
        assert_eq!(
            out,
            format!(
                "<open xmlns=\"urn:ietf:params:xml:ns:xmpp-framing\" version=\"1.0\" from=\"jackal.im\"/>\
                 <stream:error xmlns:stream=\"http://etherx.jabber.org/streams\">\
                 <connection-timeout xmlns=\"urn:ietf:params:xml:ns:xmpp-streams\"/></stream:error>{closer}"
            )
        );
        assert!(!out.contains("<?xml"));
    }
}
