//! Byte transports under an XMPP session.
//!
//! - [`SocketTransport`]: TCP (or any duplex byte stream) with in-place
//!   STARTTLS upgrade
//! - [`WebSocketTransport`]: RFC 7395 framing over an axum WebSocket

use std::io;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::types::TransportType;

mod socket;
mod websocket;

pub use socket::SocketTransport;
pub use websocket::WebSocketTransport;

/// Which side of the TLS handshake this transport plays.
pub enum TlsUpgrade {
    Server(TlsAcceptor),
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

#[async_trait]
pub trait Transport: Send {
    /// Read available bytes. `Ok(0)` means the peer closed the transport.
    ///
    /// Cancel safe: no data is lost if the future is dropped before it
    /// completes.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue bytes for writing.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Upgrade the transport to TLS in place.
    async fn start_tls(&mut self, upgrade: TlsUpgrade) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;

    fn transport_type(&self) -> TransportType;

    fn is_secured(&self) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        (**self).flush().await
    }

    async fn start_tls(&mut self, upgrade: TlsUpgrade) -> io::Result<()> {
        (**self).start_tls(upgrade).await
    }

    async fn close(&mut self) -> io::Result<()> {
        (**self).close().await
    }

    fn transport_type(&self) -> TransportType {
        (**self).transport_type()
    }

    fn is_secured(&self) -> bool {
        (**self).is_secured()
    }
}
