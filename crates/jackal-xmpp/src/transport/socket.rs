use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use tracing::debug;

use super::{TlsUpgrade, Transport};
use crate::types::TransportType;

#[derive(Default)]
enum StreamInner<S> {
    #[default]
    None,
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

/// Byte-stream transport; TCP in production, `tokio::io::duplex` in tests.
pub struct SocketTransport<S = TcpStream> {
    inner: StreamInner<S>,
}

impl<S> SocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: StreamInner::Plain(stream),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport not initialized")
}

#[async_trait]
impl<S> Transport for SocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            StreamInner::None => Err(not_connected()),
            StreamInner::Plain(s) => s.read(buf).await,
            StreamInner::Tls(s) => s.read(buf).await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            StreamInner::None => Err(not_connected()),
            StreamInner::Plain(s) => s.write_all(data).await,
            StreamInner::Tls(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            StreamInner::None => Err(not_connected()),
            StreamInner::Plain(s) => s.flush().await,
            StreamInner::Tls(s) => s.flush().await,
        }
    }

    async fn start_tls(&mut self, upgrade: TlsUpgrade) -> io::Result<()> {
        let stream = match std::mem::take(&mut self.inner) {
            StreamInner::Plain(s) => s,
            other => {
                self.inner = other;
                return Err(io::Error::new(io::ErrorKind::Other, "transport already secured"));
            }
        };
        let tls = match upgrade {
            TlsUpgrade::Server(acceptor) => TlsStream::from(acceptor.accept(stream).await?),
            TlsUpgrade::Client {
                connector,
                server_name,
            } => TlsStream::from(connector.connect(server_name, stream).await?),
        };
        debug!("TLS established");
        self.inner = StreamInner::Tls(Box::new(tls));
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        match &mut self.inner {
            StreamInner::None => Ok(()),
            StreamInner::Plain(s) => s.shutdown().await,
            StreamInner::Tls(s) => s.shutdown().await,
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Socket
    }

    fn is_secured(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_read_write() {
        let (client, server) = tokio::io::duplex(1024);
        let mut a = SocketTransport::new(client);
        let mut b = SocketTransport::new(server);

        a.write(b"<presence/>").await.unwrap();
        a.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<presence/>");
        assert!(!b.is_secured());
        assert_eq!(b.transport_type(), TransportType::Socket);

        a.close().await.unwrap();
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
