use std::io;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tracing::debug;

use super::{TlsUpgrade, Transport};
use crate::types::TransportType;

/// RFC 7395 transport. Every flush emits one text frame; TLS is terminated
/// by the HTTP listener, so the transport always counts as secured.
pub struct WebSocketTransport {
    socket: WebSocket,
    pending: Vec<u8>,
    outbound: Vec<u8>,
    closed: bool,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            pending: Vec::new(),
            outbound: Vec::new(),
            closed: false,
        }
    }
}

fn ws_error(e: axum::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            if self.closed {
                return Ok(0);
            }
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => self.pending = text.into_bytes(),
                Some(Ok(Message::Binary(data))) => self.pending = data,
                Some(Ok(Message::Ping(data))) => {
                    self.socket.send(Message::Pong(data)).await.map_err(ws_error)?;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket closed by peer");
                    self.closed = true;
                }
                Some(Err(e)) => return Err(ws_error(e)),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        let frame = String::from_utf8(std::mem::take(&mut self.outbound))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send(Message::Text(frame)).await.map_err(ws_error)
    }

    async fn start_tls(&mut self, _upgrade: TlsUpgrade) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "STARTTLS is not available over WebSocket",
        ))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.flush().await?;
        if !self.closed {
            self.closed = true;
            // The peer may already be gone.
            let _ = self.socket.send(Message::Close(None)).await;
        }
        Ok(())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn is_secured(&self) -> bool {
        true
    }
}
