//! Stream handles.
//!
//! A bound client stream is an actor: its connection task owns the transport
//! and session, and everybody else talks to it through a [`C2sStream`]
//! handle. Remote sessions bound on cluster peers are represented by the
//! same trait (see [`crate::cluster::ClusterStream`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StreamErrorCondition;
use crate::jid::Jid;
use crate::stanza::Presence;
use crate::xml::XElement;

/// String context attached to a stream and replicated to cluster peers.
pub type StreamContext = BTreeMap<String, String>;

/// Commands processed by the task owning a local stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Write an element to the peer.
    SendElement(XElement),
    /// Close the stream, optionally sending a stream error first.
    Disconnect(Option<StreamErrorCondition>),
}

/// Outcome of queueing an element on a stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Queued for delivery
    Sent,
    /// The stream's outbound queue is full (backpressure)
    ChannelFull,
    /// The stream is gone or its peer path failed
    ChannelClosed,
    /// The handle cannot carry this kind of element
    Rejected,
}

impl SendResult {
    pub fn is_sent(self) -> bool {
        self == SendResult::Sent
    }
}

/// Handle to a client stream, local or remote.
#[async_trait]
pub trait C2sStream: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn jid(&self) -> Jid;

    fn username(&self) -> String {
        self.jid().node().to_string()
    }

    fn domain(&self) -> String {
        self.jid().domain().to_string()
    }

    fn resource(&self) -> String {
        self.jid().resource().to_string()
    }

    fn is_secured(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    /// Last presence sent by the client, if any.
    fn presence(&self) -> Option<Presence>;

    fn set_presence(&self, presence: Option<Presence>);

    fn context_value(&self, key: &str) -> Option<String>;

    fn context(&self) -> StreamContext;

    fn set_context_value(&self, key: &str, value: &str);

    /// Name of the cluster node owning this stream; `None` for local streams.
    fn cluster_node(&self) -> Option<&str> {
        None
    }

    /// Queue an element for delivery. Elements are written in queue order;
    /// nothing is queued unless the result is [`SendResult::Sent`].
    async fn send_element(&self, element: XElement) -> SendResult;

    async fn disconnect(&self, condition: Option<StreamErrorCondition>);
}

#[derive(Debug)]
struct LocalStreamState {
    jid: Jid,
    secured: bool,
    authenticated: bool,
    presence: Option<Presence>,
    context: StreamContext,
}

/// Handle to a stream served by this node.
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    state: RwLock<LocalStreamState>,
    tx: mpsc::Sender<StreamCommand>,
}

impl LocalStream {
    /// Create a handle and the receiver its owning task must drain.
    pub fn new(id: impl Into<String>, jid: Jid, capacity: usize) -> (Self, mpsc::Receiver<StreamCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = Self {
            id: id.into(),
            state: RwLock::new(LocalStreamState {
                jid,
                secured: false,
                authenticated: false,
                presence: None,
                context: StreamContext::new(),
            }),
            tx,
        };
        (stream, rx)
    }

    fn read_state<R>(&self, f: impl FnOnce(&LocalStreamState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write_state<R>(&self, f: impl FnOnce(&mut LocalStreamState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_jid(&self, jid: Jid) {
        self.write_state(|s| s.jid = jid);
    }

    pub fn set_secured(&self, secured: bool) {
        self.write_state(|s| s.secured = secured);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.write_state(|s| s.authenticated = authenticated);
    }
}

#[async_trait]
impl C2sStream for LocalStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn jid(&self) -> Jid {
        self.read_state(|s| s.jid.clone())
    }

    fn is_secured(&self) -> bool {
        self.read_state(|s| s.secured)
    }

    fn is_authenticated(&self) -> bool {
        self.read_state(|s| s.authenticated)
    }

    fn presence(&self) -> Option<Presence> {
        self.read_state(|s| s.presence.clone())
    }

    fn set_presence(&self, presence: Option<Presence>) {
        self.write_state(|s| s.presence = presence);
    }

    fn context_value(&self, key: &str) -> Option<String> {
        self.read_state(|s| s.context.get(key).cloned())
    }

    fn context(&self) -> StreamContext {
        self.read_state(|s| s.context.clone())
    }

    fn set_context_value(&self, key: &str, value: &str) {
        self.write_state(|s| s.context.insert(key.to_string(), value.to_string()));
    }

    async fn send_element(&self, element: XElement) -> SendResult {
        match self.tx.try_send(StreamCommand::SendElement(element)) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(stream_id = %self.id, "Outbound channel full");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(stream_id = %self.id, "Stream already closed");
                SendResult::ChannelClosed
            }
        }
    }

    async fn disconnect(&self, condition: Option<StreamErrorCondition>) {
        if self.tx.send(StreamCommand::Disconnect(condition)).await.is_err() {
            debug!(stream_id = %self.id, "Stream already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_in_order() {
        let (stream, mut rx) = LocalStream::new("s1", Jid::parse("ortuman@jackal.im/balcony").unwrap(), 8);
        assert!(stream.send_element(XElement::new("a")).await.is_sent());
        assert!(stream.send_element(XElement::new("b")).await.is_sent());
        stream.disconnect(Some(StreamErrorCondition::Conflict)).await;

        assert_eq!(rx.recv().await, Some(StreamCommand::SendElement(XElement::new("a"))));
        assert_eq!(rx.recv().await, Some(StreamCommand::SendElement(XElement::new("b"))));
        assert_eq!(
            rx.recv().await,
            Some(StreamCommand::Disconnect(Some(StreamErrorCondition::Conflict)))
        );
    }

    #[tokio::test]
    async fn test_full_and_closed_channel_are_reported() {
        let (stream, mut rx) = LocalStream::new("s1", Jid::parse("jackal.im").unwrap(), 1);
        assert_eq!(stream.send_element(XElement::new("a")).await, SendResult::Sent);
        assert_eq!(stream.send_element(XElement::new("b")).await, SendResult::ChannelFull);
        assert_eq!(rx.recv().await, Some(StreamCommand::SendElement(XElement::new("a"))));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert_eq!(stream.send_element(XElement::new("c")).await, SendResult::ChannelClosed);
    }

    #[test]
    fn test_state_accessors() {
        let (stream, _rx) = LocalStream::new("s1", Jid::parse("jackal.im").unwrap(), 1);
        assert!(!stream.is_authenticated());
        stream.set_jid(Jid::parse("ortuman@jackal.im/garden").unwrap());
        stream.set_authenticated(true);
        stream.set_context_value("k", "v");
        assert_eq!(stream.username(), "ortuman");
        assert_eq!(stream.resource(), "garden");
        assert!(stream.is_authenticated());
        assert_eq!(stream.context_value("k").as_deref(), Some("v"));
        assert!(stream.cluster_node().is_none());
    }
}
