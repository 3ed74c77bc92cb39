//! TCP membership layer.
//!
//! Every node keeps one outbound connection per peer for its own sends and
//! accepts inbound connections for the peer's sends, so traffic between two
//! nodes is FIFO in each direction. Connections carry length-delimited
//! frames; the first byte tells a JSON control frame from a binary cluster
//! message.
//!
//! Join: the dialling node sends `hello`, the peer answers `welcome` with
//! the members it knows, and the dialling node connects to those as well.
//! An inbound `hello` from an unknown node is answered by dialling back.
//! Outbound connections ping their peer; a peer silent for longer than the
//! suspicion timeout is dropped.

use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterConfig, ClusterError, ClusterEvent, ClusterMember, ClusterMessage, NodeMeta};

const FRAME_CONTROL: u8 = 0;
const FRAME_MESSAGE: u8 = 1;
const PEER_QUEUE_SIZE: usize = 1024;

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Control {
    Hello { member: ClusterMember },
    Welcome { member: ClusterMember, peers: Vec<ClusterMember> },
    Ping { seq: u64 },
    Ack { seq: u64 },
    Leave { name: String },
}

#[derive(Debug)]
enum Frame {
    Control(Control),
    Message(Bytes),
}

fn control_frame(control: &Control) -> Result<Bytes, ClusterError> {
    let json = serde_json::to_vec(control)?;
    let mut buf = BytesMut::with_capacity(json.len() + 1);
    buf.put_u8(FRAME_CONTROL);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

fn message_frame(raw: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(raw.len() + 1);
    buf.put_u8(FRAME_MESSAGE);
    buf.put_slice(raw);
    buf.freeze()
}

fn decode_frame(mut raw: BytesMut) -> Result<Frame, ClusterError> {
    if raw.is_empty() {
        return Err(ClusterError::Handshake("empty frame".to_string()));
    }
    let body = raw.split_off(1);
    match raw[0] {
        FRAME_CONTROL => Ok(Frame::Control(serde_json::from_slice(&body)?)),
        FRAME_MESSAGE => Ok(Frame::Message(body.freeze())),
        other => Err(ClusterError::Handshake(format!("unknown frame type {other}"))),
    }
}

enum PeerCommand {
    Message(Bytes),
    Leave(oneshot::Sender<()>),
}

struct Peer {
    conn_id: String,
    member: ClusterMember,
    tx: mpsc::Sender<PeerCommand>,
}

pub struct Memberlist {
    local: ClusterMember,
    config: ClusterConfig,
    peers: DashMap<String, Peer>,
    events: mpsc::Sender<ClusterEvent>,
    shutdown: CancellationToken,
    this: Weak<Memberlist>,
}

impl Memberlist {
    pub async fn start(config: ClusterConfig, events: mpsc::Sender<ClusterEvent>) -> Result<Arc<Self>, ClusterError> {
        if config.name.is_empty() {
            return Err(ClusterError::Handshake("cluster node name is required".to_string()));
        }
        let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        let addr = match &config.advertise_addr {
            Some(addr) => addr.clone(),
            None => listener.local_addr()?.to_string(),
        };
        let local = ClusterMember {
            name: config.name.clone(),
            addr,
            meta: NodeMeta::current(),
        };
        info!(node = %local.name, addr = %local.addr, "Cluster listening");

        let memberlist = Arc::new_cyclic(|this| Self {
            local,
            config,
            peers: DashMap::new(),
            events,
            shutdown: CancellationToken::new(),
            this: this.clone(),
        });
        tokio::spawn(Arc::clone(&memberlist).accept_loop(listener));
        for host in &memberlist.config.hosts {
            memberlist.spawn_dial(host.clone());
        }
        Ok(memberlist)
    }

    pub fn local(&self) -> &ClusterMember {
        &self.local
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.peers.iter().map(|p| p.member.clone()).collect()
    }

    pub async fn send(&self, node: &str, raw: Bytes) -> Result<(), ClusterError> {
        let tx = self
            .peers
            .get(node)
            .map(|p| p.tx.clone())
            .ok_or_else(|| ClusterError::UnknownNode(node.to_string()))?;
        tx.send(PeerCommand::Message(raw))
            .await
            .map_err(|_| ClusterError::Closed)
    }

    /// Tell every peer this node is leaving, then stop all connections.
    pub async fn leave(&self) {
        let peers: Vec<_> = self.peers.iter().map(|p| p.tx.clone()).collect();
        for tx in peers {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(PeerCommand::Leave(done_tx)).await.is_ok() {
                let _ = tokio::time::timeout(self.config.in_timeout, done_rx).await;
            }
        }
        self.shutdown.cancel();
        info!(node = %self.local.name, "Left cluster");
    }

    async fn emit(&self, event: ClusterEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Cluster event receiver dropped");
        }
    }

    fn spawn_dial(&self, addr: String) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.dial(&addr).await {
                debug!(addr = %addr, error = %e, "Cluster dial failed");
            }
        });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = this.serve_inbound(tcp).await {
                                debug!(peer = %peer_addr, error = %e, "Inbound cluster connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to accept cluster connection"),
                },
            }
        }
    }

    /// Receive side of a peer connection.
    async fn serve_inbound(&self, tcp: TcpStream) -> Result<(), ClusterError> {
        let mut conn = Framed::new(tcp, LengthDelimitedCodec::new());
        let hello = tokio::time::timeout(self.config.in_timeout, conn.next())
            .await
            .map_err(|_| ClusterError::Handshake("hello timeout".to_string()))?
            .ok_or_else(|| ClusterError::Handshake("connection closed".to_string()))??;
        let member = match decode_frame(hello)? {
            Frame::Control(Control::Hello { member }) => member,
            _ => return Err(ClusterError::Handshake("expected hello".to_string())),
        };
        if !self.local.meta.is_compatible(&member.meta) {
            warn!(node = %member.name, version = %member.meta.version, "Rejecting incompatible cluster node");
            return Err(ClusterError::Handshake("incompatible version".to_string()));
        }
        let welcome = Control::Welcome {
            member: self.local.clone(),
            peers: self.members(),
        };
        conn.send(control_frame(&welcome)?).await?;
        self.observe(member).await;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = conn.next() => frame,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            match decode_frame(frame?)? {
                Frame::Control(Control::Ping { seq }) => {
                    conn.send(control_frame(&Control::Ack { seq })?).await?;
                }
                Frame::Control(Control::Leave { name }) => {
                    self.remove_peer(&name, None).await;
                    return Ok(());
                }
                Frame::Control(other) => debug!(frame = ?other, "Ignoring control frame"),
                Frame::Message(raw) => match ClusterMessage::decode(raw) {
                    Ok(message) => self.emit(ClusterEvent::Message(message)).await,
                    Err(e) => warn!(error = %e, "Dropping undecodable cluster message"),
                },
            }
        }
    }

    /// A peer introduced itself: dial back if we have no connection to it
    /// yet, otherwise refresh its metadata.
    async fn observe(&self, member: ClusterMember) {
        if member.name == self.local.name {
            return;
        }
        let updated = match self.peers.get_mut(&member.name) {
            Some(mut peer) if peer.member != member => {
                peer.member = member.clone();
                true
            }
            Some(_) => false,
            None => {
                self.spawn_dial(member.addr.clone());
                false
            }
        };
        if updated {
            self.emit(ClusterEvent::NodeUpdated(member)).await;
        }
    }

    /// Send side of a peer connection.
    async fn dial(&self, addr: &str) -> Result<(), ClusterError> {
        if addr == self.local.addr {
            return Ok(());
        }
        let handshake = async {
            let tcp = TcpStream::connect(addr).await?;
            let mut conn = Framed::new(tcp, LengthDelimitedCodec::new());
            let hello = Control::Hello {
                member: self.local.clone(),
            };
            conn.send(control_frame(&hello)?).await?;
            let frame = conn
                .next()
                .await
                .ok_or_else(|| ClusterError::Handshake("connection closed".to_string()))??;
            match decode_frame(frame)? {
                Frame::Control(Control::Welcome { member, peers }) => Ok((conn, member, peers)),
                _ => Err(ClusterError::Handshake("expected welcome".to_string())),
            }
        };
        let (conn, member, peers) = tokio::time::timeout(self.config.in_timeout, handshake)
            .await
            .map_err(|_| ClusterError::Handshake(format!("{addr}: handshake timeout")))??;

        if member.name == self.local.name {
            return Ok(());
        }
        if !self.local.meta.is_compatible(&member.meta) {
            return Err(ClusterError::Handshake(format!(
                "{} runs incompatible version {}",
                member.name, member.meta.version
            )));
        }

        let (tx, rx) = mpsc::channel(PEER_QUEUE_SIZE);
        let conn_id = uuid::Uuid::new_v4().to_string();
        match self.peers.entry(member.name.clone()) {
            Entry::Occupied(_) => {
                debug!(node = %member.name, "Already connected to cluster node");
                return Ok(());
            }
            Entry::Vacant(v) => {
                v.insert(Peer {
                    conn_id: conn_id.clone(),
                    member: member.clone(),
                    tx,
                });
            }
        }
        info!(node = %member.name, addr = %member.addr, "Cluster node joined");
        self.emit(ClusterEvent::NodeJoined(member.clone())).await;

        for peer in peers {
            if peer.name != self.local.name && !self.peers.contains_key(&peer.name) {
                self.spawn_dial(peer.addr);
            }
        }
        self.run_outbound(conn, &member.name, &conn_id, rx).await
    }

    async fn run_outbound(
        &self,
        mut conn: Connection,
        name: &str,
        conn_id: &str,
        mut rx: mpsc::Receiver<PeerCommand>,
    ) -> Result<(), ClusterError> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        let mut seq = 0u64;
        let mut last_seen = Instant::now();

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                command = rx.recv() => match command {
                    Some(PeerCommand::Message(raw)) => {
                        if let Err(e) = conn.send(message_frame(&raw)).await {
                            break Err(e.into());
                        }
                    }
                    Some(PeerCommand::Leave(done)) => {
                        let leave = Control::Leave { name: self.local.name.clone() };
                        let sent = match control_frame(&leave) {
                            Ok(frame) => conn.send(frame).await.map_err(ClusterError::from),
                            Err(e) => Err(e),
                        };
                        let _ = done.send(());
                        break sent;
                    }
                    None => break Ok(()),
                },
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.config.suspicion_timeout {
                        warn!(node = %name, "Cluster node unresponsive");
                        break Ok(());
                    }
                    seq += 1;
                    let sent = match control_frame(&Control::Ping { seq }) {
                        Ok(frame) => conn.send(frame).await.map_err(ClusterError::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        break Err(e);
                    }
                }
                frame = conn.next() => match frame {
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
            }
        };
        self.remove_peer(name, Some(conn_id)).await;
        result
    }

    async fn remove_peer(&self, name: &str, conn_id: Option<&str>) {
        let removed = match conn_id {
            Some(id) => self.peers.remove_if(name, |_, peer| peer.conn_id == id),
            None => self.peers.remove(name),
        };
        if removed.is_some() {
            info!(node = %name, "Cluster node left");
            self.emit(ClusterEvent::NodeLeft(name.to_string())).await;
        }
    }
}
