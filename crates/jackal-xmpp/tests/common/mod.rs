//! Test utilities for end-to-end server tests.
//!
//! Provides an in-process server bound to an ephemeral port, a raw XML
//! client speaking the socket framing, and router fixtures with in-memory
//! streams.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use base64::prelude::*;
use jackal_xmpp::auth::PasswordMaterial;
use jackal_xmpp::cluster::{ClusterDelegate, ClusterEvent};
use jackal_xmpp::stanza::Presence;
use jackal_xmpp::storage::{BlockListItem, BlockListRepository, User, UserRepository};
use jackal_xmpp::stream::StreamCommand;
use jackal_xmpp::transport::SocketTransport;
use jackal_xmpp::{
    C2sConfig, C2sListener, C2sStream, Cluster, ClusterConfig, Hosts, Jid, LocalStream, MemoryStorage, Modules,
    ModulesConfig, Router, Stanza, StreamRegistry, XElement,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const DOMAIN: &str = "jackal.im";
pub const PASSWORD: &str = "pencil";
pub const USERS: [&str; 4] = ["ortuman", "hamlet", "juliet", "romeo"];

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait before asserting that nothing arrived.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Install the TLS crypto provider and a test log writer once per binary.
/// `RUST_LOG` raises verbosity when a test needs tracing output.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

pub async fn memory_storage() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    for name in USERS {
        let password = PasswordMaterial::derive(PASSWORD, 64).unwrap();
        storage.upsert_user(&User::new(name, password)).await.unwrap();
    }
    storage
}

pub async fn router_fixture() -> Arc<Router> {
    router_with(memory_storage().await).await
}

pub async fn router_with(storage: Arc<MemoryStorage>) -> Arc<Router> {
    init_tracing();
    let hosts = Arc::new(Hosts::plain([DOMAIN]).unwrap());
    Arc::new(Router::new(hosts, Arc::new(StreamRegistry::new()), storage, None))
}

pub fn jid(s: &str) -> Jid {
    Jid::parse(s).unwrap()
}

pub fn presence(from: &str, priority: i8) -> Presence {
    let element = XElement::builder("presence")
        .child(XElement::builder("priority").text(priority.to_string()).build())
        .build();
    Presence::new(element, jid(from), jid(from).to_bare()).unwrap()
}

pub fn chat(from: &str, to: &str, body: &str) -> Stanza {
    let element = XElement::builder("message")
        .attr("from", from)
        .attr("to", to)
        .attr("type", "chat")
        .child(XElement::builder("body").text(body).build())
        .build();
    Stanza::from_element(element).unwrap()
}

/// An in-memory bound stream and the commands it receives.
pub struct TestStream {
    pub stream: Arc<LocalStream>,
    pub commands: mpsc::Receiver<StreamCommand>,
}

impl TestStream {
    /// Bind a stream for full JID `address` in `router`.
    pub async fn bind(router: &Router, address: &str, priority: Option<i8>) -> Self {
        Self::bind_with_capacity(router, address, priority, 16).await
    }

    /// Like [`TestStream::bind`], with an outbound queue of `capacity` elements.
    pub async fn bind_with_capacity(
        router: &Router,
        address: &str,
        priority: Option<i8>,
        capacity: usize,
    ) -> Self {
        let (stream, commands) =
            LocalStream::new(uuid::Uuid::new_v4().to_string(), jid(address), capacity);
        stream.set_authenticated(true);
        if let Some(priority) = priority {
            stream.set_presence(Some(presence(address, priority)));
        }
        let stream = Arc::new(stream);
        assert!(router.bind(stream.clone()).await, "failed to bind {address}");
        Self { stream, commands }
    }

    /// Next element written to this stream.
    pub async fn recv(&mut self) -> XElement {
        match timeout(DEFAULT_TIMEOUT, self.commands.recv()).await {
            Ok(Some(StreamCommand::SendElement(element))) => element,
            Ok(other) => panic!("unexpected stream command: {other:?}"),
            Err(_) => panic!("timed out waiting for an element"),
        }
    }

    pub fn is_idle(&mut self) -> bool {
        self.commands.try_recv().is_err()
    }
}

pub async fn block(storage: &MemoryStorage, username: &str, blocked: &str) {
    storage
        .insert_blocklist_item(&BlockListItem {
            username: username.to_string(),
            jid: blocked.to_string(),
        })
        .await
        .unwrap();
}

/// A cluster node: router plus membership and the event delegate.
pub struct TestNode {
    pub router: Arc<Router>,
    pub cluster: Arc<Cluster>,
    shutdown: CancellationToken,
}

impl TestNode {
    pub async fn start(name: &str, seeds: Vec<String>) -> Self {
        let router = router_fixture().await;
        let config = ClusterConfig {
            name: name.to_string(),
            bind: "127.0.0.1".to_string(),
            port: 0,
            hosts: seeds,
            ..ClusterConfig::default()
        };
        let (tx, rx) = mpsc::channel::<ClusterEvent>(64);
        let cluster = Cluster::start(config, tx).await.unwrap();
        router.set_cluster(Arc::clone(&cluster));

        let shutdown = CancellationToken::new();
        let delegate = ClusterDelegate::new(Arc::clone(&router), Arc::clone(&cluster));
        tokio::spawn(delegate.run(rx, shutdown.clone()));
        Self {
            router,
            cluster,
            shutdown,
        }
    }

    pub async fn wait_for_members(&self, count: usize) {
        wait_until(|| self.cluster.members().len() == count).await;
    }

    pub async fn stop(&self) {
        self.cluster.shutdown().await;
        self.shutdown.cancel();
    }
}

/// Poll `condition` until it holds or the default timeout elapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let result = timeout(DEFAULT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met in time");
}

/// In-process server accepting plain socket clients.
pub struct TestServer {
    pub addr: SocketAddr,
    pub router: Arc<Router>,
    pub storage: Arc<MemoryStorage>,
    pub shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(C2sConfig::default()).await
    }

    pub async fn start_with(config: C2sConfig) -> Self {
        let storage = memory_storage().await;
        let router = router_with(Arc::clone(&storage)).await;
        let modules = Modules::new(&ModulesConfig::default(), Arc::clone(&router));
        let listener = C2sListener::new(config, Arc::clone(&router), modules);

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = tcp.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let listener = Arc::clone(&listener);
                        let token = token.child_token();
                        tokio::spawn(async move {
                            listener.serve(SocketTransport::new(stream), token).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            router,
            storage,
            shutdown,
        }
    }

    /// Connect, authenticate with PLAIN and bind `resource`.
    pub async fn login(&self, username: &str, resource: &str) -> TestClient {
        let mut client = TestClient::connect(self.addr).await;
        client.authenticate(username, PASSWORD).await;
        let bound = client.bind(resource).await;
        assert!(bound.contains(&format!("<jid>{username}@{DOMAIN}/{resource}</jid>")), "{bound}");
        client.clear_buffer();
        client
    }

    /// Wait until the stream bound at `username/resource` announced a
    /// presence.
    pub async fn wait_for_presence(&self, username: &str, resource: &str) {
        let registry = Arc::clone(self.router.registry());
        wait_until(|| {
            registry
                .stream(username, resource)
                .is_some_and(|s| s.presence().is_some())
        })
        .await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Raw XML client over TCP.
pub struct TestClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect to test server");
        Self {
            stream,
            buffer: Vec::new(),
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read until `pattern` shows up in everything received so far.
    pub async fn read_until(&mut self, pattern: &str) -> String {
        let result = timeout(DEFAULT_TIMEOUT, async {
            loop {
                let data = String::from_utf8_lossy(&self.buffer).to_string();
                if data.contains(pattern) {
                    return data;
                }
                let mut buf = [0u8; 4096];
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    panic!("connection closed while waiting for {pattern:?}; received: {data}");
                }
                self.buffer.extend_from_slice(&buf[..n]);
            }
        })
        .await;
        match result {
            Ok(data) => data,
            Err(_) => panic!(
                "timed out waiting for {pattern:?}; received: {}",
                String::from_utf8_lossy(&self.buffer)
            ),
        }
    }

    /// Everything received within the quiet period.
    pub async fn drain(&mut self) -> String {
        let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
        loop {
            let mut buf = [0u8; 4096];
            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => self.buffer.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        String::from_utf8_lossy(&self.buffer).to_string()
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub async fn open_stream(&mut self) -> String {
        self.send(&format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
             to='{DOMAIN}' version='1.0'>"
        ))
        .await;
        self.read_until("</stream:features>").await
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) {
        self.open_stream().await;
        let payload = BASE64_STANDARD.encode(format!("\0{username}\0{password}"));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{payload}</auth>"
        ))
        .await;
        self.read_until("<success").await;
        self.clear_buffer();
    }

    /// Restart the stream and bind `resource`; returns the bind result.
    pub async fn bind(&mut self, resource: &str) -> String {
        let features = self.open_stream().await;
        assert!(features.contains("urn:ietf:params:xml:ns:xmpp-bind"), "{features}");
        self.clear_buffer();
        self.send(&format!(
            "<iq type='set' id='bind_1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{resource}</resource></bind>\
             </iq>"
        ))
        .await;
        self.read_until("</iq>").await
    }
}
