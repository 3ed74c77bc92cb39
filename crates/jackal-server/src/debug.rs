//! Diagnostic HTTP listener.
//!
//! - `GET /debug/health`: liveness probe
//! - `GET /debug/streams`: bound client streams known to this node
//! - `GET /debug/cluster`: cluster members

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use jackal_xmpp::cluster::ClusterMember;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StreamInfo {
    pub jid: String,
    /// Owning cluster node; absent for streams bound on this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

fn router(xmpp: Arc<jackal_xmpp::Router>) -> Router {
    Router::new()
        .route("/debug/health", get(health))
        .route("/debug/streams", get(streams))
        .route("/debug/cluster", get(cluster))
        .with_state(xmpp)
}

pub async fn serve(port: u16, xmpp: Arc<jackal_xmpp::Router>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "Debug listener started");
    axum::serve(listener, router(xmpp))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn streams(State(xmpp): State<Arc<jackal_xmpp::Router>>) -> Json<Vec<StreamInfo>> {
    let mut streams: Vec<StreamInfo> = xmpp
        .registry()
        .all_streams()
        .into_iter()
        .map(|s| StreamInfo {
            jid: s.jid().to_string(),
            node: s.cluster_node().map(str::to_string),
        })
        .collect();
    streams.sort_by(|a, b| a.jid.cmp(&b.jid));
    Json(streams)
}

async fn cluster(State(xmpp): State<Arc<jackal_xmpp::Router>>) -> Json<Vec<ClusterMember>> {
    let members = xmpp.cluster().map(|c| c.members()).unwrap_or_default();
    Json(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackal_xmpp::{Hosts, Jid, LocalStream, MemoryStorage, StreamRegistry};

    fn xmpp_router() -> Arc<jackal_xmpp::Router> {
        let hosts = Arc::new(Hosts::plain(["jackal.im"]).unwrap());
        Arc::new(jackal_xmpp::Router::new(
            hosts,
            Arc::new(StreamRegistry::new()),
            Arc::new(MemoryStorage::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await, "ok");
    }

    #[tokio::test]
    async fn test_streams_lists_bound_streams() {
        let xmpp = xmpp_router();
        let Json(empty) = streams(State(Arc::clone(&xmpp))).await;
        assert!(empty.is_empty());

        let jid = Jid::parse("ortuman@jackal.im/yard").unwrap();
        let (stream, _commands) = LocalStream::new("s1", jid, 8);
        assert!(xmpp.registry().bind(Arc::new(stream)));

        let Json(listed) = streams(State(xmpp)).await;
        assert_eq!(
            listed,
            vec![StreamInfo {
                jid: "ortuman@jackal.im/yard".to_string(),
                node: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_cluster_without_overlay_is_empty() {
        let Json(members) = cluster(State(xmpp_router())).await;
        assert!(members.is_empty());
    }
}
