//! XMPP over WebSocket (RFC 7395)
//!
//! An axum endpoint upgrades requests on the listener's `url_path` and hands
//! each socket to the regular client stream machinery.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span};

use super::C2sListener;
use crate::transport::WebSocketTransport;
use crate::XmppError;

#[derive(Clone)]
struct WsState {
    listener: Arc<C2sListener>,
    shutdown: CancellationToken,
}

pub(super) async fn serve(listener: Arc<C2sListener>, shutdown: CancellationToken) -> Result<(), XmppError> {
    let config = listener.config().clone();
    let state = WsState {
        listener,
        shutdown: shutdown.clone(),
    };
    let app = axum::Router::new()
        .route(&config.url_path, get(upgrade))
        .with_state(state);

    let tcp = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!(
        listener = %config.id,
        addr = %tcp.local_addr()?,
        path = %config.url_path,
        "XMPP WebSocket server listening"
    );
    axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<WsState>,
) -> Response {
    debug!(peer = %peer_addr, "XMPP WebSocket connection request");
    ws.protocols(["xmpp"]).on_upgrade(move |socket| async move {
        let span = info_span!(
            "c2s",
            listener = %state.listener.config().id,
            peer = %peer_addr,
            jid = tracing::field::Empty,
        );
        state
            .listener
            .spawn(WebSocketTransport::new(socket), state.shutdown.child_token(), span);
    })
}
