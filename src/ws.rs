//! # Agent/Admin WebSocket Endpoint
//!
//! The upgrade handler for `WS_PATH` (default `/system-info`, legacy
//! alias `/ws`). Mirrors the teacher's `handlers.rs` connection-lifecycle
//! shape — split sink/stream, an outbound task draining an `mpsc`
//! channel, an inbound read loop, cleanup on disconnect — generalized
//! from one untyped relay connection into the Hub's two connection
//! kinds (§4.3).

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth;
use crate::reconciler;
use crate::state::AppState;
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub secret: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<i64>,
    pub version: Option<String>,
    pub http: Option<i64>,
    pub tls: Option<i64>,
    pub socks: Option<i64>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if q.kind == Some(0) {
        return ws.on_upgrade(move |socket| handle_admin(socket, state, q.secret));
    }

    let Some(secret) = q.secret.clone() else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(node) = state.store.get_node_by_secret(&secret).await else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_agent(socket, state, node.id, secret, q))
        .into_response()
}

async fn handle_agent(socket: WebSocket, state: AppState, node_id: i64, secret: String, q: WsQuery) {
    info!(node_id, "agent connected");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.hub.register(node_id, secret.clone(), tx);
    if let Err(err) = state
        .store
        .update_node_status(node_id, 1, q.version.as_deref(), q.http, q.tls, q.socks)
        .await
    {
        warn!(node_id, %err, "failed to record node online status");
    }
    state.hub.broadcast_status(node_id, 1);

    // Resync runs as a detached background task rather than inline on
    // the connect path, so a slow reconcile never holds up the upgrade
    // or blocks the inbound read loop (§9: the Hub never invokes the
    // reconciler synchronously).
    let resync_store = state.store.clone();
    tokio::spawn(async move {
        if let Err(err) = reconciler::resync_node(&resync_store, node_id).await {
            warn!(node_id, %err, "resync failed");
        }
    });

    let outbound = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => state.hub.handle_inbound(node_id, &secret, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(node_id, "agent disconnected");
    outbound.abort();
    state.hub.unregister(node_id);
    if let Err(err) = state.store.update_node_status(node_id, 0, None, None, None, None).await {
        warn!(node_id, %err, "failed to record node offline status");
    }
    state.hub.broadcast_status(node_id, 0);
}

/// Admits an admin/UI observer. A present `secret` is validated as a
/// bearer JWT; an absent one falls back to the unauthenticated legacy
/// observer mode named in §4.3 (gated entirely by network placement in
/// a real deployment — this binary does not additionally restrict it).
async fn handle_admin(socket: WebSocket, state: AppState, secret: Option<String>) {
    if let Some(token) = secret.as_deref() {
        if auth::parse(&state.config.jwt_secret, token).is_err() {
            warn!("admin websocket rejected: invalid token");
            let _ = socket.close().await;
            return;
        }
    }

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let admin_id = state.hub.register_admin(tx);

    let outbound = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    outbound.abort();
    state.hub.unregister_admin(admin_id);
}

/// Shared helper for the `/flow/*` HTTP endpoints: resolves the posting
/// node by its secret, used both here and by [`crate::flow_http`].
pub async fn resolve_node_secret(store: &Store, secret: &str) -> Option<i64> {
    store.get_node_by_secret(secret).await.ok().map(|n| n.id)
}
