//! # Agent Flow-Reporting Endpoints
//!
//! The three plain-HTTP routes an agent speaks instead of the WebSocket
//! hub: uploading traffic counters, announcing its resource catalogue
//! for the orphan sweep, and a liveness probe. Bodies may be
//! AES-GCM-wrapped the same way outbound frames are (§4.3) — a node
//! with a non-empty secret encrypts, one with an empty secret does not.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::warn;

use crate::crypto;
use crate::flow_engine;
use crate::protocol::{FlowReport, GostConfig};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SecretQuery {
    pub secret: Option<String>,
}

/// Unwraps the `{"encrypted":true,"data":"<base64>","timestamp":…}`
/// envelope a node with a non-empty secret sends (mirrors
/// [`crate::hub::unwrap_frame`]). A body that isn't that envelope — the
/// plaintext case, `secret` empty — passes through unchanged.
fn unwrap_body(secret: &str, body: &[u8]) -> Vec<u8> {
    let Ok(wrapper) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.to_vec();
    };
    let encrypted = wrapper.get("encrypted").and_then(serde_json::Value::as_bool).unwrap_or(false);
    let Some(data) = wrapper.get("data").and_then(serde_json::Value::as_str) else {
        return body.to_vec();
    };
    if !encrypted || secret.is_empty() {
        return body.to_vec();
    }
    match crypto::decrypt(secret, data) {
        Ok(plain) => plain,
        Err(_) => body.to_vec(),
    }
}

pub async fn upload(
    Query(q): Query<SecretQuery>,
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<&'static str, StatusCode> {
    let secret = q.secret.unwrap_or_default();
    let node_id = state.store.get_node_by_secret(&secret).await.map_err(|_| StatusCode::UNAUTHORIZED)?.id;
    let plain = unwrap_body(&secret, &body);

    let report: FlowReport = match serde_json::from_slice(&plain) {
        Ok(r) => r,
        Err(err) => {
            warn!(node_id, %err, "malformed flow report");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if let Err(err) = flow_engine::apply_report(&state.store, &report).await {
        warn!(node_id, %err, "failed to apply flow report");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok("ok")
}

pub async fn config(
    Query(q): Query<SecretQuery>,
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<&'static str, StatusCode> {
    let secret = q.secret.unwrap_or_default();
    let node_id = state.store.get_node_by_secret(&secret).await.map_err(|_| StatusCode::UNAUTHORIZED)?.id;
    let plain = unwrap_body(&secret, &body);

    let cfg: GostConfig = match serde_json::from_slice(&plain) {
        Ok(c) => c,
        Err(err) => {
            warn!(node_id, %err, "malformed flow config catalogue");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if let Err(err) = flow_engine::reconcile_orphans(&state.store, node_id, &cfg).await {
        warn!(node_id, %err, "orphan sweep failed");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok("ok")
}

pub async fn test() -> &'static str {
    "test"
}
