//! # Agent Hub
//!
//! The in-memory registry of connected node agents and admin/UI
//! observers, plus request/response correlation for the synchronous
//! command path (§4.3). One [`Hub`] is shared across the whole process
//! via [`crate::state::AppState`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::crypto;
use crate::protocol::{OutboundFrame, Response, ResponseFrame};

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("node not connected")]
    NotConnected,
    #[error("response timeout")]
    Timeout,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// The outbound half of a registered connection: a channel feeding the
/// websocket write task, plus the shared secret used to encrypt frames
/// addressed to it (empty for admin connections, which are never
/// encrypted).
struct Conn {
    tx: mpsc::UnboundedSender<String>,
    secret: String,
}

/// Registry of live node/admin connections and in-flight request
/// correlation state. Cloning is cheap — it's an `Arc` handle.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    conns: DashMap<i64, Conn>,
    admins: DashMap<u64, mpsc::UnboundedSender<String>>,
    pending: DashMap<String, oneshot::Sender<Response>>,
    next_admin_id: std::sync::atomic::AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                conns: DashMap::new(),
                admins: DashMap::new(),
                pending: DashMap::new(),
                next_admin_id: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// Registers a node connection, replacing (and implicitly dropping,
    /// closing its writer) any prior connection for the same node.
    pub fn register(&self, node_id: i64, secret: String, tx: mpsc::UnboundedSender<String>) {
        self.inner.conns.insert(node_id, Conn { tx, secret });
    }

    pub fn unregister(&self, node_id: i64) {
        self.inner.conns.remove(&node_id);
    }

    pub fn is_connected(&self, node_id: i64) -> bool {
        self.inner.conns.contains_key(&node_id)
    }

    /// Registers an admin/UI observer connection and returns a handle
    /// used to unregister it again on disconnect.
    pub fn register_admin(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self
            .inner
            .next_admin_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner.admins.insert(id, tx);
        id
    }

    pub fn unregister_admin(&self, id: u64) {
        self.inner.admins.remove(&id);
    }

    /// Fire-and-forget send to a node; the caller does not wait for, or
    /// even expect, a response.
    pub fn send(&self, node_id: i64, action: &str, data: Value) -> Result<(), HubError> {
        let frame = OutboundFrame::request(action, data);
        self.dispatch(node_id, &frame)
    }

    /// Pokes a node to report its next `call` frame immediately, with no
    /// data payload and no response correlation.
    pub fn poke(&self, node_id: i64) -> Result<(), HubError> {
        self.dispatch(node_id, &OutboundFrame::poke())
    }

    /// Sends a command and waits up to `timeout` for the node to reply
    /// with a matching `requestId`.
    pub async fn send_and_wait(
        &self,
        node_id: i64,
        action: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Response, HubError> {
        let request_id = random_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);

        let frame = OutboundFrame::request_with_id(action, data, request_id.clone());
        if let Err(err) = self.dispatch(node_id, &frame) {
            self.inner.pending.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(HubError::SendFailed("responder dropped".into())),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                Err(HubError::Timeout)
            }
        }
    }

    fn dispatch(&self, node_id: i64, frame: &OutboundFrame) -> Result<(), HubError> {
        let Some(conn) = self.inner.conns.get(&node_id) else {
            return Err(HubError::NotConnected);
        };

        let payload = serde_json::to_string(frame).map_err(|e| HubError::SendFailed(e.to_string()))?;
        let wire = if conn.secret.is_empty() {
            payload
        } else {
            match crypto::encrypt(&conn.secret, payload.as_bytes()) {
                Ok(enc) => {
                    let wrapper = json!({
                        "encrypted": true,
                        "data": enc,
                        "timestamp": crate::store::now_millis(),
                    });
                    wrapper.to_string()
                }
                Err(_) => payload,
            }
        };

        conn.tx
            .send(wire)
            .map_err(|e| HubError::SendFailed(e.to_string()))
    }

    /// Classifies and routes a raw inbound frame from node `node_id`:
    /// decrypts if wrapped, recognizes the periodic system-info report
    /// (rebroadcasting it to admins and poking the agent for the next
    /// one), and otherwise treats it as a response correlated by
    /// `requestId`.
    pub fn handle_inbound(&self, node_id: i64, secret: &str, raw: &str) {
        let plain = unwrap_frame(secret, raw);

        let Ok(value) = serde_json::from_str::<Value>(&plain) else {
            warn!(node_id, "discarding malformed inbound frame");
            return;
        };

        if let Some(obj) = value.as_object() {
            if obj.contains_key("memory_usage") {
                self.broadcast_info(node_id, &value);
                let _ = self.poke(node_id);
                return;
            }
        }

        let Ok(resp) = serde_json::from_value::<ResponseFrame>(value) else {
            debug!(node_id, "inbound frame matched neither report nor response shape");
            return;
        };
        if resp.request_id.is_empty() {
            return;
        }

        if let Some((_, tx)) = self.inner.pending.remove(&resp.request_id.clone()) {
            let _ = tx.send(resp.into());
        }
    }

    pub fn broadcast_status(&self, node_id: i64, status: i64) {
        self.broadcast(json!({"id": node_id, "type": "status", "data": status}));
    }

    fn broadcast_info(&self, node_id: i64, info: &Value) {
        self.broadcast(json!({"id": node_id, "type": "info", "data": info}));
    }

    fn broadcast(&self, payload: Value) {
        let text = payload.to_string();
        self.inner.admins.retain(|_, tx| tx.send(text.clone()).is_ok());
    }
}

fn unwrap_frame(secret: &str, raw: &str) -> String {
    let Ok(wrapper) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    let encrypted = wrapper.get("encrypted").and_then(Value::as_bool).unwrap_or(false);
    let Some(data) = wrapper.get("data").and_then(Value::as_str) else {
        return raw.to_string();
    };
    if !encrypted || secret.is_empty() {
        return raw.to_string();
    }
    match crypto::decrypt(secret, data) {
        Ok(plain) => String::from_utf8_lossy(&plain).into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn random_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_unknown_node_fails() {
        let hub = Hub::new();
        assert!(matches!(
            hub.send(42, "AddService", json!({})),
            Err(HubError::NotConnected)
        ));
    }

    #[test]
    fn registered_node_receives_plaintext_frame_without_secret() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(1, String::new(), tx);
        hub.send(1, "AddService", json!({"name": "svc"})).unwrap();
        let raw = rx.try_recv().unwrap();
        assert!(raw.contains("\"type\":\"AddService\""));
        assert!(raw.contains("\"name\":\"svc\""));
    }

    #[test]
    fn registered_node_receives_encrypted_frame_with_secret() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(1, "node-secret".to_string(), tx);
        hub.send(1, "AddService", json!({"name": "svc"})).unwrap();
        let raw = rx.try_recv().unwrap();
        assert!(raw.contains("\"encrypted\":true"));
    }

    #[test]
    fn re_registering_a_node_replaces_the_old_connection() {
        let hub = Hub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.register(1, String::new(), tx1);
        hub.register(1, String::new(), tx2);
        hub.send(1, "call", json!(null)).unwrap();
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_and_wait_resolves_on_correlated_response() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(7, String::new(), tx);

        let hub2 = hub.clone();
        let waiter = tokio::spawn(async move {
            hub2.send_and_wait(7, "AddService", json!({}), Duration::from_secs(1))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&sent).unwrap();
        let request_id = value["requestId"].as_str().unwrap().to_string();

        hub.handle_inbound(
            7,
            "",
            &json!({"type": "AddService", "success": true, "message": "ok", "requestId": request_id}).to_string(),
        );

        let resp = waiter.await.unwrap().unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, "ok");
    }

    #[tokio::test]
    async fn send_and_wait_times_out_when_no_response_arrives() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register(9, String::new(), tx);
        let result = hub
            .send_and_wait(9, "AddService", json!({}), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(HubError::Timeout)));
    }

    #[test]
    fn memory_usage_report_triggers_broadcast_and_poke() {
        let hub = Hub::new();
        let (node_tx, mut node_rx) = mpsc::unbounded_channel();
        hub.register(3, String::new(), node_tx);
        let admin_id = hub.register_admin(mpsc::unbounded_channel().0);
        hub.unregister_admin(admin_id);

        hub.handle_inbound(3, "", &json!({"memory_usage": 12.5}).to_string());
        let poked = node_rx.try_recv().unwrap();
        assert!(poked.contains("\"type\":\"call\""));
    }
}
