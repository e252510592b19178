//! # Wire Protocol Types
//!
//! JSON shapes exchanged with agents and persisted in the outbox. These
//! are plain structs (not a tagged enum like the teacher's `WsMessage`)
//! because the agent wire format is a loosely-typed `{type, data,
//! requestId?}` envelope, not a closed set of Rust variants — the
//! envelope's `data` is whatever the [`crate::codec`] module produced.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request/poke/broadcast envelope sent to an agent or admin.
#[derive(Debug, Serialize, Clone)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
    pub request_id: Option<String>,
}

impl OutboundFrame {
    pub fn request(action: &str, data: Value) -> Self {
        Self {
            kind: action.to_string(),
            data: Some(data),
            request_id: None,
        }
    }

    pub fn request_with_id(action: &str, data: Value, request_id: String) -> Self {
        Self {
            kind: action.to_string(),
            data: Some(data),
            request_id: Some(request_id),
        }
    }

    pub fn poke() -> Self {
        Self {
            kind: "call".to_string(),
            data: None,
            request_id: None,
        }
    }
}

/// The envelope wrapping any agent-bound frame when the node's secret is
/// non-empty: `{encrypted:true, data:<base64>, timestamp:<ms>}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    pub data: String,
    pub timestamp: i64,
}

/// A response frame the agent sends back for a `SendAndWait` correlation.
#[derive(Debug, Deserialize, Clone)]
pub struct ResponseFrame {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
}

/// The value delivered to a `SendAndWait` caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub kind: String,
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
}

impl From<ResponseFrame> for Response {
    fn from(frame: ResponseFrame) -> Self {
        Self {
            kind: frame.kind,
            success: frame.success,
            message: frame.message,
            data: frame.data,
        }
    }
}

/// Flow report posted by an agent to `/flow/upload`:
/// `{"n": "<forwardID>_<userID>_<userTunnelID>", "u": <up-bytes>, "d": <down-bytes>}`.
#[derive(Debug, Deserialize, Clone)]
pub struct FlowReport {
    pub n: String,
    #[serde(default)]
    pub u: i64,
    #[serde(default)]
    pub d: i64,
}

/// The sentinel name the control plane uses to self-report and that must
/// never be attributed to a real forward.
pub const WEB_API_SENTINEL: &str = "web_api";

/// One entry in an agent's `/flow/config` resource catalogue.
#[derive(Debug, Deserialize, Clone)]
pub struct ConfigItem {
    pub name: String,
}

/// The full catalogue an agent reports on (re)connect, used for the
/// resync orphan sweep.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GostConfig {
    #[serde(default)]
    pub services: Vec<ConfigItem>,
    #[serde(default)]
    pub chains: Vec<ConfigItem>,
    #[serde(default)]
    pub limiters: Vec<ConfigItem>,
}

/// The opaque payload stored in an outbox row: `{nodeID, action, data}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboxMessage {
    #[serde(rename = "node_id")]
    pub node_id: i64,
    pub action: String,
    pub data: Value,
}
