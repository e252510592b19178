//! Core database models — typed mirrors of the tables created in
//! `migrations/0001_init.sql`. Field names match the spec's §3 data model.

use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    #[sqlx(rename = "user")]
    pub username: String,
    pub pwd: String,
    pub role_id: i64,
    pub exp_time: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub flow_reset_time: i64,
    pub num: i64,
    pub created_time: i64,
    pub updated_time: Option<i64>,
    pub status: i64,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role_id == 0
    }

    /// Flow quota in bytes (§4.6: gigabytes × 1_073_741_824).
    pub fn flow_limit_bytes(&self) -> i64 {
        self.flow * 1_073_741_824
    }

    pub fn flow_used_bytes(&self) -> i64 {
        self.in_flow + self.out_flow
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.exp_time != 0 && self.exp_time <= now_ms
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub secret: String,
    pub ip: Option<String>,
    pub server_ip: String,
    pub port_sta: i64,
    pub port_end: i64,
    pub version: Option<String>,
    pub http: i64,
    pub tls: i64,
    pub socks: i64,
    pub created_time: i64,
    pub updated_time: Option<i64>,
    pub status: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    pub traffic_ratio: f64,
    pub in_node_id: i64,
    pub in_ip: String,
    pub out_node_id: Option<i64>,
    pub out_ip: String,
    #[sqlx(rename = "type")]
    pub tunnel_type: i64,
    pub protocol: String,
    pub flow: i64,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: Option<String>,
    pub created_time: i64,
    pub updated_time: i64,
    pub status: i64,
}

impl Tunnel {
    pub fn is_relay(&self) -> bool {
        self.tunnel_type == 2
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SpeedLimit {
    pub id: i64,
    pub name: String,
    pub speed: i64,
    pub tunnel_id: i64,
    pub tunnel_name: String,
    pub created_time: i64,
    pub updated_time: Option<i64>,
    pub status: i64,
}

impl SpeedLimit {
    pub fn is_active(&self) -> bool {
        self.status == 1
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub speed_id: Option<i64>,
    pub num: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub flow_reset_time: i64,
    pub exp_time: i64,
    pub status: i64,
}

impl UserTunnel {
    pub fn flow_limit_bytes(&self) -> i64 {
        self.flow * 1_073_741_824
    }

    pub fn flow_used_bytes(&self) -> i64 {
        self.in_flow + self.out_flow
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.exp_time != 0 && self.exp_time <= now_ms
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub name: String,
    pub tunnel_id: i64,
    pub in_port: i64,
    pub out_port: Option<i64>,
    pub remote_addr: String,
    pub strategy: String,
    pub interface_name: Option<String>,
    pub in_flow: i64,
    pub out_flow: i64,
    pub created_time: i64,
    pub updated_time: i64,
    pub status: i64,
    pub inx: i64,
    pub lifecycle: String,
}

/// A forward joined with the fields of its tunnel needed to resolve
/// in/out node ids and tunnel type without a second round trip.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ForwardWithTunnel {
    #[sqlx(flatten)]
    pub forward: Forward,
    pub in_node_id: i64,
    pub out_node_id: Option<i64>,
    #[sqlx(rename = "tunnel_type")]
    pub tunnel_type: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StatisticsFlow {
    pub id: i64,
    pub user_id: i64,
    pub flow: i64,
    pub total_flow: i64,
    pub time: String,
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OutboxItem {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub retry_count: i64,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
