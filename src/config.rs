//! # Environment Configuration
//!
//! Every name here is part of the external contract: operators set these
//! in the environment (or a `.env` file loaded via `dotenvy`) to configure
//! a deployment. Defaults match what a single-node development setup
//! needs so the binary runs out of the box.

use std::time::Duration;

/// Resolved configuration for one run of the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (`DB_PATH`, default `tunnel.db`).
    pub db_path: String,

    /// Address the HTTP/WebSocket server binds to (`HTTP_ADDR`, default `:6365`).
    pub http_addr: String,

    /// Path the agent WebSocket endpoint is mounted at (`WS_PATH`, default `/system-info`).
    pub ws_path: String,

    /// How often the outbox pump ticks (`OUTBOX_INTERVAL`, default 500ms).
    pub outbox_interval: Duration,

    /// Delay before a failed outbox item becomes claimable again (`OUTBOX_RETRY_DELAY`, default 5s).
    pub outbox_retry_delay: Duration,

    /// HMAC secret used to sign and verify admin/tenant bearer JWTs (`JWT_SECRET`).
    pub jwt_secret: Vec<u8>,

    /// Lifetime of a freshly-issued JWT (`JWT_TTL`, default 24h).
    pub jwt_ttl: Duration,
}

impl Config {
    /// Loads configuration from the process environment, applying defaults
    /// for anything unset. Never panics on a missing variable; only a
    /// malformed value for a variable that *is* set is treated as a fatal
    /// misconfiguration.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            db_path: env_or("DB_PATH", "tunnel.db"),
            http_addr: env_or("HTTP_ADDR", ":6365"),
            ws_path: env_or("WS_PATH", "/system-info"),
            outbox_interval: Duration::from_millis(env_parse_or("OUTBOX_INTERVAL", 500)),
            outbox_retry_delay: Duration::from_millis(env_parse_or("OUTBOX_RETRY_DELAY", 5_000)),
            jwt_secret: env_or("JWT_SECRET", "dev-insecure-secret-change-me").into_bytes(),
            jwt_ttl: Duration::from_secs(env_parse_or("JWT_TTL", 86_400)),
        }
    }

    /// The address normalized for `tokio::net::TcpListener::bind`. A bare
    /// `:PORT` form (as used by the original Go service) is expanded to
    /// `0.0.0.0:PORT`.
    pub fn bind_addr(&self) -> String {
        if let Some(port) = self.http_addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.http_addr.clone()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
