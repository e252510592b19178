//! # Tunnel Control Plane
//!
//! The multi-tenant control plane for a fleet of `gost`-speaking relay
//! agents. It owns the tenant/tunnel/forward data model, drives each
//! agent's configuration over a WebSocket hub, durably replays the
//! commands that drive it via an outbox, and accounts flow against
//! tenant quotas.
//!
//! ## Architecture
//!
//! ```text
//! Admin/Tenant UI ──HTTP/JSON──► api        ┐
//! Agent          ──WebSocket───► hub        ├──► store (SQLite)
//! Agent          ──HTTP────────► flow_http  ┘
//!
//! reconciler / flow_engine / scheduler / outbox_pump drive `hub` from `store`
//! ```
//!
//! ## Modules
//!
//! - [`config`]      — environment configuration
//! - [`store`]       — SQLite-backed data model
//! - [`hub`]         — agent/admin WebSocket connection registry and dispatch
//! - [`codec`]       — pure agent command payload construction
//! - [`reconciler`]  — entity mutation → outbox emission
//! - [`flow_engine`] — flow accounting and quota enforcement
//! - [`outbox_pump`] — at-least-once outbox delivery
//! - [`scheduler`]   — hourly/daily periodic jobs
//! - [`api`]         — `/api/v1` admin/tenant JSON API
//! - [`ws`]          — agent/admin WebSocket upgrade handler
//! - [`flow_http`]   — agent flow-reporting HTTP endpoints

mod api;
mod auth;
mod codec;
mod config;
mod crypto;
mod error;
mod flow_engine;
mod flow_http;
mod hub;
mod outbox_pump;
mod protocol;
mod reconciler;
mod scheduler;
mod state;
mod store;
mod ws;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::hub::Hub;
use crate::state::AppState;
use crate::store::Store;

/// Server entry point.
///
/// Loads configuration, opens the store, spawns the outbox pump and
/// periodic scheduler, and serves the agent and admin/tenant surfaces
/// on a single listener.
#[tokio::main]
async fn main() {
    // Initialize structured logging with env-filter support.
    // Default log level is `info` for this crate.
    // Override with the `RUST_LOG` environment variable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_control_plane=info".into()),
        )
        .init();

    let config = Config::from_env();

    let store = Store::connect(&config.db_path)
        .await
        .expect("failed to open store");
    let hub = Hub::new();
    let state = AppState::new(store.clone(), hub.clone(), config.clone());

    tokio::spawn(outbox_pump::run(
        store.clone(),
        hub.clone(),
        config.outbox_interval,
        config.outbox_retry_delay,
    ));
    tokio::spawn(scheduler::run(store.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route(&config.ws_path, get(ws::handler))
        .route("/ws", get(ws::handler))
        .route("/flow/upload", post(flow_http::upload))
        .route("/flow/config", post(flow_http::config))
        .route("/flow/test", get(flow_http::test))
        .nest("/api/v1", api::router())
        .layer(cors)
        .with_state(state);

    let addr = config.bind_addr();
    info!("tunnel control plane listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));
    axum::serve(listener, app).await.unwrap();
}
