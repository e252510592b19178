//! # Admin/Tenant JSON API
//!
//! The `/api/v1` surface sketched as a black box in the distilled spec
//! and made concrete here (SPEC_FULL §6): node/tunnel/speed-limit/user/
//! user-tunnel/forward/statistics CRUD, all wrapped in the `{code,msg,data?}`
//! envelope and gated by a bearer JWT extracted by [`Principal`].

mod forward;
mod node;
mod session;
mod speed_limit;
mod statistics;
mod tunnel;
mod user;
mod user_tunnel;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth;
use crate::error::AppError;
use crate::state::AppState;

/// `{code:0, msg:"success", data}` — the success shape of §7's envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "code": 0, "msg": "success", "data": data }))
}

/// Same envelope with a bare string `data`, for mutation endpoints that
/// answer with a human-readable confirmation rather than a resource body.
pub fn ok_msg(data: impl Into<String>) -> Json<Value> {
    Json(json!({ "code": 0, "msg": "success", "data": data.into() }))
}

/// The principal resolved from `Authorization: Bearer <jwt>`, carrying
/// the claims named in §1/§6: `(user_id, role_id)`. `role_id == 0` is
/// admin.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: i64,
    pub role_id: i64,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role_id == 0
    }

    /// Admin, or the named owner — the authorization predicate repeated
    /// across update/delete/pause/resume in §4.5.
    pub fn owns_or_admin(&self, owner_user_id: i64) -> bool {
        self.is_admin() || self.user_id == owner_user_id
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        let token = header.strip_prefix("Bearer ").ok_or(AppError::Unauthorized)?;
        let claims = auth::parse(&state.config.jwt_secret, token).map_err(|_| AppError::Unauthorized)?;
        Ok(Principal {
            user_id: claims.user_id,
            role_id: claims.role_id,
        })
    }
}

/// Mounts every `/api/v1/...` route named in SPEC_FULL §6.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(session::login))
        .route("/node/list", get(node::list))
        .route("/node/create", post(node::create))
        .route("/node/update", put(node::update))
        .route("/node/delete", delete(node::remove))
        .route("/tunnel/list", get(tunnel::list))
        .route("/tunnel/create", post(tunnel::create))
        .route("/tunnel/update", put(tunnel::update))
        .route("/tunnel/delete", delete(tunnel::remove))
        .route("/speed-limit/list", get(speed_limit::list))
        .route("/speed-limit/create", post(speed_limit::create))
        .route("/speed-limit/update", put(speed_limit::update))
        .route("/speed-limit/delete", delete(speed_limit::remove))
        .route("/user/list", get(user::list))
        .route("/user/create", post(user::create))
        .route("/user/update", put(user::update))
        .route("/user/delete", delete(user::remove))
        .route("/user-tunnel/list", get(user_tunnel::list))
        .route("/user-tunnel/create", post(user_tunnel::create))
        .route("/user-tunnel/update", put(user_tunnel::update))
        .route("/user-tunnel/delete", delete(user_tunnel::remove))
        .route("/forward/list", get(forward::list))
        .route("/forward/create", post(forward::create))
        .route("/forward/update", put(forward::update))
        .route("/forward/delete", delete(forward::remove))
        .route("/forward/force-delete", delete(forward::force_remove))
        .route("/forward/pause", post(forward::pause))
        .route("/forward/resume", post(forward::resume))
        .route("/forward/order", put(forward::order))
        .route("/forward/diagnose", post(forward::diagnose))
        .route("/statistics/flow", get(statistics::flow))
}
