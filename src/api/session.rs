//! `POST /api/v1/auth/login` — the one endpoint reachable without a
//! bearer token. Verifies the password hash and issues the JWT every
//! other route expects (SPEC_FULL §1, §6).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::ok;
use crate::auth;
use crate::error::{lookup_error, AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user: String,
    pub pwd: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user = state
        .store
        .get_user_by_username(&req.user)
        .await
        .map_err(|e| lookup_error(e, "用户"))?;

    if user.status != 1 {
        return Err(AppError::Forbidden);
    }

    let matches = bcrypt::verify(&req.pwd, &user.pwd).unwrap_or(false);
    if !matches {
        return Err(AppError::Invalid("用户名或密码错误".to_string()));
    }

    let token = auth::sign(&state.config.jwt_secret, user.id, user.role_id, state.config.jwt_ttl)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(ok(token))
}
