//! User endpoints, admin-only (tenants authenticate via `/auth/login`
//! but cannot manage the user table themselves).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppError, AppResult};
use crate::reconciler;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub user: String,
    pub pwd: String,
    #[serde(default = "default_role")]
    pub role_id: i64,
    #[serde(default)]
    pub exp_time: i64,
    #[serde(default)]
    pub flow: i64,
    #[serde(default)]
    pub flow_reset_time: i64,
    #[serde(default)]
    pub num: i64,
}

fn default_role() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub id: i64,
    pub pwd: Option<String>,
    pub role_id: i64,
    pub exp_time: i64,
    pub flow: i64,
    pub flow_reset_time: i64,
    pub num: i64,
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub id: i64,
}

pub async fn list(principal: Principal, State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let users = state.store.list_users().await?;
    Ok(ok(users))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let hash = bcrypt::hash(&req.pwd, bcrypt::DEFAULT_COST).map_err(|e| AppError::Internal(e.to_string()))?;
    let id = state
        .store
        .insert_user(&req.user, &hash, req.role_id, req.exp_time, req.flow, req.flow_reset_time, req.num)
        .await?;
    Ok(ok(id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateUserRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let mut user = state.store.get_user_by_id(req.id).await.map_err(|e| lookup_error(e, "用户"))?;
    if let Some(pwd) = req.pwd.filter(|p| !p.is_empty()) {
        user.pwd = bcrypt::hash(&pwd, bcrypt::DEFAULT_COST).map_err(|e| AppError::Internal(e.to_string()))?;
    }
    user.role_id = req.role_id;
    user.exp_time = req.exp_time;
    user.flow = req.flow;
    user.flow_reset_time = req.flow_reset_time;
    user.num = req.num;
    let was_active = user.status == 1;
    user.status = req.status;
    state.store.update_user(&user).await?;

    if was_active && req.status != 1 {
        crate::flow_engine::pause_all_user_forwards(&state.store, user.id).await?;
    }

    Ok(ok_msg("用户已更新"))
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<DeleteUserRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    reconciler::delete_user_cascade(&state.store, req.id).await?;
    Ok(ok_msg("用户已删除"))
}
