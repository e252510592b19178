//! SpeedLimit endpoints. Create/update drive the reconciler's
//! speed-limit state machine (§4.5): activating, moving, or re-rating a
//! limit always ends in an outbox emission plus a refresh of every
//! forward bound to it.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppResult};
use crate::reconciler;
use crate::state::AppState;
use crate::store::SpeedLimit;

#[derive(Debug, Deserialize)]
pub struct CreateSpeedLimitRequest {
    pub name: String,
    pub speed: i64,
    pub tunnel_id: i64,
    #[serde(default)]
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSpeedLimitRequest {
    pub id: i64,
    pub name: String,
    pub speed: i64,
    pub tunnel_id: i64,
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSpeedLimitRequest {
    pub id: i64,
}

pub async fn list(principal: Principal, State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let limits = state.store.list_speed_limits().await?;
    Ok(ok(limits))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateSpeedLimitRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let tunnel = state.store.get_tunnel_by_id(req.tunnel_id).await.map_err(|e| lookup_error(e, "隧道"))?;
    let id = state.store.insert_speed_limit(&req.name, req.speed, req.tunnel_id, &tunnel.name).await?;

    if req.status == 1 {
        let limit = state.store.get_speed_limit_by_id(id).await?;
        reconciler::activate_speed_limit(&state.store, &limit).await?;
        let mut limit = limit;
        limit.status = 1;
        state.store.update_speed_limit(&limit).await?;
    }

    Ok(ok(id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateSpeedLimitRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let before = state.store.get_speed_limit_by_id(req.id).await.map_err(|e| lookup_error(e, "限速规则"))?;
    let tunnel = state.store.get_tunnel_by_id(req.tunnel_id).await.map_err(|e| lookup_error(e, "隧道"))?;

    let mut limit: SpeedLimit = before.clone();
    limit.name = req.name;
    limit.speed = req.speed;
    limit.tunnel_id = req.tunnel_id;
    limit.tunnel_name = tunnel.name;
    limit.status = req.status;
    state.store.update_speed_limit(&limit).await?;

    apply_transition(&state, &before, &limit).await?;

    Ok(ok_msg("限速规则已更新"))
}

/// Dispatches the right reconciler transition for an (before, after)
/// pair, exactly as the state machine in §4.5 describes it.
async fn apply_transition(state: &AppState, before: &SpeedLimit, after: &SpeedLimit) -> AppResult<()> {
    let was_active = before.is_active();
    let is_active = after.is_active();

    if !was_active && is_active {
        reconciler::activate_speed_limit(&state.store, after).await?;
    } else if was_active && !is_active {
        reconciler::deactivate_speed_limit(&state.store, after, before.tunnel_id).await?;
    } else if was_active && is_active && before.tunnel_id != after.tunnel_id {
        reconciler::move_speed_limit(&state.store, after, before.tunnel_id).await?;
    } else if was_active && is_active && before.speed != after.speed {
        reconciler::update_speed_limit_rate(&state.store, after).await?;
    }
    Ok(())
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<DeleteSpeedLimitRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let limit = state.store.get_speed_limit_by_id(req.id).await.map_err(|e| lookup_error(e, "限速规则"))?;
    if limit.is_active() {
        reconciler::deactivate_speed_limit(&state.store, &limit, limit.tunnel_id).await?;
    }
    state.store.delete_speed_limit(req.id).await?;
    Ok(ok_msg("限速规则已删除"))
}
