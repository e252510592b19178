//! UserTunnel endpoints — the per-`(user, tunnel)` grant that gates
//! non-admin forward creation (§3 invariant 3). Admin-only.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppResult};
use crate::reconciler;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListUserTunnelQuery {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserTunnelRequest {
    pub user_id: i64,
    pub tunnel_id: i64,
    pub speed_id: Option<i64>,
    pub num: i64,
    pub flow: i64,
    #[serde(default)]
    pub exp_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserTunnelRequest {
    pub id: i64,
    pub speed_id: Option<i64>,
    pub num: i64,
    pub flow: i64,
    pub exp_time: i64,
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserTunnelRequest {
    pub id: i64,
}

pub async fn list(
    principal: Principal,
    State(state): State<AppState>,
    Query(q): Query<ListUserTunnelQuery>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let grants = state.store.list_user_tunnels_by_user(q.user_id).await?;
    Ok(ok(grants))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateUserTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    state.store.get_user_by_id(req.user_id).await.map_err(|e| lookup_error(e, "用户"))?;
    state.store.get_tunnel_by_id(req.tunnel_id).await.map_err(|e| lookup_error(e, "隧道"))?;

    let id = state
        .store
        .insert_user_tunnel(req.user_id, req.tunnel_id, req.speed_id, req.num, req.flow, req.exp_time)
        .await?;
    Ok(ok(id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateUserTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let mut ut = state.store.get_user_tunnel_by_id(req.id).await.map_err(|e| lookup_error(e, "授权"))?;
    ut.speed_id = req.speed_id;
    ut.num = req.num;
    ut.flow = req.flow;
    ut.exp_time = req.exp_time;
    let was_active = ut.status == 1;
    ut.status = req.status;
    state.store.update_user_tunnel(&ut).await?;

    if was_active && req.status != 1 {
        crate::flow_engine::pause_forwards_for_tunnel(&state.store, ut.user_id, ut.tunnel_id).await?;
    }

    Ok(ok_msg("授权已更新"))
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<DeleteUserTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    reconciler::delete_user_tunnel_cascade(&state.store, req.id).await?;
    Ok(ok_msg("授权已删除"))
}
