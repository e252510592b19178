//! Node admin endpoints. Nodes are admin-only in every direction — a
//! node's `secret` both authenticates its agent WS connection and
//! derives its frame encryption key (§4.3, §9), so only an admin may
//! mint or rotate one.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub ip: Option<String>,
    pub server_ip: String,
    pub port_sta: i64,
    pub port_end: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    pub id: i64,
    pub name: String,
    pub ip: Option<String>,
    pub server_ip: String,
    pub port_sta: i64,
    pub port_end: i64,
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteNodeRequest {
    pub id: i64,
}

pub async fn list(principal: Principal, State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let nodes = state.store.list_nodes().await.map_err(AppError::from)?;
    Ok(ok(nodes))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateNodeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    if req.port_sta <= 0 || req.port_end < req.port_sta {
        return Err(AppError::Invalid("端口范围非法".to_string()));
    }
    let secret = Uuid::new_v4().simple().to_string();
    let id = state
        .store
        .insert_node(&req.name, &secret, req.ip.as_deref(), &req.server_ip, req.port_sta, req.port_end)
        .await
        .map_err(AppError::from)?;
    Ok(ok(id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateNodeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    if req.port_sta <= 0 || req.port_end < req.port_sta {
        return Err(AppError::Invalid("端口范围非法".to_string()));
    }
    let mut node = state.store.get_node_by_id(req.id).await.map_err(|e| lookup_error(e, "节点"))?;
    node.name = req.name;
    node.ip = req.ip;
    node.server_ip = req.server_ip;
    node.port_sta = req.port_sta;
    node.port_end = req.port_end;
    node.status = req.status;
    state.store.update_node(&node).await.map_err(AppError::from)?;

    state.store.update_tunnels_in_ip(node.id, &node.server_ip).await.map_err(AppError::from)?;
    state.store.update_tunnels_out_ip(node.id, &node.server_ip).await.map_err(AppError::from)?;

    Ok(ok_msg("节点已更新"))
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<DeleteNodeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let in_use = state.store.count_tunnels_by_node(req.id).await.map_err(AppError::from)?;
    if in_use > 0 {
        return Err(AppError::Conflict("节点仍被隧道引用".to_string()));
    }
    state.store.delete_node(req.id).await.map_err(AppError::from)?;
    Ok(ok_msg("节点已删除"))
}
