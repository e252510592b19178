//! Tunnel endpoints: admin-only mutate, readable by any authenticated
//! principal (tenants need the list to pick a tunnel when asking an
//! admin for a grant, or to inspect the tunnel backing their forwards).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppError, AppResult};
use crate::reconciler;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub name: String,
    #[serde(default = "default_ratio")]
    pub traffic_ratio: f64,
    pub in_node_id: i64,
    pub out_node_id: Option<i64>,
    #[serde(rename = "type")]
    pub tunnel_type: i64,
    pub protocol: String,
    #[serde(default)]
    pub flow: i64,
    #[serde(default = "default_listen")]
    pub tcp_listen_addr: String,
    #[serde(default = "default_listen")]
    pub udp_listen_addr: String,
    pub interface_name: Option<String>,
}

fn default_ratio() -> f64 {
    1.0
}

fn default_listen() -> String {
    "[::]".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateTunnelRequest {
    pub id: i64,
    pub name: String,
    pub traffic_ratio: f64,
    pub flow: i64,
    pub tcp_listen_addr: String,
    pub udp_listen_addr: String,
    pub interface_name: Option<String>,
    pub status: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteTunnelRequest {
    pub id: i64,
}

pub async fn list(_principal: Principal, State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let tunnels = state.store.list_tunnels().await.map_err(AppError::from)?;
    Ok(ok(tunnels))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;

    if req.tunnel_type == 2 && req.out_node_id.is_none() {
        return Err(AppError::Invalid("中转隧道必须指定出口节点".to_string()));
    }

    let in_node = state.store.get_node_by_id(req.in_node_id).await.map_err(|e| lookup_error(e, "入口节点"))?;
    let out_ip = if let Some(out_id) = req.out_node_id {
        let out_node = state.store.get_node_by_id(out_id).await.map_err(|e| lookup_error(e, "出口节点"))?;
        out_node.server_ip
    } else {
        String::new()
    };

    let id = state
        .store
        .insert_tunnel(
            &req.name,
            req.traffic_ratio,
            req.in_node_id,
            &in_node.server_ip,
            req.out_node_id,
            &out_ip,
            req.tunnel_type,
            &req.protocol,
            req.flow,
            &req.tcp_listen_addr,
            &req.udp_listen_addr,
            req.interface_name.as_deref(),
        )
        .await
        .map_err(AppError::from)?;
    Ok(ok(id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let mut tunnel = state.store.get_tunnel_by_id(req.id).await.map_err(|e| lookup_error(e, "隧道"))?;
    tunnel.name = req.name;
    tunnel.traffic_ratio = req.traffic_ratio;
    tunnel.flow = req.flow;
    tunnel.tcp_listen_addr = req.tcp_listen_addr;
    tunnel.udp_listen_addr = req.udp_listen_addr;
    tunnel.interface_name = req.interface_name;
    tunnel.status = req.status;
    state.store.update_tunnel(&tunnel).await.map_err(AppError::from)?;

    // Re-push every forward on this tunnel so listen-address/interface
    // changes reach the agent.
    let limits_by_user = state.store.list_forwards_by_tunnel(tunnel.id).await.map_err(AppError::from)?;
    for fw in &limits_by_user {
        let limiter = reconciler::resolve_speed_limiter(&state.store, fw.user_id, fw.tunnel_id).await;
        reconciler::enqueue_forward_service(&state.store, fw, &tunnel, limiter, "UpdateService").await?;
    }

    Ok(ok_msg("隧道已更新"))
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<DeleteTunnelRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    reconciler::delete_tunnel_cascade(&state.store, req.id).await?;
    Ok(ok_msg("隧道已删除"))
}
