//! Forward endpoints — the user-facing forwarding rule and the busiest
//! part of the API surface. Authorization predicates and store effects
//! match §4.5's table verbatim; every mutation that changes agent-visible
//! state goes through the reconciler so the outbox stays the single path
//! to a live agent.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ok, ok_msg, Principal};
use crate::error::{lookup_error, AppError, AppResult};
use crate::reconciler;
use crate::state::AppState;
use crate::store::{Forward, Tunnel};

#[derive(Debug, Deserialize)]
pub struct ListForwardQuery {
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateForwardRequest {
    pub name: String,
    pub tunnel_id: i64,
    pub in_port: Option<i64>,
    pub out_port: Option<i64>,
    pub remote_addr: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub interface_name: Option<String>,
}

fn default_strategy() -> String {
    "fifo".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateForwardRequest {
    pub id: i64,
    pub name: String,
    pub tunnel_id: i64,
    pub in_port: Option<i64>,
    pub out_port: Option<i64>,
    pub remote_addr: String,
    pub strategy: String,
    pub interface_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForwardIdRequest {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct OrderForwardRequest {
    pub id: i64,
    pub inx: i64,
}

pub async fn list(
    principal: Principal,
    State(state): State<AppState>,
    Query(q): Query<ListForwardQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let user_id = if principal.is_admin() {
        q.user_id.unwrap_or(principal.user_id)
    } else {
        principal.user_id
    };
    let forwards = state.store.list_forwards_by_user(user_id).await?;
    Ok(ok(forwards.into_iter().map(|f| f.forward).collect::<Vec<Forward>>()))
}

/// Runs every create-time predicate from §4.5 in order, short-circuiting
/// on the first violation.
async fn authorize_create(state: &AppState, principal: &Principal, tunnel: &Tunnel) -> AppResult<i64> {
    let now = crate::store::now_millis();

    let user = state.store.get_user_by_id(principal.user_id).await.map_err(|e| lookup_error(e, "用户"))?;
    if user.is_expired(now) || user.status != 1 {
        return Err(AppError::Forbidden);
    }
    if tunnel.status != 1 {
        return Err(AppError::Invalid("隧道不可用".to_string()));
    }

    let user_tunnel_id = if principal.is_admin() {
        0
    } else {
        let ut = state
            .store
            .get_user_tunnel_by_user_and_tunnel(principal.user_id, tunnel.id)
            .await
            .map_err(|_| AppError::Forbidden)?;
        if ut.status != 1 || ut.is_expired(now) {
            return Err(AppError::Forbidden);
        }
        if ut.flow_used_bytes() >= ut.flow_limit_bytes() {
            return Err(AppError::Invalid("隧道流量已用尽".to_string()));
        }
        let count = state.store.count_forwards_by_user_tunnel(principal.user_id, tunnel.id).await?;
        if count >= ut.num {
            return Err(AppError::Invalid("该隧道转发数量已达上限".to_string()));
        }
        ut.id
    };

    if user.flow_used_bytes() >= user.flow_limit_bytes() {
        return Err(AppError::Invalid("账户流量已用尽".to_string()));
    }
    let total = state.store.count_forwards_by_user(principal.user_id).await?;
    if total >= user.num {
        return Err(AppError::Invalid("转发数量已达上限".to_string()));
    }

    Ok(user_tunnel_id)
}

async fn allocate_ports(
    state: &AppState,
    tunnel: &Tunnel,
    requested_in: Option<i64>,
    requested_out: Option<i64>,
    exclude_id: Option<i64>,
) -> AppResult<(i64, Option<i64>)> {
    let in_port = match requested_in {
        Some(p) => {
            if !state.store.is_in_port_available(tunnel.in_node_id, p, exclude_id).await? {
                return Err(AppError::Conflict("入口端口已被占用".to_string()));
            }
            p
        }
        None => state
            .store
            .allocate_port_for_node(tunnel.in_node_id, exclude_id)
            .await?
            .ok_or_else(|| AppError::Invalid("入口节点端口已耗尽".to_string()))?,
    };

    let out_port = if tunnel.is_relay() {
        let out_node_id = tunnel.out_node_id.ok_or_else(|| AppError::Invalid("隧道缺少出口节点".to_string()))?;
        let port = match requested_out {
            Some(p) => {
                if !state.store.is_in_port_available(out_node_id, p, exclude_id).await? {
                    return Err(AppError::Conflict("出口端口已被占用".to_string()));
                }
                p
            }
            None => state
                .store
                .allocate_port_for_node(out_node_id, exclude_id)
                .await?
                .ok_or_else(|| AppError::Invalid("出口节点端口已耗尽".to_string()))?,
        };
        Some(port)
    } else {
        None
    };

    Ok((in_port, out_port))
}

pub async fn create(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<CreateForwardRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let tunnel = state.store.get_tunnel_by_id(req.tunnel_id).await.map_err(|e| lookup_error(e, "隧道"))?;
    authorize_create(&state, &principal, &tunnel).await?;

    let (in_port, out_port) = allocate_ports(&state, &tunnel, req.in_port, req.out_port, None).await?;

    let user = state.store.get_user_by_id(principal.user_id).await?;
    let forward_id = state
        .store
        .insert_forward(
            principal.user_id,
            &user.username,
            &req.name,
            tunnel.id,
            in_port,
            out_port,
            &req.remote_addr,
            &req.strategy,
            req.interface_name.as_deref(),
        )
        .await?;

    let forward = state.store.get_forward_by_id(forward_id).await?;
    let limiter = reconciler::resolve_speed_limiter(&state.store, forward.user_id, forward.tunnel_id).await;
    reconciler::enqueue_forward_service(&state.store, &forward, &tunnel, limiter, "AddService").await?;

    Ok(ok(forward_id))
}

pub async fn update(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<UpdateForwardRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let mut forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }

    let tunnel = state.store.get_tunnel_by_id(req.tunnel_id).await.map_err(|e| lookup_error(e, "隧道"))?;
    let tunnel_changed = forward.tunnel_id != req.tunnel_id;
    let port_changed = req.in_port.is_some_and(|p| p != forward.in_port) || tunnel_changed;

    let (in_port, out_port) = if port_changed {
        allocate_ports(&state, &tunnel, req.in_port.or(Some(forward.in_port)), req.out_port, Some(forward.id)).await?
    } else {
        (forward.in_port, forward.out_port)
    };

    forward.name = req.name;
    forward.tunnel_id = req.tunnel_id;
    forward.in_port = in_port;
    forward.out_port = out_port;
    forward.remote_addr = req.remote_addr;
    forward.strategy = req.strategy;
    forward.interface_name = req.interface_name;
    forward.lifecycle = "updating".to_string();
    state.store.update_forward(&forward).await?;

    let limiter = reconciler::resolve_speed_limiter(&state.store, forward.user_id, forward.tunnel_id).await;
    reconciler::enqueue_forward_service(&state.store, &forward, &tunnel, limiter, "UpdateService").await?;
    state.store.update_forward_status(forward.id, forward.status, "active").await?;

    Ok(ok_msg("转发已更新"))
}

pub async fn remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<ForwardIdRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }
    let tunnel = state.store.get_tunnel_by_id(forward.tunnel_id).await?;
    reconciler::enqueue_forward_delete(&state.store, &forward, &tunnel).await?;
    state.store.delete_forward(forward.id).await?;
    Ok(ok_msg("转发已删除"))
}

/// Deletes the store row only, with no agent-side teardown (§4.5's
/// `Force-delete` row) — for when the agent is already gone and the
/// normal delete would simply pile onto the outbox forever.
pub async fn force_remove(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<ForwardIdRequest>,
) -> AppResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    state.store.delete_forward(req.id).await?;
    Ok(ok_msg("转发已强制删除"))
}

pub async fn pause(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<ForwardIdRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }
    let tunnel = state.store.get_tunnel_by_id(forward.tunnel_id).await?;
    reconciler::enqueue_forward_pause(&state.store, &forward, &tunnel).await?;
    state.store.update_forward_status(forward.id, 0, "paused").await?;
    Ok(ok_msg("转发已暂停"))
}

pub async fn resume(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<ForwardIdRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }
    let tunnel = state.store.get_tunnel_by_id(forward.tunnel_id).await?;
    reconciler::enqueue_forward_resume(&state.store, &forward, &tunnel).await?;
    state.store.update_forward_status(forward.id, 1, "active").await?;
    Ok(ok_msg("转发已恢复"))
}

pub async fn order(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<OrderForwardRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }
    state.store.update_forward_order(req.id, req.inx).await?;
    Ok(ok_msg("排序已更新"))
}

/// A TCP-ping probe along the forward's ingress path: asks the in-node
/// agent to dial its configured target and report round-trip time. A
/// timeout answers `{averageTime:-1, packetLoss:100}` rather than an
/// error, matching §7's diagnostic-probe convention.
pub async fn diagnose(
    principal: Principal,
    State(state): State<AppState>,
    Json(req): Json<ForwardIdRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let forward = state.store.get_forward_by_id(req.id).await.map_err(|e| lookup_error(e, "转发"))?;
    if !principal.owns_or_admin(forward.user_id) {
        return Err(AppError::Forbidden);
    }
    let tunnel = state.store.get_tunnel_by_id(forward.tunnel_id).await?;

    let data = json!({ "addr": forward.remote_addr });
    match state
        .hub
        .send_and_wait(tunnel.in_node_id, "Ping", data, Duration::from_secs(10))
        .await
    {
        Ok(resp) => Ok(ok(resp.data.unwrap_or_else(|| json!({"averageTime": -1, "packetLoss": 100})))),
        Err(_) => Ok(ok(json!({"averageTime": -1, "packetLoss": 100}))),
    }
}
