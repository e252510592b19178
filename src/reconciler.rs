//! # Reconciler
//!
//! Turns forward/tunnel/limiter state changes into outbox-queued agent
//! commands. Store-first-emit-second (§4.4, §7): callers commit the
//! owning row (forward/tunnel/user) before calling into this module, so
//! a crash before the enqueue leaves a forward un-pushed rather than
//! partially applied — never the other way around.
//!
//! The reconciler never talks to the Hub directly — it only ever writes
//! to the outbox. The outbox pump is the sole path from a queued command
//! to a live agent, which keeps this module testable without a socket.

use serde_json::Value;

use crate::codec::{self, TunnelConfig};
use crate::error::AppResult;
use crate::store::{Forward, SpeedLimit, Store, Tunnel};

/// `<forwardID>_<userID>_<userTunnelID>` — the agent-side resource name
/// shared by every command touching this forward.
pub fn service_name(forward: &Forward, user_tunnel_id: i64) -> String {
    codec::service_base_name(forward.id, forward.user_id, user_tunnel_id)
}

/// The grant id backing `(user_id, tunnel_id)`, or `0` when the caller is
/// an admin acting without a grant row (§9: `userTunnelID=0` is a literal
/// naming choice, not a missing value).
pub async fn resolve_user_tunnel_id(store: &Store, user_id: i64, tunnel_id: i64) -> i64 {
    store
        .get_user_tunnel_by_user_and_tunnel(user_id, tunnel_id)
        .await
        .map(|ut| ut.id)
        .unwrap_or(0)
}

/// The speed limiter attached to `(user_id, tunnel_id)`'s grant, if any.
pub async fn resolve_speed_limiter(store: &Store, user_id: i64, tunnel_id: i64) -> Option<i64> {
    store
        .get_user_tunnel_by_user_and_tunnel(user_id, tunnel_id)
        .await
        .ok()
        .and_then(|ut| ut.speed_id)
}

fn tunnel_config(tunnel: &Tunnel) -> TunnelConfig<'_> {
    TunnelConfig {
        tunnel_type: tunnel.tunnel_type,
        protocol: &tunnel.protocol,
        tcp_listen_addr: &tunnel.tcp_listen_addr,
        udp_listen_addr: &tunnel.udp_listen_addr,
    }
}

/// Enqueues `action` for `node_id` as a durable outbox row. The caller
/// always writes its own store row first and only enqueues once that
/// write has committed, so a crash before this call simply leaves the
/// forward un-pushed rather than partially applied (§4.4).
pub async fn enqueue_gost(store: &Store, node_id: i64, action: &str, data: Value) -> AppResult<i64> {
    let payload = serde_json::json!({ "node_id": node_id, "action": action, "data": data });
    let id = store
        .enqueue_outbox(action, &payload.to_string())
        .await?;
    Ok(id)
}

/// Pushes (or re-pushes, for `action == "UpdateService"`) the full
/// command set for one forward: the ingress service, and — for a
/// relay (`type=2`) tunnel with an allocated egress port — the egress
/// service and the chain tying them together.
pub async fn enqueue_forward_service(
    store: &Store,
    forward: &Forward,
    tunnel: &Tunnel,
    limiter: Option<i64>,
    action: &str,
) -> AppResult<()> {
    let user_tunnel_id = resolve_user_tunnel_id(store, forward.user_id, forward.tunnel_id).await;
    let name = service_name(forward, user_tunnel_id);
    let cfg = tunnel_config(tunnel);

    let service_data = if action == "UpdateService" {
        codec::update_service_data(
            &name,
            forward.in_port,
            limiter,
            &forward.remote_addr,
            cfg,
            &forward.strategy,
            forward.interface_name.as_deref(),
        )
    } else {
        codec::add_service_data(
            &name,
            forward.in_port,
            limiter,
            &forward.remote_addr,
            cfg,
            &forward.strategy,
            forward.interface_name.as_deref(),
        )
    };
    enqueue_gost(store, tunnel.in_node_id, action, service_data).await?;

    if tunnel.is_relay() {
        if let (Some(out_node_id), Some(out_port)) = (tunnel.out_node_id, forward.out_port) {
            let remote_data = if action == "UpdateService" {
                codec::update_remote_service_data(
                    &name,
                    out_port,
                    &forward.remote_addr,
                    &tunnel.protocol,
                    &forward.strategy,
                    forward.interface_name.as_deref(),
                )
            } else {
                codec::add_remote_service_data(
                    &name,
                    out_port,
                    &forward.remote_addr,
                    &tunnel.protocol,
                    &forward.strategy,
                    forward.interface_name.as_deref(),
                )
            };
            enqueue_gost(store, out_node_id, action, remote_data).await?;

            let chain_action = if action == "UpdateService" { "UpdateChains" } else { "AddChains" };
            let chain_addr = format!("{}:{out_port}", tunnel.out_ip);
            let chains_data = if action == "UpdateService" {
                codec::update_chains_data(&name, &chain_addr, &tunnel.protocol, forward.interface_name.as_deref())
            } else {
                codec::add_chains_data(&name, &chain_addr, &tunnel.protocol, forward.interface_name.as_deref())
            };
            enqueue_gost(store, tunnel.in_node_id, chain_action, chains_data).await?;
        }
    }

    Ok(())
}

/// Tears down every resource a forward owns. All three deletes are
/// always emitted for a relay tunnel — a missing chain on the agent side
/// is treated as an idempotent no-op, per §9's resolved open question.
pub async fn enqueue_forward_delete(store: &Store, forward: &Forward, tunnel: &Tunnel) -> AppResult<()> {
    let user_tunnel_id = resolve_user_tunnel_id(store, forward.user_id, forward.tunnel_id).await;
    let name = service_name(forward, user_tunnel_id);

    enqueue_gost(store, tunnel.in_node_id, "DeleteService", codec::delete_service_data(&name)).await?;
    if tunnel.is_relay() {
        enqueue_gost(store, tunnel.in_node_id, "DeleteChains", codec::delete_chains_data(&name)).await?;
        if let Some(out_node_id) = tunnel.out_node_id {
            enqueue_gost(store, out_node_id, "DeleteService", codec::delete_remote_service_data(&name)).await?;
        }
    }
    Ok(())
}

pub async fn enqueue_forward_pause(store: &Store, forward: &Forward, tunnel: &Tunnel) -> AppResult<()> {
    let user_tunnel_id = resolve_user_tunnel_id(store, forward.user_id, forward.tunnel_id).await;
    let name = service_name(forward, user_tunnel_id);

    enqueue_gost(store, tunnel.in_node_id, "PauseService", codec::pause_service_data(&name)).await?;
    if tunnel.is_relay() {
        if let Some(out_node_id) = tunnel.out_node_id {
            enqueue_gost(store, out_node_id, "PauseService", codec::pause_remote_service_data(&name)).await?;
        }
    }
    Ok(())
}

pub async fn enqueue_forward_resume(store: &Store, forward: &Forward, tunnel: &Tunnel) -> AppResult<()> {
    let user_tunnel_id = resolve_user_tunnel_id(store, forward.user_id, forward.tunnel_id).await;
    let name = service_name(forward, user_tunnel_id);

    enqueue_gost(store, tunnel.in_node_id, "ResumeService", codec::resume_service_data(&name)).await?;
    if tunnel.is_relay() {
        if let Some(out_node_id) = tunnel.out_node_id {
            enqueue_gost(store, out_node_id, "ResumeService", codec::resume_remote_service_data(&name)).await?;
        }
    }
    Ok(())
}

fn limiter_config_data(limit: &SpeedLimit) -> Value {
    codec::add_limiters_data(limit.id, limit.speed)
}

/// Re-pushes every active speed limit and every forward touching
/// `node_id`, called once a node (re)connects. The agent side is
/// expected to treat `AddLimiters`/`UpdateService` as idempotent upserts,
/// which is what makes a full resync safe to run unconditionally rather
/// than diffing against the agent's reported config (§4.4).
pub async fn resync_node(store: &Store, node_id: i64) -> AppResult<()> {
    let tunnels = store.list_tunnels().await?;

    for tunnel in &tunnels {
        if tunnel.in_node_id != node_id {
            continue;
        }
        let limits = store.list_active_speed_limits_by_tunnel(tunnel.id).await?;
        for limit in &limits {
            enqueue_gost(store, tunnel.in_node_id, "AddLimiters", limiter_config_data(limit)).await?;
        }
    }

    let tunnels_by_id: std::collections::HashMap<i64, &Tunnel> =
        tunnels.iter().map(|t| (t.id, t)).collect();

    let forwards = store.list_forwards_all().await?;
    for fw in &forwards {
        let Some(tunnel) = tunnels_by_id.get(&fw.forward.tunnel_id) else {
            continue;
        };
        let touches_node = tunnel.in_node_id == node_id
            || (tunnel.is_relay() && tunnel.out_node_id == Some(node_id));
        if !touches_node {
            continue;
        }
        let limiter = resolve_speed_limiter(store, fw.forward.user_id, fw.forward.tunnel_id).await;
        enqueue_forward_service(store, &fw.forward, tunnel, limiter, "UpdateService").await?;
    }

    Ok(())
}

/// Re-issues `UpdateService` (plus remote/chains as appropriate) for
/// every forward whose grant references `limit_id`, so the agent
/// rebinds to the limit's current (possibly now-absent) resolution.
/// This is the "refresh" step named throughout the speed-limit state
/// machine (§4.5).
pub async fn refresh_forwards_for_speed_limit(store: &Store, limit_id: i64) -> AppResult<()> {
    let tunnels = store.list_tunnels().await?;
    let tunnels_by_id: std::collections::HashMap<i64, &Tunnel> =
        tunnels.iter().map(|t| (t.id, t)).collect();

    let forwards = store.list_forwards_all().await?;
    for fw in &forwards {
        let Some(tunnel) = tunnels_by_id.get(&fw.forward.tunnel_id) else {
            continue;
        };
        let Ok(ut) = store
            .get_user_tunnel_by_user_and_tunnel(fw.forward.user_id, fw.forward.tunnel_id)
            .await
        else {
            continue;
        };
        if ut.speed_id != Some(limit_id) {
            continue;
        }
        let limiter = resolve_speed_limiter(store, fw.forward.user_id, fw.forward.tunnel_id).await;
        enqueue_forward_service(store, &fw.forward, tunnel, limiter, "UpdateService").await?;
    }
    Ok(())
}

/// Speed-limit state machine (§4.5): activating a limit on a tunnel
/// enqueues `AddLimiters` on that tunnel's in-node, then refreshes every
/// forward whose grant binds to the limit so the agent rebinds.
pub async fn activate_speed_limit(store: &Store, limit: &SpeedLimit) -> AppResult<()> {
    let tunnel = store.get_tunnel_by_id(limit.tunnel_id).await?;
    enqueue_gost(store, tunnel.in_node_id, "AddLimiters", limiter_config_data(limit)).await?;
    refresh_forwards_for_speed_limit(store, limit.id).await
}

/// Deactivating a limit enqueues `DeleteLimiters` on its (former)
/// tunnel's in-node, then refreshes affected forwards so they drop the
/// limiter binding.
pub async fn deactivate_speed_limit(store: &Store, limit: &SpeedLimit, old_tunnel_id: i64) -> AppResult<()> {
    let tunnel = store.get_tunnel_by_id(old_tunnel_id).await?;
    enqueue_gost(store, tunnel.in_node_id, "DeleteLimiters", codec::delete_limiters_data(limit.id)).await?;
    refresh_forwards_for_speed_limit(store, limit.id).await
}

/// An active limit moved to a different tunnel: delete on the old
/// tunnel's in-node, add on the new one, then refresh both sides.
pub async fn move_speed_limit(store: &Store, limit: &SpeedLimit, old_tunnel_id: i64) -> AppResult<()> {
    let old_tunnel = store.get_tunnel_by_id(old_tunnel_id).await?;
    enqueue_gost(store, old_tunnel.in_node_id, "DeleteLimiters", codec::delete_limiters_data(limit.id)).await?;
    let new_tunnel = store.get_tunnel_by_id(limit.tunnel_id).await?;
    enqueue_gost(store, new_tunnel.in_node_id, "AddLimiters", limiter_config_data(limit)).await?;
    refresh_forwards_for_speed_limit(store, limit.id).await
}

/// An active limit's speed changed on the same tunnel: `UpdateLimiters`
/// only, no add/delete.
pub async fn update_speed_limit_rate(store: &Store, limit: &SpeedLimit) -> AppResult<()> {
    let tunnel = store.get_tunnel_by_id(limit.tunnel_id).await?;
    enqueue_gost(store, tunnel.in_node_id, "UpdateLimiters", codec::update_limiters_data(limit.id, limit.speed)).await?;
    refresh_forwards_for_speed_limit(store, limit.id).await
}

/// Tears down every forward on `tunnel_id` (agent deletes enqueued
/// first), then the tunnel row itself. `user_tunnel` rows cascade via
/// the foreign key; forwards do not, so they are deleted explicitly
/// alongside their agent-side teardown.
pub async fn delete_tunnel_cascade(store: &Store, tunnel_id: i64) -> AppResult<()> {
    let tunnel = store.get_tunnel_by_id(tunnel_id).await?;
    let forwards = store.list_forwards_by_tunnel(tunnel_id).await?;
    for fw in &forwards {
        enqueue_forward_delete(store, fw, &tunnel).await?;
        store.delete_forward(fw.id).await?;
    }
    store.delete_tunnel(tunnel_id).await?;
    Ok(())
}

/// Tears down every forward a user holds on one `user_tunnel` grant,
/// then the grant row itself (§4.5's cascading-delete rule for
/// `user_tunnel`).
pub async fn delete_user_tunnel_cascade(store: &Store, user_tunnel_id: i64) -> AppResult<()> {
    let ut = store.get_user_tunnel_by_id(user_tunnel_id).await?;
    let tunnel = store.get_tunnel_by_id(ut.tunnel_id).await?;
    let forwards = store.list_forwards_by_user(ut.user_id).await?;
    for fw in forwards.iter().filter(|fw| fw.forward.tunnel_id == ut.tunnel_id) {
        enqueue_forward_delete(store, &fw.forward, &tunnel).await?;
        store.delete_forward(fw.forward.id).await?;
    }
    store.delete_user_tunnel(user_tunnel_id).await?;
    Ok(())
}

/// Deletes every forward owned by `user_id` (enqueuing its teardown
/// first), the user's statistics history, and finally the user row
/// itself. `user_tunnel` rows cascade via the foreign key.
pub async fn delete_user_cascade(store: &Store, user_id: i64) -> AppResult<()> {
    let forwards = store.list_forwards_by_user(user_id).await?;
    let tunnels: Vec<Tunnel> = store.list_tunnels().await?;
    let tunnels_by_id: std::collections::HashMap<i64, &Tunnel> =
        tunnels.iter().map(|t| (t.id, t)).collect();

    for fw in &forwards {
        if let Some(tunnel) = tunnels_by_id.get(&fw.forward.tunnel_id) {
            enqueue_forward_delete(store, &fw.forward, tunnel).await?;
        }
        store.delete_forward(fw.forward.id).await?;
    }

    store.delete_statistics_by_user(user_id).await?;
    store.delete_user(user_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    async fn seed_single_node_tunnel(store: &Store) -> (i64, i64) {
        let node_id = store
            .insert_node("node-a", "secret-a", None, "1.2.3.4", 10000, 10100)
            .await
            .unwrap();
        let tunnel_id = store
            .insert_tunnel(
                "t1", 1.0, node_id, "1.2.3.4", None, "", 1, "tls", 0, "[::]", "[::]", None,
            )
            .await
            .unwrap();
        (node_id, tunnel_id)
    }

    #[tokio::test]
    async fn enqueue_forward_service_pushes_single_add_service() {
        let store = test_store().await;
        let (node_id, tunnel_id) = seed_single_node_tunnel(&store).await;
        let forward_id = store
            .insert_forward(1, "alice", "f1", tunnel_id, 10001, None, "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();
        let forward = store.get_forward_by_id(forward_id).await.unwrap();
        let tunnel = store.get_tunnel_by_id(tunnel_id).await.unwrap();

        enqueue_forward_service(&store, &forward, &tunnel, None, "AddService").await.unwrap();

        let item = store.claim_next_outbox().await.unwrap().unwrap();
        assert_eq!(item.kind, "AddService");
        let payload: Value = serde_json::from_str(&item.payload).unwrap();
        assert_eq!(payload["node_id"], node_id);
        assert_eq!(payload["data"][0]["name"], "1_1_0_tcp");
    }

    #[tokio::test]
    async fn relay_tunnel_pushes_service_chain_and_remote() {
        let store = test_store().await;
        let in_node = store
            .insert_node("in", "secret-in", None, "1.1.1.1", 10000, 10100)
            .await
            .unwrap();
        let out_node = store
            .insert_node("out", "secret-out", None, "2.2.2.2", 20000, 20100)
            .await
            .unwrap();
        let tunnel_id = store
            .insert_tunnel(
                "relay", 1.0, in_node, "1.1.1.1", Some(out_node), "2.2.2.2", 2, "quic", 0, "[::]", "[::]", None,
            )
            .await
            .unwrap();
        let forward_id = store
            .insert_forward(1, "alice", "f1", tunnel_id, 10001, Some(20001), "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();
        let forward = store.get_forward_by_id(forward_id).await.unwrap();
        let tunnel = store.get_tunnel_by_id(tunnel_id).await.unwrap();

        enqueue_forward_service(&store, &forward, &tunnel, None, "AddService").await.unwrap();

        let mut kinds = vec![];
        let mut node_ids = vec![];
        while let Some(item) = store.claim_next_outbox().await.unwrap() {
            let payload: Value = serde_json::from_str(&item.payload).unwrap();
            node_ids.push(payload["node_id"].as_i64().unwrap());
            kinds.push(item.kind);
        }
        assert_eq!(kinds, vec!["AddService", "AddService", "AddChains"]);
        assert_eq!(node_ids, vec![in_node, out_node, in_node]);
    }

    #[tokio::test]
    async fn delete_user_cascade_removes_forwards_and_user() {
        let store = test_store().await;
        let (_, tunnel_id) = seed_single_node_tunnel(&store).await;
        store
            .insert_user("alice", "hash", 1, 0, 10, 0, 5)
            .await
            .unwrap();
        let forward_id = store
            .insert_forward(1, "alice", "f1", tunnel_id, 10001, None, "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();

        delete_user_cascade(&store, 1).await.unwrap();

        assert!(store.get_forward_by_id(forward_id).await.is_err());
        assert!(store.get_user_by_id(1).await.is_err());
        let item = store.claim_next_outbox().await.unwrap();
        assert!(item.is_some());
    }
}
