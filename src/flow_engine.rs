//! # Flow Engine
//!
//! Attributes reported byte counts to a forward/user/grant, then enforces
//! quota by pausing the right scope: user-wide pause takes priority over
//! tunnel-wide pause, which takes priority over a stale-forward-status
//! pause (§4.6). Also reconciles the agent-reported resource catalogue
//! against the store on `/flow/config`, deleting anything the agent
//! still holds that the store no longer recognizes (§4.2's orphan
//! sweep).

use tracing::warn;

use crate::codec;
use crate::error::{AppError, AppResult};
use crate::protocol::{FlowReport, GostConfig, WEB_API_SENTINEL};
use crate::reconciler;
use crate::store::Store;

struct ParsedName {
    forward_id: i64,
    user_id: i64,
    user_tunnel_id: i64,
}

fn parse_service_name(n: &str) -> Option<ParsedName> {
    let mut parts = n.split('_');
    let forward_id = parts.next()?.parse().ok()?;
    let user_id = parts.next()?.parse().ok()?;
    let user_tunnel_id = parts.next()?.parse().ok()?;
    Some(ParsedName { forward_id, user_id, user_tunnel_id })
}

/// Applies one `/flow/upload` report: attributes the reported bytes, then
/// runs the pause cascade. The control plane's own self-report
/// (`n == "web_api"`) is accepted and ignored (§4.6).
pub async fn apply_report(store: &Store, report: &FlowReport) -> AppResult<()> {
    if report.n == WEB_API_SENTINEL {
        return Ok(());
    }

    let Some(parsed) = parse_service_name(&report.n) else {
        return Err(AppError::Invalid("服务名非法".to_string()));
    };
    if parsed.forward_id == 0 || parsed.user_id == 0 {
        return Err(AppError::Invalid("服务名非法".to_string()));
    }

    store
        .apply_flow(parsed.forward_id, parsed.user_id, parsed.user_tunnel_id, report.d, report.u)
        .await?;

    check_and_pause_if_needed(store, parsed.forward_id, parsed.user_id, parsed.user_tunnel_id).await
}

/// Re-evaluates quota after a flow update and pauses the narrowest scope
/// that is now over limit, expired, or disabled.
async fn check_and_pause_if_needed(
    store: &Store,
    forward_id: i64,
    user_id: i64,
    user_tunnel_id: i64,
) -> AppResult<()> {
    let now = crate::store::now_millis();

    let user = store.get_user_by_id(user_id).await?;
    if user.flow_used_bytes() >= user.flow_limit_bytes() || user.is_expired(now) || user.status != 1 {
        pause_all_user_forwards(store, user_id).await?;
        return Ok(());
    }

    if user_tunnel_id != 0 {
        if let Ok(ut) = store.get_user_tunnel_by_id(user_tunnel_id).await {
            if ut.flow_used_bytes() >= ut.flow_limit_bytes() || ut.is_expired(now) || ut.status != 1 {
                pause_forwards_for_tunnel(store, ut.user_id, ut.tunnel_id).await?;
                return Ok(());
            }
        }
    }

    if let Ok(forward) = store.get_forward_by_id(forward_id).await {
        if forward.status != 1 {
            pause_forward_by_id(store, forward_id).await?;
        }
    }

    Ok(())
}

pub async fn pause_all_user_forwards(store: &Store, user_id: i64) -> AppResult<()> {
    let forwards = store.list_forwards_by_user(user_id).await?;
    for fw in &forwards {
        pause_one(store, &fw.forward).await?;
    }
    Ok(())
}

/// Pauses every forward a user has on one tunnel. Shared with the daily
/// scheduler's grant-expiry sweep, which needs the same narrower scope
/// (§4.7) rather than the user-wide cascade.
pub async fn pause_forwards_for_tunnel(store: &Store, user_id: i64, tunnel_id: i64) -> AppResult<()> {
    let forwards = store.list_forwards_by_user(user_id).await?;
    for fw in forwards.iter().filter(|fw| fw.forward.tunnel_id == tunnel_id) {
        pause_one(store, &fw.forward).await?;
    }
    Ok(())
}

async fn pause_forward_by_id(store: &Store, forward_id: i64) -> AppResult<()> {
    let forward = store.get_forward_by_id(forward_id).await?;
    let tunnel = store.get_tunnel_by_id(forward.tunnel_id).await?;
    reconciler::enqueue_forward_pause(store, &forward, &tunnel).await?;
    store.update_forward_status(forward.id, 0, "paused").await?;
    Ok(())
}

async fn pause_one(store: &Store, forward: &crate::store::Forward) -> AppResult<()> {
    let tunnel = store.get_tunnel_by_id(forward.tunnel_id).await?;
    reconciler::enqueue_forward_pause(store, forward, &tunnel).await?;
    store.update_forward_status(forward.id, 0, "paused").await?;
    Ok(())
}

/// Reconciles the agent's reported resource catalogue (posted to
/// `/flow/config` on connect) against the store, enqueueing deletes for
/// anything the agent still holds that no longer has a backing row.
pub async fn reconcile_orphans(store: &Store, node_id: i64, cfg: &GostConfig) -> AppResult<()> {
    for svc in &cfg.services {
        if svc.name.is_empty() || svc.name == WEB_API_SENTINEL {
            continue;
        }
        let parts: Vec<&str> = svc.name.split('_').collect();
        if parts.len() < 4 {
            continue;
        }
        let Ok(forward_id) = parts[0].parse::<i64>() else { continue };
        if store.get_forward_by_id(forward_id).await.is_ok() {
            continue;
        }
        let base = parts[..3].join("_");
        match parts[3] {
            "tcp" => {
                reconciler::enqueue_gost(store, node_id, "DeleteService", codec::delete_service_data(&base)).await?;
            }
            "tls" => {
                reconciler::enqueue_gost(store, node_id, "DeleteService", codec::delete_remote_service_data(&base)).await?;
            }
            _ => {}
        }
    }

    for chain in &cfg.chains {
        if chain.name.is_empty() {
            continue;
        }
        let parts: Vec<&str> = chain.name.split('_').collect();
        if parts.len() < 4 || parts[3] != "chains" {
            continue;
        }
        let Ok(forward_id) = parts[0].parse::<i64>() else { continue };
        if store.get_forward_by_id(forward_id).await.is_ok() {
            continue;
        }
        let base = parts[..3].join("_");
        reconciler::enqueue_gost(store, node_id, "DeleteChains", codec::delete_chains_data(&base)).await?;
    }

    for limiter in &cfg.limiters {
        if limiter.name.is_empty() {
            continue;
        }
        let Ok(id) = limiter.name.parse::<i64>() else { continue };
        if store.get_speed_limit_by_id(id).await.is_ok() {
            continue;
        }
        reconciler::enqueue_gost(store, node_id, "DeleteLimiters", codec::delete_limiters_data(id)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    async fn seed(store: &Store) -> (i64, i64, i64) {
        let node_id = store.insert_node("n1", "s1", None, "1.1.1.1", 10000, 10100).await.unwrap();
        let tunnel_id = store
            .insert_tunnel("t1", 1.0, node_id, "1.1.1.1", None, "", 1, "tls", 0, "[::]", "[::]", None)
            .await
            .unwrap();
        let user_id = store.insert_user("bob", "hash", 1, 0, 1, 0, 5).await.unwrap();
        (node_id, tunnel_id, user_id)
    }

    #[tokio::test]
    async fn web_api_sentinel_is_accepted_and_ignored() {
        let store = test_store().await;
        let report = FlowReport { n: "web_api".to_string(), u: 10, d: 20 };
        apply_report(&store, &report).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_name_is_rejected() {
        let store = test_store().await;
        let report = FlowReport { n: "not-enough-parts".to_string(), u: 0, d: 0 };
        assert!(apply_report(&store, &report).await.is_err());
    }

    #[tokio::test]
    async fn flow_over_quota_pauses_all_user_forwards() {
        let store = test_store().await;
        let (_, tunnel_id, user_id) = seed(&store).await;
        let forward_id = store
            .insert_forward(user_id, "bob", "f1", tunnel_id, 10001, None, "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();

        // user's quota is 1 GiB; report slightly over that in one shot.
        let report = FlowReport {
            n: format!("{forward_id}_{user_id}_0"),
            u: 1_073_741_824,
            d: 1,
        };
        apply_report(&store, &report).await.unwrap();

        let forward = store.get_forward_by_id(forward_id).await.unwrap();
        assert_eq!(forward.status, 0);
        assert_eq!(forward.lifecycle, "paused");
        assert!(store.claim_next_outbox().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flow_within_quota_leaves_forward_untouched() {
        let store = test_store().await;
        let (_, tunnel_id, user_id) = seed(&store).await;
        let forward_id = store
            .insert_forward(user_id, "bob", "f1", tunnel_id, 10001, None, "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();

        let report = FlowReport { n: format!("{forward_id}_{user_id}_0"), u: 10, d: 10 };
        apply_report(&store, &report).await.unwrap();

        let forward = store.get_forward_by_id(forward_id).await.unwrap();
        assert_eq!(forward.status, 1);
        assert!(store.claim_next_outbox().await.unwrap().is_none());
    }
}
