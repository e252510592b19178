//! # Scheduler
//!
//! Two cron-driven sweeps (§4.7): an hourly flow-statistics rollup with a
//! 48h retention window, and a daily reset of monthly flow counters plus
//! expiry enforcement for users and grants. Everything this module does
//! to an agent goes through the reconciler's outbox, same as the HTTP
//! handlers — it never talks to the Hub directly.

use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use cron::Schedule;
use tracing::warn;

use crate::flow_engine;
use crate::store::Store;

/// Spawns the hourly and daily sweeps as two independent loops that run
/// for the lifetime of the process.
pub async fn run(store: Store) {
    tokio::join!(hourly_loop(store.clone()), daily_loop(store));
}

async fn hourly_loop(store: Store) {
    let schedule = Schedule::from_str("0 0 * * * *").expect("valid cron expression");
    loop {
        sleep_until_next(&schedule).await;
        hourly_statistics(&store).await;
    }
}

async fn daily_loop(store: Store) {
    let schedule = Schedule::from_str("0 0 0 * * *").expect("valid cron expression");
    loop {
        sleep_until_next(&schedule).await;
        daily_reset(&store).await;
    }
}

async fn sleep_until_next(schedule: &Schedule) {
    let now = Utc::now();
    match schedule.upcoming(Utc).next() {
        Some(next) => {
            let dur = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(dur).await;
        }
        None => tokio::time::sleep(Duration::from_secs(60)).await,
    }
}

/// Collects one rollup row per user (the delta against the last recorded
/// `total_flow`, or the full total if the counter was reset since) and
/// trims rows older than 48h.
async fn hourly_statistics(store: &Store) {
    let now = Utc::now();
    let cutoff = (now - chrono::Duration::hours(48)).timestamp_millis();
    if let Err(err) = store.delete_statistics_older_than(cutoff).await {
        warn!(%err, "failed to trim old statistics rows");
    }

    let users = match store.list_users().await {
        Ok(users) => users,
        Err(err) => {
            warn!(%err, "failed to list users for hourly rollup");
            return;
        }
    };

    let hour_string = now.format("%H:%M").to_string();
    let mut items = Vec::with_capacity(users.len());
    for user in &users {
        let total = user.in_flow + user.out_flow;
        let last_total = match store.last_total_flow(user.id).await {
            Ok(t) => t,
            Err(err) => {
                warn!(user_id = user.id, %err, "failed to read last total_flow");
                continue;
            }
        };
        let increment = if total >= last_total { total - last_total } else { total };
        items.push((user.id, increment, total, hour_string.clone()));
    }

    if let Err(err) = store.insert_statistics(items).await {
        warn!(%err, "failed to insert hourly statistics batch");
    }
}

/// Resets any user/grant whose `flow_reset_time` matches today (with the
/// last-day-of-month carry rule so a reset day past the end of a shorter
/// month still fires), then enforces expiry on both scopes.
async fn daily_reset(store: &Store) {
    let today = Utc::now();
    let day = today.day() as i64;
    let last_day = days_in_month(today.year(), today.month()) as i64;

    if let Err(err) = store.reset_expired_user_flows(day, last_day).await {
        warn!(%err, "failed to reset user flow counters");
    }
    if let Err(err) = store.reset_expired_user_tunnel_flows(day, last_day).await {
        warn!(%err, "failed to reset user_tunnel flow counters");
    }

    expire_users(store).await;
    expire_user_tunnels(store).await;
}

async fn expire_users(store: &Store) {
    let now_ms = crate::store::now_millis();
    let users = match store.list_expired_active_users(now_ms).await {
        Ok(users) => users,
        Err(err) => {
            warn!(%err, "failed to list expired users");
            return;
        }
    };
    for user in &users {
        if let Err(err) = store.set_user_status(user.id, 0).await {
            warn!(user_id = user.id, %err, "failed to disable expired user");
            continue;
        }
        if let Err(err) = flow_engine::pause_all_user_forwards(store, user.id).await {
            warn!(user_id = user.id, %err, "failed to pause expired user's forwards");
        }
    }
}

async fn expire_user_tunnels(store: &Store) {
    let now_ms = crate::store::now_millis();
    let grants = match store.list_expired_active_user_tunnels(now_ms).await {
        Ok(grants) => grants,
        Err(err) => {
            warn!(%err, "failed to list expired user_tunnel grants");
            return;
        }
    };
    for ut in &grants {
        if let Err(err) = store.set_user_tunnel_status(ut.id, 0).await {
            warn!(user_tunnel_id = ut.id, %err, "failed to disable expired grant");
            continue;
        }
        if let Err(err) = flow_engine::pause_forwards_for_tunnel(store, ut.user_id, ut.tunnel_id).await {
            warn!(user_tunnel_id = ut.id, %err, "failed to pause expired grant's forwards");
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid calendar date");
    let first_of_this = NaiveDate::from_ymd_opt(year, month, 1).expect("valid calendar date");
    (first_of_next - first_of_this).num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[test]
    fn days_in_month_handles_year_boundary() {
        assert_eq!(days_in_month(2026, 2), 28);
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2026, 12), 31);
    }

    #[tokio::test]
    async fn hourly_statistics_records_delta_against_last_total() {
        let store = test_store().await;
        let user_id = store.insert_user("bob", "hash", 1, 0, 10, 0, 5).await.unwrap();
        // seed flow directly on the user row; apply_flow would also
        // require a live forward to attribute against.
        sqlx::query("UPDATE user SET in_flow = 100, out_flow = 50 WHERE id = ?")
            .bind(user_id)
            .execute(store.pool())
            .await
            .unwrap();

        hourly_statistics(&store).await;

        let rows = store.list_recent_statistics(user_id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_flow, 150);
        assert_eq!(rows[0].flow, 150);

        sqlx::query("UPDATE user SET in_flow = 120, out_flow = 60 WHERE id = ?")
            .bind(user_id)
            .execute(store.pool())
            .await
            .unwrap();
        hourly_statistics(&store).await;

        let rows = store.list_recent_statistics(user_id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].total_flow, 180);
        assert_eq!(rows[0].flow, 30);
    }

    #[tokio::test]
    async fn expired_user_is_disabled_and_forwards_paused() {
        let store = test_store().await;
        let node_id = store.insert_node("n1", "s1", None, "1.1.1.1", 10000, 10100).await.unwrap();
        let tunnel_id = store
            .insert_tunnel("t1", 1.0, node_id, "1.1.1.1", None, "", 1, "tls", 0, "[::]", "[::]", None)
            .await
            .unwrap();
        let user_id = store
            .insert_user("bob", "hash", 1, crate::store::now_millis() - 1_000, 10, 0, 5)
            .await
            .unwrap();
        let forward_id = store
            .insert_forward(user_id, "bob", "f1", tunnel_id, 10001, None, "10.0.0.1:80", "fifo", None)
            .await
            .unwrap();

        expire_users(&store).await;

        let user = store.get_user_by_id(user_id).await.unwrap();
        assert_eq!(user.status, 0);
        let forward = store.get_forward_by_id(forward_id).await.unwrap();
        assert_eq!(forward.lifecycle, "paused");
    }
}
