//! # Outbox Pump
//!
//! A ticking background task that drains the `outbox` table into live
//! Hub sends (§4.2). Claim, dispatch and mark-done/failed are three
//! separate round trips rather than one transaction — a crash between
//! claim and dispatch leaves a row `processing` forever, which is an
//! accepted gap (§9) rather than a guarantee this pump makes.

use std::time::Duration;

use tracing::{debug, warn};

use crate::hub::Hub;
use crate::protocol::OutboxMessage;
use crate::store::Store;

/// Runs until the process exits, ticking every `interval` and claiming at
/// most one outbox row per tick.
pub async fn run(store: Store, hub: Hub, interval: Duration, retry_delay: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        process_once(&store, &hub, retry_delay).await;
    }
}

async fn process_once(store: &Store, hub: &Hub, retry_delay: Duration) {
    let item = match store.claim_next_outbox().await {
        Ok(Some(item)) => item,
        Ok(None) => return,
        Err(err) => {
            warn!(%err, "outbox claim failed");
            return;
        }
    };

    let msg: OutboxMessage = match serde_json::from_str(&item.payload) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(id = item.id, %err, "outbox payload malformed, will retry");
            let _ = store.mark_outbox_failed(item.id, retry_delay.as_millis() as i64).await;
            return;
        }
    };

    match hub.send(msg.node_id, &msg.action, msg.data) {
        Ok(()) => {
            if let Err(err) = store.mark_outbox_done(item.id).await {
                warn!(id = item.id, %err, "failed to mark outbox row done");
            }
        }
        Err(err) => {
            debug!(id = item.id, node_id = msg.node_id, %err, "gost send failed, retrying later");
            let _ = store.mark_outbox_failed(item.id, retry_delay.as_millis() as i64).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dispatches_a_claimed_row_to_a_connected_node() {
        let store = test_store().await;
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(1, String::new(), tx);

        let payload = serde_json::to_string(&OutboxMessage {
            node_id: 1,
            action: "AddService".to_string(),
            data: json!({"name": "svc"}),
        })
        .unwrap();
        store.enqueue_outbox("AddService", &payload).await.unwrap();

        process_once(&store, &hub, Duration::from_millis(100)).await;

        let sent = rx.try_recv().unwrap();
        assert!(sent.contains("\"type\":\"AddService\""));
        assert!(store.claim_next_outbox().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_node_reschedules_the_row_for_retry() {
        let store = test_store().await;
        let hub = Hub::new();

        let payload = serde_json::to_string(&OutboxMessage {
            node_id: 99,
            action: "AddService".to_string(),
            data: json!({}),
        })
        .unwrap();
        store.enqueue_outbox("AddService", &payload).await.unwrap();

        process_once(&store, &hub, Duration::from_millis(50)).await;

        // not immediately claimable again: next_retry_at is in the future.
        assert!(store.claim_next_outbox().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.claim_next_outbox().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_payload_is_retried_not_dropped() {
        let store = test_store().await;
        let hub = Hub::new();
        store.enqueue_outbox("AddService", "not json").await.unwrap();

        process_once(&store, &hub, Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let item = store.claim_next_outbox().await.unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
    }
}
