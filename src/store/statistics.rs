//! Statistics CRUD — hourly flow rollups retained per §4.7.

use super::{now_millis, StatisticsFlow, Store};

impl Store {
    pub async fn list_recent_statistics(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<StatisticsFlow>, sqlx::Error> {
        sqlx::query_as::<_, StatisticsFlow>(
            "SELECT id, user_id, flow, total_flow, time, created_time
             FROM statistics_flow WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Returns the most recent `total_flow` recorded for `user_id`, or 0
    /// if no row exists yet — the running total the next rollup's delta
    /// is computed against (§4.7).
    pub async fn last_total_flow(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT total_flow FROM statistics_flow WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(t,)| t).unwrap_or(0))
    }

    /// Inserts a batch of rollup rows inside a single `BEGIN IMMEDIATE`
    /// transaction so a crash mid-batch can't leave a partial hour
    /// recorded.
    pub async fn insert_statistics(&self, items: Vec<(i64, i64, i64, String)>) -> Result<(), sqlx::Error> {
        if items.is_empty() {
            return Ok(());
        }
        let now = now_millis();
        self.run_immediate(move |conn| {
            Box::pin(async move {
                for (user_id, flow, total_flow, time) in items {
                    sqlx::query(
                        "INSERT INTO statistics_flow(user_id, flow, total_flow, time, created_time) VALUES(?, ?, ?, ?, ?)",
                    )
                    .bind(user_id)
                    .bind(flow)
                    .bind(total_flow)
                    .bind(time)
                    .bind(now)
                    .execute(&mut *conn)
                    .await?;
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn delete_statistics_older_than(&self, cutoff_ms: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM statistics_flow WHERE created_time < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_statistics_by_user(&self, user_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM statistics_flow WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
