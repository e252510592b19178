//! # Persistent Store
//!
//! Typed CRUD on every entity plus the one critical primitive:
//! [`Store::run_immediate`], a serialized, write-locked transaction on a
//! dedicated connection (`BEGIN IMMEDIATE`). Multi-row invariants — flow
//! counters, outbox claim — are only ever mutated inside it (§4.1).

pub mod forward;
pub mod models;
pub mod node;
pub mod speed_limit;
pub mod statistics;
pub mod tunnel;
pub mod user;
pub mod user_tunnel;

pub use models::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the epoch, the timestamp unit used throughout the
/// schema (`created_time`, `next_retry_at`, …).
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone)]
pub struct Store {
    /// Main pool: concurrent readers and single-row writers.
    pool: SqlitePool,
    /// Dedicated single-connection pool reserved for `run_immediate` so a
    /// `BEGIN IMMEDIATE` transaction never contends with itself.
    immediate_pool: SqlitePool,
}

impl Store {
    /// Opens (creating if necessary) the SQLite database at `path`, runs
    /// embedded migrations, and configures WAL journaling + a busy
    /// timeout generous enough for single-writer concurrency (§4.1).
    pub async fn connect(path: &str) -> Result<Self, sqlx::Error> {
        let opts = connect_options(path)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts.clone())
            .await?;

        let immediate_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, immediate_pool })
    }

    /// Wraps an already-open pool pair, for tests that want an in-memory
    /// database shared between the main and immediate pools.
    pub fn from_pools(pool: SqlitePool, immediate_pool: SqlitePool) -> Self {
        Self { pool, immediate_pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs `fn` inside a `BEGIN IMMEDIATE` transaction on the dedicated
    /// immediate connection, committing on `Ok` and rolling back on `Err`.
    /// This is the only context in which multi-row invariants may be
    /// updated.
    pub async fn run_immediate<F, T>(&self, f: F) -> Result<T, sqlx::Error>
    where
        for<'c> F: FnOnce(
            &'c mut sqlx::SqliteConnection,
        ) -> futures::future::BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        let mut conn = self.immediate_pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match f(&mut conn).await {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    /// Atomically increments `forward`, `user` and (if nonzero)
    /// `user_tunnel` flow counters. Fails the whole transaction if any
    /// target row is missing (§4.1, invariant 4 of §8).
    pub async fn apply_flow(
        &self,
        forward_id: i64,
        user_id: i64,
        user_tunnel_id: i64,
        down: i64,
        up: i64,
    ) -> Result<(), sqlx::Error> {
        self.run_immediate(move |conn| {
            Box::pin(async move {
                let res = sqlx::query(
                    "UPDATE forward SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?",
                )
                .bind(down)
                .bind(up)
                .bind(forward_id)
                .execute(&mut *conn)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }

                let res = sqlx::query(
                    "UPDATE user SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?",
                )
                .bind(down)
                .bind(up)
                .bind(user_id)
                .execute(&mut *conn)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }

                if user_tunnel_id != 0 {
                    let res = sqlx::query(
                        "UPDATE user_tunnel SET in_flow = in_flow + ?, out_flow = out_flow + ? WHERE id = ?",
                    )
                    .bind(down)
                    .bind(up)
                    .bind(user_tunnel_id)
                    .execute(&mut *conn)
                    .await?;
                    if res.rows_affected() == 0 {
                        return Err(sqlx::Error::RowNotFound);
                    }
                }

                Ok(())
            })
        })
        .await
    }

    /// Enqueues a new outbox row. Returns the persistent id; the caller
    /// (the reconciler) must treat a failed enqueue as making the whole
    /// mutation fail (§4.2).
    pub async fn enqueue_outbox(&self, kind: &str, payload: &str) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO outbox(type, payload, status, retry_count, next_retry_at, created_at, updated_at)
             VALUES(?, ?, 'pending', 0, NULL, ?, ?)",
        )
        .bind(kind)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Atomically picks the least-id pending row whose `next_retry_at` is
    /// due, marks it `processing`, and returns it (§4.1, §4.2).
    pub async fn claim_next_outbox(&self) -> Result<Option<OutboxItem>, sqlx::Error> {
        self.run_immediate(|conn| {
            Box::pin(async move {
                let now = now_millis();
                let item = sqlx::query_as::<_, OutboxItem>(
                    "SELECT id, type, payload, status, retry_count, next_retry_at, created_at, updated_at
                     FROM outbox
                     WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
                     ORDER BY id LIMIT 1",
                )
                .bind(now)
                .fetch_optional(&mut *conn)
                .await?;

                let Some(item) = item else {
                    return Ok(None);
                };

                sqlx::query("UPDATE outbox SET status = 'processing', updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(item.id)
                    .execute(&mut *conn)
                    .await?;

                Ok(Some(item))
            })
        })
        .await
    }

    pub async fn mark_outbox_done(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE outbox SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reverts a claimed row back to `pending`, bumps `retry_count`, and
    /// schedules `next_retry_at` `delay_ms` in the future.
    pub async fn mark_outbox_failed(&self, id: i64, delay_ms: i64) -> Result<(), sqlx::Error> {
        let now = now_millis();
        sqlx::query(
            "UPDATE outbox SET status = 'pending', retry_count = retry_count + 1, next_retry_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now + delay_ms)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// A fresh, migrated store backed by a uniquely-named temp file, for use
/// by other modules' `#[cfg(test)]` suites that need real SQLite
/// semantics (foreign keys, `BEGIN IMMEDIATE`) rather than a mock.
#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    let path = std::env::temp_dir().join(format!("tunnel-control-plane-test-{}.db", uuid::Uuid::new_v4()));
    Store::connect(path.to_str().unwrap()).await.unwrap()
}

fn connect_options(path: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .foreign_keys(true);
    Ok(opts)
}
