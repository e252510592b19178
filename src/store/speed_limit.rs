//! SpeedLimit CRUD.

use super::{now_millis, SpeedLimit, Store};

const SPEED_COLUMNS: &str = "id, name, speed, tunnel_id, tunnel_name, created_time, updated_time, status";

impl Store {
    pub async fn get_speed_limit_by_id(&self, id: i64) -> Result<SpeedLimit, sqlx::Error> {
        sqlx::query_as::<_, SpeedLimit>(&format!("SELECT {SPEED_COLUMNS} FROM speed_limit WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_speed_limits(&self) -> Result<Vec<SpeedLimit>, sqlx::Error> {
        sqlx::query_as::<_, SpeedLimit>(&format!("SELECT {SPEED_COLUMNS} FROM speed_limit ORDER BY id"))
            .fetch_all(&self.pool)
            .await
    }

    pub async fn list_active_speed_limits_by_tunnel(
        &self,
        tunnel_id: i64,
    ) -> Result<Vec<SpeedLimit>, sqlx::Error> {
        sqlx::query_as::<_, SpeedLimit>(&format!(
            "SELECT {SPEED_COLUMNS} FROM speed_limit WHERE tunnel_id = ? AND status = 1 ORDER BY id"
        ))
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn insert_speed_limit(
        &self,
        name: &str,
        speed: i64,
        tunnel_id: i64,
        tunnel_name: &str,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO speed_limit(name, speed, tunnel_id, tunnel_name, created_time, updated_time, status)
             VALUES(?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(name)
        .bind(speed)
        .bind(tunnel_id)
        .bind(tunnel_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_speed_limit(&self, limit: &SpeedLimit) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE speed_limit SET name = ?, speed = ?, tunnel_id = ?, tunnel_name = ?, updated_time = ?, status = ? WHERE id = ?",
        )
        .bind(&limit.name)
        .bind(limit.speed)
        .bind(limit.tunnel_id)
        .bind(&limit.tunnel_name)
        .bind(now_millis())
        .bind(limit.status)
        .bind(limit.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_speed_limit(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM speed_limit WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
