//! UserTunnel CRUD — the per-(user, tunnel) grant.

use super::{Store, UserTunnel};

const UT_COLUMNS: &str = "id, user_id, tunnel_id, speed_id, num, flow, in_flow, out_flow, flow_reset_time, exp_time, status";

impl Store {
    pub async fn get_user_tunnel_by_id(&self, id: i64) -> Result<UserTunnel, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(&format!("SELECT {UT_COLUMNS} FROM user_tunnel WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_user_tunnel_by_user_and_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<UserTunnel, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(&format!(
            "SELECT {UT_COLUMNS} FROM user_tunnel WHERE user_id = ? AND tunnel_id = ?"
        ))
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_user_tunnels_by_user(&self, user_id: i64) -> Result<Vec<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(&format!(
            "SELECT {UT_COLUMNS} FROM user_tunnel WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_user_tunnels_by_tunnel(&self, tunnel_id: i64) -> Result<Vec<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(&format!(
            "SELECT {UT_COLUMNS} FROM user_tunnel WHERE tunnel_id = ? ORDER BY id"
        ))
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
        speed_id: Option<i64>,
        num: i64,
        flow: i64,
        exp_time: i64,
    ) -> Result<i64, sqlx::Error> {
        let res = sqlx::query(
            "INSERT INTO user_tunnel(user_id, tunnel_id, speed_id, num, flow, in_flow, out_flow, flow_reset_time, exp_time, status)
             VALUES(?, ?, ?, ?, ?, 0, 0, 0, ?, 1)",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .bind(speed_id)
        .bind(num)
        .bind(flow)
        .bind(exp_time)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_user_tunnel(&self, ut: &UserTunnel) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_tunnel SET speed_id = ?, num = ?, flow = ?, in_flow = ?, out_flow = ?, flow_reset_time = ?, exp_time = ?, status = ? WHERE id = ?",
        )
        .bind(ut.speed_id)
        .bind(ut.num)
        .bind(ut.flow)
        .bind(ut.in_flow)
        .bind(ut.out_flow)
        .bind(ut.flow_reset_time)
        .bind(ut.exp_time)
        .bind(ut.status)
        .bind(ut.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_user_tunnel_status(&self, id: i64, status: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user_tunnel SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_user_tunnel(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user_tunnel WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_forwards_by_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(1) FROM forward WHERE user_id = ? AND tunnel_id = ?",
        )
        .bind(user_id)
        .bind(tunnel_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn reset_expired_user_tunnel_flows(
        &self,
        day: i64,
        last_day: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_tunnel SET in_flow = 0, out_flow = 0 WHERE flow_reset_time != 0 AND (flow_reset_time = ? OR (flow_reset_time > ? AND ? = ?))",
        )
        .bind(day)
        .bind(last_day)
        .bind(day)
        .bind(last_day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_expired_active_user_tunnels(
        &self,
        now_ms: i64,
    ) -> Result<Vec<UserTunnel>, sqlx::Error> {
        sqlx::query_as::<_, UserTunnel>(&format!(
            "SELECT {UT_COLUMNS} FROM user_tunnel WHERE status = 1 AND exp_time != 0 AND exp_time < ?"
        ))
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
    }
}
