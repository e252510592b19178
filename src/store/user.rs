//! User CRUD.

use super::{now_millis, Store, User};

const USER_COLUMNS: &str = "id, user, pwd, role_id, exp_time, flow, in_flow, out_flow, flow_reset_time, num, created_time, updated_time, status";

impl Store {
    pub async fn get_user_by_id(&self, id: i64) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM user WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM user WHERE user = ?"))
            .bind(username)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_users(&self) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM user ORDER BY id"))
            .fetch_all(&self.pool)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_user(
        &self,
        username: &str,
        pwd_hash: &str,
        role_id: i64,
        exp_time: i64,
        flow: i64,
        flow_reset_time: i64,
        num: i64,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO user(user, pwd, role_id, exp_time, flow, in_flow, out_flow, flow_reset_time, num, created_time, updated_time, status)
             VALUES(?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?, 1)",
        )
        .bind(username)
        .bind(pwd_hash)
        .bind(role_id)
        .bind(exp_time)
        .bind(flow)
        .bind(flow_reset_time)
        .bind(num)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_user(&self, user: &User) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user SET pwd = ?, role_id = ?, exp_time = ?, flow = ?, flow_reset_time = ?, num = ?, updated_time = ?, status = ? WHERE id = ?",
        )
        .bind(&user.pwd)
        .bind(user.role_id)
        .bind(user.exp_time)
        .bind(user.flow)
        .bind(user.flow_reset_time)
        .bind(user.num)
        .bind(now_millis())
        .bind(user.status)
        .bind(user.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_user_status(&self, id: i64, status: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user SET status = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reset_user_flow(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE user SET in_flow = 0, out_flow = 0, updated_time = ? WHERE id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM user WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_forwards_by_user(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(1) FROM forward WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Users whose monthly counters should reset today, per the
    /// last-day-of-month carry rule (§4.7).
    pub async fn reset_expired_user_flows(
        &self,
        day: i64,
        last_day: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user SET in_flow = 0, out_flow = 0, updated_time = ? WHERE flow_reset_time != 0 AND (flow_reset_time = ? OR (flow_reset_time > ? AND ? = ?))",
        )
        .bind(now_millis())
        .bind(day)
        .bind(last_day)
        .bind(day)
        .bind(last_day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tenant users (`role_id != 0`) that are still active but have
    /// expired as of `now_ms`.
    pub async fn list_expired_active_users(&self, now_ms: i64) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM user WHERE role_id != 0 AND status = 1 AND exp_time != 0 AND exp_time < ?"
        ))
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
    }
}
