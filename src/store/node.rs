//! Node CRUD.

use super::{now_millis, Node, Store};

impl Store {
    pub async fn get_node_by_id(&self, id: i64) -> Result<Node, sqlx::Error> {
        sqlx::query_as::<_, Node>(
            "SELECT id, name, secret, ip, server_ip, port_sta, port_end, version, http, tls, socks, created_time, updated_time, status
             FROM node WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_node_by_secret(&self, secret: &str) -> Result<Node, sqlx::Error> {
        sqlx::query_as::<_, Node>(
            "SELECT id, name, secret, ip, server_ip, port_sta, port_end, version, http, tls, socks, created_time, updated_time, status
             FROM node WHERE secret = ?",
        )
        .bind(secret)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, sqlx::Error> {
        sqlx::query_as::<_, Node>(
            "SELECT id, name, secret, ip, server_ip, port_sta, port_end, version, http, tls, socks, created_time, updated_time, status
             FROM node ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_node(
        &self,
        name: &str,
        secret: &str,
        ip: Option<&str>,
        server_ip: &str,
        port_sta: i64,
        port_end: i64,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO node(name, secret, ip, server_ip, port_sta, port_end, version, http, tls, socks, created_time, updated_time, status)
             VALUES(?, ?, ?, ?, ?, ?, NULL, 0, 0, 0, ?, ?, 0)",
        )
        .bind(name)
        .bind(secret)
        .bind(ip)
        .bind(server_ip)
        .bind(port_sta)
        .bind(port_end)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_node(&self, node: &Node) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE node SET name = ?, ip = ?, server_ip = ?, port_sta = ?, port_end = ?, updated_time = ?, status = ? WHERE id = ?",
        )
        .bind(&node.name)
        .bind(&node.ip)
        .bind(&node.server_ip)
        .bind(node.port_sta)
        .bind(node.port_end)
        .bind(now_millis())
        .bind(node.status)
        .bind(node.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates liveness plus the capability flags reported at connect
    /// time (`version,http,tls,socks`); unset flags keep their prior
    /// value via `COALESCE`.
    pub async fn update_node_status(
        &self,
        id: i64,
        status: i64,
        version: Option<&str>,
        http: Option<i64>,
        tls: Option<i64>,
        socks: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE node SET status = ?, version = COALESCE(?, version), http = COALESCE(?, http), tls = COALESCE(?, tls), socks = COALESCE(?, socks), updated_time = ? WHERE id = ?",
        )
        .bind(status)
        .bind(version)
        .bind(http)
        .bind(tls)
        .bind(socks)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_node(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM node WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
