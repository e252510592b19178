//! Forward CRUD plus node port allocation (§4.4).

use std::collections::HashSet;

use super::{now_millis, Forward, ForwardWithTunnel, Store};

const FORWARD_COLUMNS: &str = "id, user_id, user_name, name, tunnel_id, in_port, out_port, remote_addr, strategy, interface_name, in_flow, out_flow, created_time, updated_time, status, inx, lifecycle";

impl Store {
    pub async fn get_forward_by_id(&self, id: i64) -> Result<Forward, sqlx::Error> {
        sqlx::query_as::<_, Forward>(&format!("SELECT {FORWARD_COLUMNS} FROM forward WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_forwards_by_user(&self, user_id: i64) -> Result<Vec<ForwardWithTunnel>, sqlx::Error> {
        sqlx::query_as::<_, ForwardWithTunnel>(&format!(
            "SELECT f.id, f.user_id, f.user_name, f.name, f.tunnel_id, f.in_port, f.out_port, f.remote_addr, f.strategy, f.interface_name, f.in_flow, f.out_flow, f.created_time, f.updated_time, f.status, f.inx, f.lifecycle,
             t.in_node_id, t.out_node_id, t.type AS tunnel_type
             FROM forward f JOIN tunnel t ON f.tunnel_id = t.id WHERE f.user_id = ? ORDER BY f.inx, f.id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_forwards_all(&self) -> Result<Vec<ForwardWithTunnel>, sqlx::Error> {
        sqlx::query_as::<_, ForwardWithTunnel>(&format!(
            "SELECT f.id, f.user_id, f.user_name, f.name, f.tunnel_id, f.in_port, f.out_port, f.remote_addr, f.strategy, f.interface_name, f.in_flow, f.out_flow, f.created_time, f.updated_time, f.status, f.inx, f.lifecycle,
             t.in_node_id, t.out_node_id, t.type AS tunnel_type
             FROM forward f JOIN tunnel t ON f.tunnel_id = t.id ORDER BY f.inx, f.id"
        ))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn list_forwards_by_tunnel(&self, tunnel_id: i64) -> Result<Vec<Forward>, sqlx::Error> {
        sqlx::query_as::<_, Forward>(&format!(
            "SELECT {FORWARD_COLUMNS} FROM forward WHERE tunnel_id = ?"
        ))
        .bind(tunnel_id)
        .fetch_all(&self.pool)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_forward(
        &self,
        user_id: i64,
        user_name: &str,
        name: &str,
        tunnel_id: i64,
        in_port: i64,
        out_port: Option<i64>,
        remote_addr: &str,
        strategy: &str,
        interface_name: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO forward(user_id, user_name, name, tunnel_id, in_port, out_port, remote_addr, strategy, interface_name, in_flow, out_flow, created_time, updated_time, status, inx, lifecycle)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, 1, 0, 'creating')",
        )
        .bind(user_id)
        .bind(user_name)
        .bind(name)
        .bind(tunnel_id)
        .bind(in_port)
        .bind(out_port)
        .bind(remote_addr)
        .bind(strategy)
        .bind(interface_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_forward(&self, fw: &Forward) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE forward SET user_id = ?, user_name = ?, name = ?, tunnel_id = ?, in_port = ?, out_port = ?, remote_addr = ?, strategy = ?, interface_name = ?, updated_time = ?, status = ?, inx = ?, lifecycle = ? WHERE id = ?",
        )
        .bind(fw.user_id)
        .bind(&fw.user_name)
        .bind(&fw.name)
        .bind(fw.tunnel_id)
        .bind(fw.in_port)
        .bind(fw.out_port)
        .bind(&fw.remote_addr)
        .bind(&fw.strategy)
        .bind(&fw.interface_name)
        .bind(now_millis())
        .bind(fw.status)
        .bind(fw.inx)
        .bind(&fw.lifecycle)
        .bind(fw.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_forward_status(
        &self,
        id: i64,
        status: i64,
        lifecycle: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE forward SET status = ?, lifecycle = ?, updated_time = ? WHERE id = ?")
            .bind(status)
            .bind(lifecycle)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_forward_order(&self, id: i64, inx: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE forward SET inx = ? WHERE id = ?")
            .bind(inx)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_forward(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM forward WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_forwards_by_tunnel(&self, tunnel_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(1) FROM forward WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Every in-port and out-port currently claimed on `node_id`, across
    /// both tunnel directions, excluding `exclude_id` (the forward being
    /// edited, if any) so a no-op port reassignment doesn't self-collide.
    pub async fn list_used_ports_on_node(
        &self,
        node_id: i64,
        exclude_id: Option<i64>,
    ) -> Result<HashSet<i64>, sqlx::Error> {
        let mut used = HashSet::new();

        let in_ports: Vec<(i64,)> = sqlx::query_as(
            "SELECT f.in_port FROM forward f JOIN tunnel t ON f.tunnel_id = t.id
             WHERE t.in_node_id = ? AND (? IS NULL OR f.id != ?)",
        )
        .bind(node_id)
        .bind(exclude_id)
        .bind(exclude_id)
        .fetch_all(&self.pool)
        .await?;
        used.extend(in_ports.into_iter().map(|(p,)| p));

        let out_ports: Vec<(i64,)> = sqlx::query_as(
            "SELECT f.out_port FROM forward f JOIN tunnel t ON f.tunnel_id = t.id
             WHERE t.out_node_id = ? AND f.out_port IS NOT NULL AND (? IS NULL OR f.id != ?)",
        )
        .bind(node_id)
        .bind(exclude_id)
        .bind(exclude_id)
        .fetch_all(&self.pool)
        .await?;
        used.extend(out_ports.into_iter().map(|(p,)| p));

        Ok(used)
    }

    /// Whether `port` sits within `node_id`'s configured range and is not
    /// already claimed on that node (excluding `exclude_id`).
    pub async fn is_in_port_available(
        &self,
        node_id: i64,
        port: i64,
        exclude_id: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let node = self.get_node_by_id(node_id).await?;
        if port < node.port_sta || port > node.port_end {
            return Ok(false);
        }
        let used = self.list_used_ports_on_node(node_id, exclude_id).await?;
        Ok(!used.contains(&port))
    }

    /// Lowest free port in `node_id`'s range, excluding `exclude_id`'s own
    /// claim. Advisory only — no reservation row is written (§4.4). `None`
    /// means the node's range is exhausted.
    pub async fn allocate_port_for_node(
        &self,
        node_id: i64,
        exclude_id: Option<i64>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let node = self.get_node_by_id(node_id).await?;
        let used = self.list_used_ports_on_node(node_id, exclude_id).await?;
        Ok((node.port_sta..=node.port_end).find(|p| !used.contains(p)))
    }
}
