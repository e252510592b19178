//! Tunnel CRUD.

use super::{now_millis, Store, Tunnel};

const TUNNEL_COLUMNS: &str = "id, name, traffic_ratio, in_node_id, in_ip, out_node_id, out_ip, type, protocol, flow, tcp_listen_addr, udp_listen_addr, interface_name, created_time, updated_time, status";

impl Store {
    pub async fn get_tunnel_by_id(&self, id: i64) -> Result<Tunnel, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(&format!("SELECT {TUNNEL_COLUMNS} FROM tunnel WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn list_tunnels(&self) -> Result<Vec<Tunnel>, sqlx::Error> {
        sqlx::query_as::<_, Tunnel>(&format!("SELECT {TUNNEL_COLUMNS} FROM tunnel ORDER BY id"))
            .fetch_all(&self.pool)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_tunnel(
        &self,
        name: &str,
        traffic_ratio: f64,
        in_node_id: i64,
        in_ip: &str,
        out_node_id: Option<i64>,
        out_ip: &str,
        tunnel_type: i64,
        protocol: &str,
        flow: i64,
        tcp_listen_addr: &str,
        udp_listen_addr: &str,
        interface_name: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let now = now_millis();
        let res = sqlx::query(
            "INSERT INTO tunnel(name, traffic_ratio, in_node_id, in_ip, out_node_id, out_ip, type, protocol, flow, tcp_listen_addr, udp_listen_addr, interface_name, created_time, updated_time, status)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(name)
        .bind(traffic_ratio)
        .bind(in_node_id)
        .bind(in_ip)
        .bind(out_node_id)
        .bind(out_ip)
        .bind(tunnel_type)
        .bind(protocol)
        .bind(flow)
        .bind(tcp_listen_addr)
        .bind(udp_listen_addr)
        .bind(interface_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_tunnel(&self, tunnel: &Tunnel) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tunnel SET name = ?, traffic_ratio = ?, in_node_id = ?, in_ip = ?, out_node_id = ?, out_ip = ?, type = ?, protocol = ?, flow = ?, tcp_listen_addr = ?, udp_listen_addr = ?, interface_name = ?, updated_time = ?, status = ? WHERE id = ?",
        )
        .bind(&tunnel.name)
        .bind(tunnel.traffic_ratio)
        .bind(tunnel.in_node_id)
        .bind(&tunnel.in_ip)
        .bind(tunnel.out_node_id)
        .bind(&tunnel.out_ip)
        .bind(tunnel.tunnel_type)
        .bind(&tunnel.protocol)
        .bind(tunnel.flow)
        .bind(&tunnel.tcp_listen_addr)
        .bind(&tunnel.udp_listen_addr)
        .bind(&tunnel.interface_name)
        .bind(now_millis())
        .bind(tunnel.status)
        .bind(tunnel.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM tunnel WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_tunnels_by_node(&self, node_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(1) FROM tunnel WHERE in_node_id = ? OR out_node_id = ?")
                .bind(node_id)
                .bind(node_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Pushes a changed node IP onto every tunnel that names that node as
    /// its in-node, so a node-update handler's IP change stays consistent
    /// with the tunnels it backs.
    pub async fn update_tunnels_in_ip(&self, node_id: i64, ip: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tunnel SET in_ip = ?, updated_time = ? WHERE in_node_id = ?")
            .bind(ip)
            .bind(now_millis())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_tunnels_out_ip(&self, node_id: i64, ip: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tunnel SET out_ip = ?, updated_time = ? WHERE out_node_id = ?")
            .bind(ip)
            .bind(now_millis())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
