//! # Command Codec
//!
//! Pure functions turning (forward, tunnel, limiter, …) into agent wire
//! payloads. No I/O, no state — deterministic for given inputs, which is
//! what lets the outbox replay a payload at-least-once without an agent
//! ever seeing two different configs for the same name (§4.4).

use serde_json::{json, Value};

/// Tunnel shape needed to build a service/chain payload. Deliberately a
/// narrow view of the `Tunnel` entity rather than the entity itself, so
/// the codec stays decoupled from the store.
#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig<'a> {
    pub tunnel_type: i64,
    pub protocol: &'a str,
    pub tcp_listen_addr: &'a str,
    pub udp_listen_addr: &'a str,
}

/// Builds the deterministic agent-side resource name:
/// `<forwardID>_<userID>_<userTunnelID>`. `userTunnelID = 0` is used
/// literally for admin-owned forwards without a grant row — this keeps
/// naming total (§9).
pub fn service_base_name(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> String {
    format!("{forward_id}_{user_id}_{user_tunnel_id}")
}

/// `AddLimiters`/`UpdateLimiters` bandwidth conversion: Mbps (UI) to
/// bytes/second (wire), floored. The two-bucket (`$`, `$$`) shape with
/// identical limits is the authoritative payload per §9's open question.
fn bytes_per_second(mbps: i64) -> i64 {
    (mbps * 1024 * 1024) / 8
}

pub fn add_limiters_data(limiter_id: i64, speed_mbps: i64) -> Value {
    let bps = bytes_per_second(speed_mbps);
    json!({
        "name": limiter_id.to_string(),
        "limits": [format!("$ {bps}"), format!("$$ {bps}")],
    })
}

pub fn update_limiters_data(limiter_id: i64, speed_mbps: i64) -> Value {
    json!({
        "limiter": limiter_id.to_string(),
        "data": add_limiters_data(limiter_id, speed_mbps),
    })
}

pub fn delete_limiters_data(limiter_id: i64) -> Value {
    json!({ "limiter": limiter_id.to_string() })
}

fn forwarder(remote_addr: &str, strategy: &str) -> Value {
    let nodes: Vec<Value> = remote_addr
        .split(',')
        .enumerate()
        .map(|(idx, addr)| {
            json!({
                "name": format!("node_{}", idx + 1),
                "addr": addr.trim(),
            })
        })
        .collect();
    let strategy = if strategy.trim().is_empty() { "fifo" } else { strategy };
    json!({
        "nodes": nodes,
        "selector": { "strategy": strategy, "maxFails": 1, "failTimeout": "600s" },
    })
}

fn handler(protocol: &str, base_name: &str, tunnel_type: i64) -> Value {
    let mut h = json!({ "type": protocol });
    if tunnel_type != 1 {
        h["chain"] = json!(format!("{base_name}_chains"));
    }
    h
}

fn listener(protocol: &str) -> Value {
    let mut l = json!({ "type": protocol });
    if protocol == "udp" {
        l["metadata"] = json!({ "keepAlive": true });
    }
    l
}

fn service_config(
    base_name: &str,
    in_port: i64,
    limiter_id: Option<i64>,
    remote_addr: &str,
    protocol: &str,
    tunnel: TunnelConfig,
    strategy: &str,
    interface_name: Option<&str>,
) -> Value {
    let listen_addr = if protocol == "tcp" {
        tunnel.tcp_listen_addr
    } else {
        tunnel.udp_listen_addr
    };

    let mut svc = json!({
        "name": format!("{base_name}_{protocol}"),
        "addr": format!("{listen_addr}:{in_port}"),
        "handler": handler(protocol, base_name, tunnel.tunnel_type),
        "listener": listener(protocol),
    });

    if let Some(iface) = interface_name.filter(|s| !s.trim().is_empty()) {
        svc["metadata"] = json!({ "interface": iface });
    }
    if let Some(id) = limiter_id {
        svc["limiter"] = json!(id.to_string());
    }
    if tunnel.tunnel_type == 1 {
        svc["forwarder"] = forwarder(remote_addr, strategy);
    }
    svc
}

/// `AddService`/`UpdateService`: an array of a TCP and a UDP service
/// config for the ingress side of a forward.
pub fn add_service_data(
    base_name: &str,
    in_port: i64,
    limiter_id: Option<i64>,
    remote_addr: &str,
    tunnel: TunnelConfig,
    strategy: &str,
    interface_name: Option<&str>,
) -> Value {
    json!([
        service_config(base_name, in_port, limiter_id, remote_addr, "tcp", tunnel, strategy, interface_name),
        service_config(base_name, in_port, limiter_id, remote_addr, "udp", tunnel, strategy, interface_name),
    ])
}

pub fn update_service_data(
    base_name: &str,
    in_port: i64,
    limiter_id: Option<i64>,
    remote_addr: &str,
    tunnel: TunnelConfig,
    strategy: &str,
    interface_name: Option<&str>,
) -> Value {
    add_service_data(base_name, in_port, limiter_id, remote_addr, tunnel, strategy, interface_name)
}

pub fn delete_service_data(base_name: &str) -> Value {
    json!({ "services": [format!("{base_name}_tcp"), format!("{base_name}_udp")] })
}

pub fn pause_service_data(base_name: &str) -> Value {
    delete_service_data(base_name)
}

pub fn resume_service_data(base_name: &str) -> Value {
    delete_service_data(base_name)
}

fn dialer(protocol: &str) -> Value {
    let mut d = json!({ "type": protocol });
    if protocol == "quic" {
        d["metadata"] = json!({ "keepAlive": true, "ttl": "10s" });
    }
    d
}

fn chains_body(base_name: &str, remote_addr: &str, protocol: &str, interface_name: Option<&str>) -> Value {
    let mut node = json!({
        "name": format!("node-{base_name}"),
        "addr": remote_addr,
        "connector": { "type": "relay" },
        "dialer": dialer(protocol),
    });
    if let Some(iface) = interface_name.filter(|s| !s.trim().is_empty()) {
        node["interface"] = json!(iface);
    }
    let hop = json!({ "name": format!("hop-{base_name}"), "nodes": [node] });
    json!({ "name": format!("{base_name}_chains"), "hops": [hop] })
}

/// `AddChains`: the chain definition pointing a single hop/node at
/// `outIP:outPort` for a type=2 tunnel's ingress side.
pub fn add_chains_data(base_name: &str, remote_addr: &str, protocol: &str, interface_name: Option<&str>) -> Value {
    chains_body(base_name, remote_addr, protocol, interface_name)
}

pub fn update_chains_data(base_name: &str, remote_addr: &str, protocol: &str, interface_name: Option<&str>) -> Value {
    json!({
        "chain": format!("{base_name}_chains"),
        "data": chains_body(base_name, remote_addr, protocol, interface_name),
    })
}

pub fn delete_chains_data(base_name: &str) -> Value {
    json!({ "chain": format!("{base_name}_chains") })
}

/// `AddRemoteService`: the egress relay listener plus a forwarder toward
/// `remote_addr`, for the out-node of a type=2 tunnel.
pub fn add_remote_service_data(
    base_name: &str,
    out_port: i64,
    remote_addr: &str,
    protocol: &str,
    strategy: &str,
    interface_name: Option<&str>,
) -> Value {
    let mut svc = json!({
        "name": format!("{base_name}_tls"),
        "addr": format!(":{out_port}"),
        "handler": { "type": "relay" },
        "listener": { "type": protocol },
    });
    if let Some(iface) = interface_name.filter(|s| !s.trim().is_empty()) {
        svc["metadata"] = json!({ "interface": iface });
    }
    svc["forwarder"] = forwarder(remote_addr, strategy);
    json!([svc])
}

pub fn update_remote_service_data(
    base_name: &str,
    out_port: i64,
    remote_addr: &str,
    protocol: &str,
    strategy: &str,
    interface_name: Option<&str>,
) -> Value {
    add_remote_service_data(base_name, out_port, remote_addr, protocol, strategy, interface_name)
}

pub fn delete_remote_service_data(base_name: &str) -> Value {
    json!({ "services": [format!("{base_name}_tls")] })
}

pub fn pause_remote_service_data(base_name: &str) -> Value {
    delete_remote_service_data(base_name)
}

pub fn resume_remote_service_data(base_name: &str) -> Value {
    delete_remote_service_data(base_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type1_tunnel() -> TunnelConfig<'static> {
        TunnelConfig {
            tunnel_type: 1,
            protocol: "tls",
            tcp_listen_addr: "[::]",
            udp_listen_addr: "[::]",
        }
    }

    #[test]
    fn service_name_is_deterministic() {
        assert_eq!(service_base_name(42, 7, 0), "42_7_0");
        assert_eq!(
            service_base_name(42, 7, 0),
            service_base_name(42, 7, 0)
        );
    }

    #[test]
    fn add_service_emits_tcp_and_udp_twin() {
        let name = service_base_name(1, 7, 0);
        let data = add_service_data(&name, 10000, None, "1.2.3.4:80", type1_tunnel(), "fifo", None);
        let arr = data.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["name"], "1_7_0_tcp");
        assert_eq!(arr[0]["addr"], "[::]:10000");
        assert_eq!(arr[1]["name"], "1_7_0_udp");
        assert_eq!(
            arr[0]["forwarder"]["nodes"][0]["addr"],
            "1.2.3.4:80"
        );
        assert_eq!(arr[0]["forwarder"]["selector"]["strategy"], "fifo");
    }

    #[test]
    fn type2_service_references_chain_and_omits_forwarder() {
        let tunnel = TunnelConfig {
            tunnel_type: 2,
            protocol: "quic",
            tcp_listen_addr: "[::]",
            udp_listen_addr: "[::]",
        };
        let name = service_base_name(5, 7, 3);
        let data = add_service_data(&name, 10005, None, "ignored", tunnel, "fifo", None);
        let arr = data.as_array().unwrap();
        assert_eq!(arr[0]["handler"]["chain"], "5_7_3_chains");
        assert!(arr[0].get("forwarder").is_none());
    }

    #[test]
    fn chains_uses_quic_dialer_metadata() {
        let data = add_chains_data("5_7_3", "10.0.0.2:20000", "quic", None);
        assert_eq!(data["hops"][0]["nodes"][0]["dialer"]["type"], "quic");
        assert_eq!(data["hops"][0]["nodes"][0]["dialer"]["metadata"]["ttl"], "10s");
        assert_eq!(data["name"], "5_7_3_chains");
    }

    #[test]
    fn limiter_conversion_floors_and_duplicates_buckets() {
        let data = add_limiters_data(9, 100);
        let expected_bps = (100i64 * 1024 * 1024) / 8;
        assert_eq!(data["limits"][0], format!("$ {expected_bps}"));
        assert_eq!(data["limits"][1], format!("$$ {expected_bps}"));
    }

    #[test]
    fn delete_pause_resume_carry_name_list_only() {
        let del = delete_service_data("1_7_0");
        assert_eq!(del["services"], json!(["1_7_0_tcp", "1_7_0_udp"]));
        assert_eq!(pause_service_data("1_7_0"), del);
        assert_eq!(resume_service_data("1_7_0"), del);
    }

    #[test]
    fn multi_hop_remote_addr_preserves_order() {
        let data = forwarder("1.1.1.1:80, 2.2.2.2:80,3.3.3.3:80", "round");
        let nodes = data["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["addr"], "1.1.1.1:80");
        assert_eq!(nodes[1]["addr"], "2.2.2.2:80");
        assert_eq!(nodes[2]["addr"], "3.3.3.3:80");
    }

    #[test]
    fn interface_hint_only_set_when_non_blank() {
        let tunnel = type1_tunnel();
        let with_iface = add_service_data("1_7_0", 1000, None, "a:1", tunnel, "fifo", Some("eth0"));
        assert_eq!(with_iface[0]["metadata"]["interface"], "eth0");
        let without = add_service_data("1_7_0", 1000, None, "a:1", tunnel, "fifo", Some("  "));
        assert!(without[0].get("metadata").is_none());
    }
}
