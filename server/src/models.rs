//! # Durable Entities
//!
//! Row types for the relational store. Ports and statuses are stored as
//! SQLite integers (`i64`); list/map-valued columns (`path_node_ids`,
//! `iface_map`, `bind_map`, `path_ports`) are JSON text so the schema
//! stays flat while tunnels keep an ordered multi-hop path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Tunnel type: a plain port forward terminating at the entry (or its
/// path), or a relayed forward with a dedicated exit node.
pub const TUNNEL_PORT_FORWARD: i64 = 1;
pub const TUNNEL_TUNNEL_FORWARD: i64 = 2;

/// Flow accounting mode: `double` charges both directions, `single`
/// charges the larger one.
pub const FLOW_MODE_SINGLE: i64 = 1;
pub const FLOW_MODE_DOUBLE: i64 = 2;

pub const STATUS_PAUSED: i64 = 0;
pub const STATUS_ACTIVE: i64 = 1;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub secret: String,
    /// Address other nodes dial to reach this node's services.
    pub public_addr: String,
    /// Address the entry listener is published under.
    pub control_addr: String,
    pub port_min: i64,
    pub port_max: i64,
    pub status: i64,
    pub version: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Node {
    pub fn port_range(&self) -> (u16, u16) {
        (self.port_min as u16, self.port_max as u16)
    }

    pub fn contains_port(&self, port: i64) -> bool {
        port >= self.port_min && port <= self.port_max
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: i64,
    pub name: String,
    pub in_node_id: i64,
    pub out_node_id: Option<i64>,
    /// 1 = portForward, 2 = tunnelForward.
    pub kind: i64,
    /// JSON array of intermediate node ids, in traversal order.
    pub path_node_ids: Option<String>,
    /// JSON object: node id → outbound interface IP.
    pub iface_map: Option<String>,
    /// JSON object: node id → bind IP.
    pub bind_map: Option<String>,
    /// Default outbound interface when neither map nor forward names one.
    pub iface: Option<String>,
    pub flow_mode: i64,
    pub status: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Tunnel {
    pub fn path(&self) -> Vec<i64> {
        decode_id_list(self.path_node_ids.as_deref())
    }

    pub fn iface_for(&self, node_id: i64) -> Option<String> {
        decode_id_map(self.iface_map.as_deref()).remove(&node_id)
    }

    pub fn bind_for(&self, node_id: i64) -> Option<String> {
        decode_id_map(self.bind_map.as_deref()).remove(&node_id)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub name: String,
    pub in_port: i64,
    pub out_port: Option<i64>,
    /// JSON object: intermediate node id → listening port, fixed at
    /// create time so reconciliation stays deterministic.
    pub path_ports: Option<String>,
    pub remote_addr: String,
    pub iface: Option<String>,
    pub status: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Forward {
    pub fn path_port_map(&self) -> BTreeMap<i64, i64> {
        decode_id_map_i64(self.path_ports.as_deref())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    /// Quota in GiB; 0 disables the quota check.
    pub flow: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
    pub expires_at_ms: Option<i64>,
    pub status: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
    pub flow: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
    pub expires_at_ms: Option<i64>,
    pub status: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRuntime {
    pub node_id: i64,
    pub system_info: Option<String>,
    pub interfaces: Option<String>,
    pub services: Option<String>,
    pub updated_at_ms: i64,
}

impl NodeRuntime {
    /// Interface IPs reported by the agent, if any.
    pub fn interface_list(&self) -> Vec<String> {
        self.interfaces
            .as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOpLog {
    pub id: i64,
    pub diag_id: String,
    pub node_id: i64,
    pub cmd: String,
    pub request_id: String,
    pub success: bool,
    pub message: String,
    pub stdout: Option<String>,
    pub at_ms: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsFlow {
    pub id: i64,
    pub user_id: i64,
    /// Hour bucket, `"HH:00"` in UTC+8.
    pub time: String,
    pub flow: i64,
    pub total_flow: i64,
    pub created_at_ms: i64,
}

// ─── JSON column helpers ────────────────────────────────────────

pub fn encode_id_list(ids: &[i64]) -> Option<String> {
    if ids.is_empty() {
        None
    } else {
        serde_json::to_string(ids).ok()
    }
}

fn decode_id_list(raw: Option<&str>) -> Vec<i64> {
    raw.and_then(|s| serde_json::from_str::<Vec<i64>>(s).ok())
        .unwrap_or_default()
}

pub fn encode_id_map(map: &BTreeMap<i64, String>) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    let keyed: BTreeMap<String, &String> = map.iter().map(|(k, v)| (k.to_string(), v)).collect();
    serde_json::to_string(&keyed).ok()
}

fn decode_id_map(raw: Option<&str>) -> BTreeMap<i64, String> {
    raw.and_then(|s| serde_json::from_str::<BTreeMap<String, String>>(s).ok())
        .map(|m| {
            m.into_iter()
                .filter_map(|(k, v)| k.parse::<i64>().ok().map(|k| (k, v)))
                .collect()
        })
        .unwrap_or_default()
}

pub fn encode_port_map(map: &BTreeMap<i64, i64>) -> Option<String> {
    if map.is_empty() {
        return None;
    }
    let keyed: BTreeMap<String, i64> = map.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    serde_json::to_string(&keyed).ok()
}

fn decode_id_map_i64(raw: Option<&str>) -> BTreeMap<i64, i64> {
    raw.and_then(|s| serde_json::from_str::<BTreeMap<String, i64>>(s).ok())
        .map(|m| {
            m.into_iter()
                .filter_map(|(k, v)| k.parse::<i64>().ok().map(|k| (k, v)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_with(path: Option<&str>, ifaces: Option<&str>) -> Tunnel {
        Tunnel {
            id: 1,
            name: "t".into(),
            in_node_id: 1,
            out_node_id: None,
            kind: TUNNEL_PORT_FORWARD,
            path_node_ids: path.map(str::to_string),
            iface_map: ifaces.map(str::to_string),
            bind_map: None,
            iface: None,
            flow_mode: FLOW_MODE_DOUBLE,
            status: STATUS_ACTIVE,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn path_round_trips() {
        let t = tunnel_with(encode_id_list(&[4, 5]).as_deref(), None);
        assert_eq!(t.path(), vec![4, 5]);
        assert!(tunnel_with(None, None).path().is_empty());
        assert!(tunnel_with(Some("not json"), None).path().is_empty());
    }

    #[test]
    fn iface_map_lookup() {
        let t = tunnel_with(None, Some(r#"{"4":"10.126.126.4","5":"10.0.0.5"}"#));
        assert_eq!(t.iface_for(4).as_deref(), Some("10.126.126.4"));
        assert_eq!(t.iface_for(9), None);
    }

    #[test]
    fn port_map_round_trips() {
        let mut map = BTreeMap::new();
        map.insert(4_i64, 11000_i64);
        map.insert(5, 12000);
        let f = Forward {
            id: 1,
            user_id: 1,
            tunnel_id: 1,
            name: "f".into(),
            in_port: 10000,
            out_port: None,
            path_ports: encode_port_map(&map),
            remote_addr: "1.2.3.4:80".into(),
            iface: None,
            status: STATUS_ACTIVE,
            in_bytes: 0,
            out_bytes: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert_eq!(f.path_port_map(), map);
    }
}
