//! # Service Planner
//!
//! Compiles a `(forward, tunnel)` pair into the concrete per-node
//! service definitions the agents realize, and allocates listening ports
//! against live agent state.
//!
//! Port allocation is authoritative here: a caller-supplied port is a
//! hint. The allocator asks the agent for its currently-listened ports
//! (`QueryServices`, 3 s deadline), falls back to store-known ports when
//! the agent is unreachable, and scans up then down from the hint inside
//! the node's range.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use flux_protocol::{
    host_port, managed_metadata, AuthConfig, ChainConfig, ChainHop, ChainNode, CommandKind,
    ConnectorConfig, DialerConfig, ForwarderConfig, ForwarderNode, HandlerConfig, ListenerConfig,
    ServiceConfig, ServiceSummary,
};
use serde_json::{json, Value};

use crate::config::CONTROLLER_ID;
use crate::dispatch::{new_request_id, DispatchError, Dispatcher};
use crate::models::{Forward, Node, Tunnel, TUNNEL_TUNNEL_FORWARD};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unknown node {0}")]
    UnknownNode(i64),
    #[error("port range exhausted on node {0}")]
    PortExhausted(i64),
    #[error("tunnel misconfigured: {0}")]
    BadTunnel(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A service definition bound to the node that must realize it.
#[derive(Debug, Clone)]
pub struct PlannedService {
    pub node_id: i64,
    pub service: ServiceConfig,
}

/// `<forwardId>_<userId>_<userTunnelId>`; the permission id is 0 when no
/// permission row exists (admin-owned forwards).
pub fn service_name(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> String {
    format!("{forward_id}_{user_id}_{user_tunnel_id}")
}

/// Per-forward relay credentials for the tunnel-forward exit.
pub fn relay_credentials(forward_id: i64, created_at_ms: i64) -> AuthConfig {
    let digest = md5::compute(format!("{forward_id}:{created_at_ms}"));
    let hex = format!("{digest:x}");
    AuthConfig {
        username: format!("u-{forward_id}"),
        password: hex[..16].to_string(),
    }
}

fn listen_addr(bind: Option<&str>, port: i64) -> String {
    match bind {
        Some(ip) if !ip.is_empty() => host_port(ip, port as u16),
        _ => format!(":{port}"),
    }
}

fn service_metadata(iface: Option<&str>) -> BTreeMap<String, Value> {
    let mut meta = managed_metadata(CONTROLLER_ID);
    if let Some(iface) = iface.filter(|s| !s.is_empty()) {
        meta.insert("interface".into(), Value::String(iface.to_string()));
    }
    meta
}

/// Outbound interface priority: tunnel per-node map, forward override,
/// tunnel default.
fn iface_for(tunnel: &Tunnel, forward: &Forward, node_id: i64) -> Option<String> {
    tunnel
        .iface_for(node_id)
        .or_else(|| forward.iface.clone())
        .or_else(|| tunnel.iface.clone())
}

/// A plain TCP forwarder: listen, connect onward, nothing else.
fn tcp_forward_service(
    name: &str,
    bind: Option<&str>,
    port: i64,
    target: &str,
    iface: Option<&str>,
) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        addr: listen_addr(bind, port),
        listener: ListenerConfig { kind: "tcp".into() },
        handler: HandlerConfig {
            kind: "forward".into(),
            auth: None,
            chain: None,
        },
        forwarder: Some(ForwarderConfig {
            nodes: vec![ForwarderNode {
                name: "target".into(),
                addr: target.to_string(),
            }],
        }),
        metadata: Some(service_metadata(iface)),
    }
}

/// Address other nodes dial to reach the tunnel's exit listener.
fn exit_dial_addr(tunnel: &Tunnel, exit: &Node) -> String {
    tunnel
        .bind_for(exit.id)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| exit.public_addr.clone())
}

/// Compiles the full ordered service set for one forward. Entry first,
/// then intermediates in traversal order, exit last.
pub fn plan_forward(
    forward: &Forward,
    tunnel: &Tunnel,
    user_tunnel_id: i64,
    nodes: &HashMap<i64, Node>,
) -> Result<Vec<PlannedService>, PlanError> {
    let name = service_name(forward.id, forward.user_id, user_tunnel_id);
    let in_node = nodes
        .get(&tunnel.in_node_id)
        .ok_or(PlanError::UnknownNode(tunnel.in_node_id))?;
    let path = tunnel.path();
    let path_ports = forward.path_port_map();
    let mut plan = Vec::new();

    if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
        let out_id = tunnel
            .out_node_id
            .ok_or(PlanError::BadTunnel("tunnel-forward without exit node"))?;
        let out_node = nodes.get(&out_id).ok_or(PlanError::UnknownNode(out_id))?;
        let out_port = forward
            .out_port
            .ok_or(PlanError::BadTunnel("tunnel-forward without exit port"))?;
        let auth = relay_credentials(forward.id, forward.created_at_ms);

        // Entry chain target: the first intermediate when a path exists,
        // otherwise the exit itself. gRPC frames are carried hop-by-hop
        // over plain TCP forwarders, so only the entry dials the relay.
        let chain_target = match path.first() {
            Some(first_mid) => {
                let mid = nodes.get(first_mid).ok_or(PlanError::UnknownNode(*first_mid))?;
                let port = *path_ports
                    .get(first_mid)
                    .ok_or(PlanError::BadTunnel("intermediate hop without port"))?;
                host_port(&mid.public_addr, port as u16)
            }
            None => host_port(&exit_dial_addr(tunnel, out_node), out_port as u16),
        };

        plan.push(PlannedService {
            node_id: in_node.id,
            service: ServiceConfig {
                name: name.clone(),
                addr: listen_addr(tunnel.bind_for(in_node.id).as_deref(), forward.in_port),
                listener: ListenerConfig { kind: "tcp".into() },
                handler: HandlerConfig {
                    kind: "forward".into(),
                    auth: None,
                    chain: Some(ChainConfig {
                        name: format!("chain-{name}"),
                        hops: vec![ChainHop {
                            name: "hop-0".into(),
                            nodes: vec![ChainNode {
                                name: "exit".into(),
                                addr: chain_target,
                                connector: Some(ConnectorConfig {
                                    kind: "relay".into(),
                                    auth: Some(auth.clone()),
                                }),
                                dialer: Some(DialerConfig {
                                    kind: "grpc".into(),
                                }),
                            }],
                        }],
                    }),
                },
                forwarder: Some(ForwarderConfig {
                    nodes: vec![ForwarderNode {
                        name: "target".into(),
                        addr: forward.remote_addr.clone(),
                    }],
                }),
                metadata: Some(service_metadata(
                    iface_for(tunnel, forward, in_node.id).as_deref(),
                )),
            },
        });

        plan.extend(plan_path_hops(
            &name,
            tunnel,
            forward,
            &path,
            &path_ports,
            nodes,
            &host_port(&exit_dial_addr(tunnel, out_node), out_port as u16),
        )?);

        plan.push(PlannedService {
            node_id: out_node.id,
            service: ServiceConfig {
                name,
                addr: listen_addr(tunnel.bind_for(out_node.id).as_deref(), out_port),
                listener: ListenerConfig {
                    kind: "grpc".into(),
                },
                handler: HandlerConfig {
                    kind: "relay".into(),
                    auth: Some(auth),
                    chain: None,
                },
                forwarder: None,
                metadata: Some(service_metadata(
                    iface_for(tunnel, forward, out_node.id).as_deref(),
                )),
            },
        });
    } else {
        // Port forward: the entry (and any intermediates) relay plain
        // TCP; the final hop dials the remote.
        let entry_target = match path.first() {
            Some(first_mid) => {
                let mid = nodes.get(first_mid).ok_or(PlanError::UnknownNode(*first_mid))?;
                let port = *path_ports
                    .get(first_mid)
                    .ok_or(PlanError::BadTunnel("intermediate hop without port"))?;
                host_port(&mid.public_addr, port as u16)
            }
            None => forward.remote_addr.clone(),
        };
        plan.push(PlannedService {
            node_id: in_node.id,
            service: tcp_forward_service(
                &name,
                tunnel.bind_for(in_node.id).as_deref(),
                forward.in_port,
                &entry_target,
                iface_for(tunnel, forward, in_node.id).as_deref(),
            ),
        });
        plan.extend(plan_path_hops(
            &name,
            tunnel,
            forward,
            &path,
            &path_ports,
            nodes,
            &forward.remote_addr,
        )?);
    }

    Ok(plan)
}

/// Plain TCP forwarders for the intermediate path. Hop `i` targets hop
/// `i+1`'s allocated port; the last hop targets `final_target`.
fn plan_path_hops(
    name: &str,
    tunnel: &Tunnel,
    forward: &Forward,
    path: &[i64],
    path_ports: &BTreeMap<i64, i64>,
    nodes: &HashMap<i64, Node>,
    final_target: &str,
) -> Result<Vec<PlannedService>, PlanError> {
    let mut hops = Vec::with_capacity(path.len());
    for (i, mid_id) in path.iter().enumerate() {
        nodes.get(mid_id).ok_or(PlanError::UnknownNode(*mid_id))?;
        let port = *path_ports
            .get(mid_id)
            .ok_or(PlanError::BadTunnel("intermediate hop without port"))?;
        let target = match path.get(i + 1) {
            Some(next_id) => {
                let next = nodes.get(next_id).ok_or(PlanError::UnknownNode(*next_id))?;
                let next_port = *path_ports
                    .get(next_id)
                    .ok_or(PlanError::BadTunnel("intermediate hop without port"))?;
                host_port(&next.public_addr, next_port as u16)
            }
            None => final_target.to_string(),
        };
        hops.push(PlannedService {
            node_id: *mid_id,
            service: tcp_forward_service(
                name,
                tunnel.bind_for(*mid_id).as_deref(),
                port,
                &target,
                iface_for(tunnel, forward, *mid_id).as_deref(),
            ),
        });
    }
    Ok(hops)
}

/// The declared set for one node: every planned service of every forward
/// that involves the node as entry, intermediate, or exit. Forwards that
/// fail to plan (stale rows) are skipped with a warning rather than
/// poisoning the whole node.
pub async fn desired_services(store: &Store, node_id: i64) -> Result<Vec<ServiceConfig>, PlanError> {
    let nodes: HashMap<i64, Node> = store
        .list_nodes()
        .await?
        .into_iter()
        .map(|n| (n.id, n))
        .collect();
    let mut out = Vec::new();
    for (forward, tunnel) in store.forwards_with_tunnels().await? {
        let ut_id = store
            .user_tunnel_for(forward.user_id, forward.tunnel_id)
            .await?
            .map(|ut| ut.id)
            .unwrap_or(0);
        match plan_forward(&forward, &tunnel, ut_id, &nodes) {
            Ok(plan) => out.extend(
                plan.into_iter()
                    .filter(|p| p.node_id == node_id)
                    .map(|p| p.service),
            ),
            Err(e) => {
                tracing::warn!(forward_id = forward.id, error = %e, "skipping unplannable forward");
            }
        }
    }
    Ok(out)
}

// ─── Port Allocation ────────────────────────────────────────────

/// Scans for a free port: the hint itself when free and in range, then
/// upward to `max`, then downward to `min`.
pub fn pick_port(busy: &HashSet<u16>, preferred: u16, min: u16, max: u16) -> Option<u16> {
    if min > max {
        return None;
    }
    let anchor = if (min..=max).contains(&preferred) {
        preferred
    } else {
        min
    };
    for port in anchor..=max {
        if !busy.contains(&port) {
            return Some(port);
        }
    }
    for port in (min..anchor).rev() {
        if !busy.contains(&port) {
            return Some(port);
        }
    }
    None
}

/// Ports the agent reports as configured right now.
pub async fn query_listened_ports(
    dispatcher: &Dispatcher,
    node_id: i64,
) -> Result<HashSet<u16>, DispatchError> {
    let reply = dispatcher
        .request_op(
            node_id,
            CommandKind::QueryServices,
            json!({"requestId": new_request_id(), "filter": ""}),
            Duration::from_secs(3),
        )
        .await?;
    let summaries: Vec<ServiceSummary> = reply
        .get("data")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    Ok(summaries
        .iter()
        .map(|s| s.port)
        .filter(|p| *p != 0)
        .collect())
}

/// Ports the store already accounts to this node, used when the agent
/// does not answer in time.
async fn store_known_ports(store: &Store, node_id: i64) -> Result<HashSet<u16>, StoreError> {
    let mut busy = HashSet::new();
    for (forward, tunnel) in store.forwards_with_tunnels().await? {
        if tunnel.in_node_id == node_id {
            busy.insert(forward.in_port as u16);
        }
        if tunnel.out_node_id == Some(node_id) {
            if let Some(p) = forward.out_port {
                busy.insert(p as u16);
            }
        }
        if let Some(p) = forward.path_port_map().get(&node_id) {
            busy.insert(*p as u16);
        }
    }
    Ok(busy)
}

/// Allocates a port on the node inside `[min, max]`, treating
/// `preferred` as a hint. The live agent view wins; the store view is
/// the offline fallback.
pub async fn find_free_port_on_node(
    dispatcher: &Dispatcher,
    store: &Store,
    node_id: i64,
    preferred: u16,
    min: u16,
    max: u16,
) -> Result<u16, PlanError> {
    let busy = match query_listened_ports(dispatcher, node_id).await {
        Ok(ports) => ports,
        Err(e) => {
            tracing::debug!(node_id, error = %e, "live port query failed, using store view");
            store_known_ports(store, node_id).await?
        }
    };
    pick_port(&busy, preferred, min, max).ok_or(PlanError::PortExhausted(node_id))
}

/// Sends the plan to its nodes, one command per node, and restarts the
/// data plane wherever a chained service landed. Delivery is
/// best-effort: offline nodes pick the services up on reconnect
/// reconciliation.
pub fn push_plan(dispatcher: &Dispatcher, plan: &[PlannedService], kind: CommandKind) {
    let mut by_node: BTreeMap<i64, Vec<&PlannedService>> = BTreeMap::new();
    for planned in plan {
        by_node.entry(planned.node_id).or_default().push(planned);
    }
    for (node_id, services) in by_node {
        let payload: Vec<&ServiceConfig> = services.iter().map(|p| &p.service).collect();
        let restart = services.iter().any(|p| p.service.has_chain());
        if let Err(e) = dispatcher.send_command(
            node_id,
            kind,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        ) {
            tracing::warn!(node_id, error = %e, "service push not delivered");
            continue;
        }
        if restart {
            let _ = dispatcher.send_command(
                node_id,
                CommandKind::RestartGost,
                json!({"reason": "chain update"}),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FLOW_MODE_DOUBLE, STATUS_ACTIVE, TUNNEL_PORT_FORWARD};

    fn node(id: i64, public: &str, min: i64, max: i64) -> Node {
        Node {
            id,
            name: format!("node-{id}"),
            secret: "s".into(),
            public_addr: public.into(),
            control_addr: public.into(),
            port_min: min,
            port_max: max,
            status: 1,
            version: None,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn tunnel(kind: i64, in_node: i64, out_node: Option<i64>, path: &[i64]) -> Tunnel {
        Tunnel {
            id: 1,
            name: "t".into(),
            in_node_id: in_node,
            out_node_id: out_node,
            kind,
            path_node_ids: crate::models::encode_id_list(path),
            iface_map: None,
            bind_map: None,
            iface: None,
            flow_mode: FLOW_MODE_DOUBLE,
            status: STATUS_ACTIVE,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn forward(
        id: i64,
        in_port: i64,
        out_port: Option<i64>,
        path_ports: &[(i64, i64)],
        remote: &str,
    ) -> Forward {
        let map: BTreeMap<i64, i64> = path_ports.iter().copied().collect();
        Forward {
            id,
            user_id: 3,
            tunnel_id: 1,
            name: "f".into(),
            in_port,
            out_port,
            path_ports: crate::models::encode_port_map(&map),
            remote_addr: remote.into(),
            iface: None,
            status: STATUS_ACTIVE,
            in_bytes: 0,
            out_bytes: 0,
            created_at_ms: 1700000000000,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn single_hop_port_forward_plan() {
        let nodes: HashMap<i64, Node> = [(7, node(7, "7.7.7.7", 10000, 20000))].into();
        let t = tunnel(TUNNEL_PORT_FORWARD, 7, None, &[]);
        let f = forward(12, 10000, None, &[], "1.2.3.4:80");

        let plan = plan_forward(&f, &t, 0, &nodes).unwrap();
        assert_eq!(plan.len(), 1);
        let entry = &plan[0];
        assert_eq!(entry.node_id, 7);
        assert_eq!(entry.service.name, "12_3_0");
        assert_eq!(entry.service.addr, ":10000");
        assert_eq!(entry.service.handler.kind, "forward");
        assert_eq!(
            entry.service.forwarder.as_ref().unwrap().nodes[0].addr,
            "1.2.3.4:80"
        );
        let meta = entry.service.metadata.as_ref().unwrap();
        assert_eq!(meta["managedBy"], "flux-panel");
        assert_eq!(meta["managedby"], "flux-panel");
    }

    #[test]
    fn multi_hop_port_forward_chains_to_remote() {
        let nodes: HashMap<i64, Node> = [
            (1, node(1, "1.1.1.1", 10000, 20000)),
            (4, node(4, "4.4.4.4", 30000, 40000)),
            (5, node(5, "5.5.5.5", 30000, 40000)),
        ]
        .into();
        let t = tunnel(TUNNEL_PORT_FORWARD, 1, None, &[4, 5]);
        let f = forward(8, 10001, None, &[(4, 30001), (5, 30002)], "9.9.9.9:443");

        let plan = plan_forward(&f, &t, 0, &nodes).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(
            plan[0].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "4.4.4.4:30001"
        );
        assert_eq!(
            plan[1].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "5.5.5.5:30002"
        );
        assert_eq!(
            plan[2].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "9.9.9.9:443"
        );
        assert!(plan.iter().all(|p| !p.service.has_chain()));
    }

    #[test]
    fn tunnel_forward_with_two_intermediates() {
        let nodes: HashMap<i64, Node> = [
            (1, node(1, "1.1.1.1", 10000, 20000)),
            (4, node(4, "4.4.4.4", 30000, 40000)),
            (5, node(5, "5.5.5.5", 30000, 40000)),
            (9, node(9, "9.9.9.9", 50000, 60000)),
        ]
        .into();
        let t = tunnel(TUNNEL_TUNNEL_FORWARD, 1, Some(9), &[4, 5]);
        let f = forward(
            21,
            10002,
            Some(50001),
            &[(4, 30005), (5, 30006)],
            "8.8.8.8:53",
        );

        let plan = plan_forward(&f, &t, 42, &nodes).unwrap();
        assert_eq!(plan.len(), 4);

        // Entry: chain dials the first intermediate over gRPC relay.
        let entry = &plan[0];
        assert_eq!(entry.node_id, 1);
        assert_eq!(entry.service.name, "21_3_42");
        let chain = entry.service.handler.chain.as_ref().unwrap();
        let hop = &chain.hops[0].nodes[0];
        assert_eq!(hop.addr, "4.4.4.4:30005");
        assert_eq!(hop.connector.as_ref().unwrap().kind, "relay");
        assert_eq!(hop.dialer.as_ref().unwrap().kind, "grpc");
        assert_eq!(
            entry.service.forwarder.as_ref().unwrap().nodes[0].addr,
            "8.8.8.8:53"
        );

        // Intermediates: plain TCP forwarders, last one dials the exit.
        assert_eq!(plan[1].node_id, 4);
        assert_eq!(plan[1].service.handler.kind, "forward");
        assert_eq!(
            plan[1].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "5.5.5.5:30006"
        );
        assert_eq!(
            plan[2].service.forwarder.as_ref().unwrap().nodes[0].addr,
            "9.9.9.9:50001"
        );

        // Exit: gRPC relay listener with the per-forward credentials.
        let exit = &plan[3];
        assert_eq!(exit.node_id, 9);
        assert_eq!(exit.service.listener.kind, "grpc");
        assert_eq!(exit.service.handler.kind, "relay");
        let auth = exit.service.handler.auth.as_ref().unwrap();
        assert_eq!(auth.username, "u-21");
        assert_eq!(auth.password.len(), 16);
        assert_eq!(
            auth,
            entry.service.handler.chain.as_ref().unwrap().hops[0].nodes[0]
                .connector
                .as_ref()
                .unwrap()
                .auth
                .as_ref()
                .unwrap()
        );
    }

    #[test]
    fn tunnel_forward_without_path_dials_exit_directly() {
        let nodes: HashMap<i64, Node> = [
            (1, node(1, "1.1.1.1", 10000, 20000)),
            (9, node(9, "9.9.9.9", 50000, 60000)),
        ]
        .into();
        let t = tunnel(TUNNEL_TUNNEL_FORWARD, 1, Some(9), &[]);
        let f = forward(21, 10002, Some(50001), &[], "8.8.8.8:53");

        let plan = plan_forward(&f, &t, 0, &nodes).unwrap();
        assert_eq!(plan.len(), 2);
        let hop = &plan[0].service.handler.chain.as_ref().unwrap().hops[0].nodes[0];
        assert_eq!(hop.addr, "9.9.9.9:50001");
    }

    #[test]
    fn relay_password_is_stable_and_short() {
        let a = relay_credentials(21, 1700000000000);
        let b = relay_credentials(21, 1700000000000);
        let c = relay_credentials(22, 1700000000000);
        assert_eq!(a, b);
        assert_ne!(a.password, c.password);
        assert_eq!(a.password.len(), 16);
        assert!(a.password.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn pick_port_scans_up_then_down() {
        let busy: HashSet<u16> = [10000, 10001, 10002].into();
        assert_eq!(pick_port(&busy, 10000, 10000, 20000), Some(10003));
        assert_eq!(pick_port(&HashSet::new(), 15000, 10000, 20000), Some(15000));
        // out-of-range hint is ignored
        assert_eq!(pick_port(&busy, 99, 10000, 20000), Some(10003));
        // upward exhausted, falls back below the hint
        let busy: HashSet<u16> = [19999, 20000].into();
        assert_eq!(pick_port(&busy, 19999, 10000, 20000), Some(19998));
        // fully exhausted
        let busy: HashSet<u16> = (10000..=10002).collect();
        assert_eq!(pick_port(&busy, 10000, 10000, 10002), None);
        assert_eq!(pick_port(&HashSet::new(), 1, 10, 5), None);
    }
}
