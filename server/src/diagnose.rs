//! # Diagnostic Orchestrator
//!
//! Remote probes always run *from* an agent, never from the controller
//! host: the controller asks a node to connect/ping/measure and collects
//! the structured reply over the control channel.
//!
//! The iperf3 path measurement is the most involved operation here. It
//! installs a temporary forwarder chain along the tunnel path, waits for
//! readiness, verifies every hop, runs a reverse iperf3 client from the
//! entry, and then tears the whole thing down — teardown runs on every
//! exit path, success or abort. Each step writes an operation-log row
//! keyed by one diag id so failures stay diagnosable afterwards.

use std::net::Ipv4Addr;
use std::time::Duration;

use flux_protocol::{host_port, CommandKind, ProbeReply, ServiceSummary};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dispatch::{new_request_id, DispatchError};
use crate::models::{Node, Tunnel, TUNNEL_TUNNEL_FORWARD};
use crate::planner::{self, PlanError};
use crate::reconcile;
use crate::state::AppState;
use crate::store::StoreError;

/// Reference target for raw entry-node connectivity checks.
pub const CANONICAL_PUBLIC_IP: &str = "1.1.1.1";

/// Port range used instead of the node range when a hop is reached over
/// the overlay mesh.
pub const OVERLAY_PORT_MIN: u16 = 10000;
pub const OVERLAY_PORT_MAX: u16 = 65535;

const PROBE_DEADLINE: Duration = Duration::from_secs(8);
const SERVER_START_DEADLINE: Duration = Duration::from_secs(8);
const CLIENT_RUN_DEADLINE: Duration = Duration::from_secs(20);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READY_DEADLINE: Duration = Duration::from_secs(8);
const HOP_CHECK_RETRIES: u32 = 3;
const HOP_CHECK_BACKOFF: Duration = Duration::from_millis(250);
const LOCAL_PROBE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown node {0}")]
    UnknownNode(i64),
    #[error("tunnel has no exit node")]
    NoExitNode,
    #[error("{0}")]
    Aborted(String),
}

/// Result of one tcp/icmp probe. Failures are encoded, not raised: the
/// caller renders them as an unsuccessful step.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub avg_ms: f64,
    pub loss_pct: f64,
    pub message: String,
    pub request_id: String,
}

/// One rendered diagnostic step for the HTTP caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagStep {
    pub success: bool,
    pub description: String,
    pub node_name: String,
    pub node_id: i64,
    pub target_ip: String,
    pub target_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Iperf3Outcome {
    pub success: bool,
    pub bandwidth_mbps: f64,
    pub message: String,
    pub diag_id: String,
}

/// True for addresses on the `10.126.126.0/24` node-to-node overlay.
pub fn is_overlay(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>()
        .map(|a| {
            let o = a.octets();
            o[0] == 10 && o[1] == 126 && o[2] == 126
        })
        .unwrap_or(false)
}

pub fn temp_service_name(tunnel_id: i64, run_id: &str, index: usize) -> String {
    format!("tmp_iperf3_{tunnel_id}_{run_id}_{index}")
}

/// First `host:port` entry of a possibly comma-separated remote address.
pub fn split_remote_addr(addr: &str) -> Option<(String, u16)> {
    let first = addr.split(',').next()?.trim();
    if let Some(rest) = first.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port) = first.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Dial address for reaching `to` from `from_id`: the overlay bind IP
/// when both ends sit on the mesh, the public address otherwise.
fn hop_dial_addr(tunnel: &Tunnel, from_id: i64, to_bind: Option<String>, to_public: &str) -> String {
    let from_iface = tunnel.iface_for(from_id);
    match (from_iface, to_bind) {
        (Some(a), Some(b)) if is_overlay(&a) && is_overlay(&b) => b,
        _ => to_public.to_string(),
    }
}

/// Temp-port range on `to`: relaxed to the overlay range when the
/// dialing side reaches it over the mesh.
fn hop_port_range(tunnel: &Tunnel, from_id: Option<i64>, to: &Node) -> (u16, u16) {
    if let Some(from) = from_id {
        let from_iface = tunnel.iface_for(from);
        let to_bind = tunnel.bind_for(to.id);
        if let (Some(a), Some(b)) = (from_iface, to_bind) {
            if is_overlay(&a) && is_overlay(&b) {
                return (OVERLAY_PORT_MIN, OVERLAY_PORT_MAX);
            }
        }
    }
    to.port_range()
}

struct TempChain {
    /// (node id, temp service name); filled before install so teardown
    /// covers partially-installed chains.
    services: Vec<(i64, String)>,
    srv_port: Option<u16>,
}

pub struct Diagnostics<'a> {
    state: &'a AppState,
    pub diag_id: String,
}

impl<'a> Diagnostics<'a> {
    pub fn new(state: &'a AppState) -> Self {
        Self {
            state,
            diag_id: new_request_id(),
        }
    }

    async fn log(
        &self,
        node_id: i64,
        cmd: &str,
        request_id: &str,
        success: bool,
        message: &str,
        stdout: Option<&str>,
    ) {
        if let Err(e) = self
            .state
            .store
            .log_op(&self.diag_id, node_id, cmd, request_id, success, message, stdout)
            .await
        {
            warn!(node_id, error = %e, "op-log write failed");
        }
    }

    async fn node(&self, node_id: i64) -> Result<Node, DiagError> {
        self.state
            .store
            .node_by_id(node_id)
            .await?
            .ok_or(DiagError::UnknownNode(node_id))
    }

    // ── Probe primitives ──

    async fn probe(&self, node_id: i64, payload: Value, cmd: &str) -> ProbeOutcome {
        let request_id = payload["requestId"].as_str().unwrap_or_default().to_string();
        let reply = self
            .state
            .dispatcher
            .request_op(node_id, CommandKind::Diagnose, payload, PROBE_DEADLINE)
            .await;
        let outcome = match reply {
            Err(e) => ProbeOutcome {
                ok: false,
                avg_ms: 0.0,
                loss_pct: 100.0,
                message: format!("node did not answer: {e}"),
                request_id: request_id.clone(),
            },
            Ok(reply) => {
                let data: ProbeReply = reply
                    .get("data")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                ProbeOutcome {
                    ok: data.success,
                    avg_ms: data.average_time.unwrap_or(0.0),
                    loss_pct: data.packet_loss.unwrap_or(if data.success { 0.0 } else { 100.0 }),
                    message: data.message.unwrap_or_default(),
                    request_id: request_id.clone(),
                }
            }
        };
        self.log(node_id, cmd, &request_id, outcome.ok, &outcome.message, None)
            .await;
        outcome
    }

    pub async fn tcp_probe(
        &self,
        node_id: i64,
        host: &str,
        port: u16,
        count: u32,
        timeout_ms: u64,
    ) -> ProbeOutcome {
        let payload = json!({
            "requestId": new_request_id(),
            "host": host,
            "port": port,
            "protocol": "tcp",
            "mode": "tcp",
            "count": count,
            "timeoutMs": timeout_ms,
        });
        self.probe(node_id, payload, "Diagnose:tcp").await
    }

    pub async fn icmp_probe(
        &self,
        node_id: i64,
        host: &str,
        count: u32,
        timeout_ms: u64,
    ) -> ProbeOutcome {
        let payload = json!({
            "requestId": new_request_id(),
            "host": host,
            "mode": "icmp",
            "count": count,
            "timeoutMs": timeout_ms,
        });
        self.probe(node_id, payload, "Diagnose:icmp").await
    }

    /// Starts an iperf3 server on the node; returns the effective port.
    pub async fn iperf3_server(&self, node_id: i64, port: u16) -> Result<u16, DiagError> {
        let request_id = new_request_id();
        let payload = json!({
            "requestId": request_id,
            "mode": "iperf3",
            "server": true,
            "port": port,
        });
        let reply = self
            .state
            .dispatcher
            .request_op(node_id, CommandKind::Diagnose, payload, SERVER_START_DEADLINE)
            .await;
        match reply {
            Err(e) => {
                self.log(node_id, "Diagnose:iperf3-server", &request_id, false, &e.to_string(), None)
                    .await;
                Err(e.into())
            }
            Ok(reply) => {
                let data: ProbeReply = reply
                    .get("data")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let effective = data.port.filter(|p| *p != 0).unwrap_or(port);
                self.log(
                    node_id,
                    "Diagnose:iperf3-server",
                    &request_id,
                    data.success,
                    data.message.as_deref().unwrap_or(""),
                    None,
                )
                .await;
                if data.success {
                    Ok(effective)
                } else {
                    Err(DiagError::Aborted(format!(
                        "iperf3 server failed to start: {}",
                        data.message.unwrap_or_default()
                    )))
                }
            }
        }
    }

    pub async fn iperf3_client(
        &self,
        node_id: i64,
        host: &str,
        port: u16,
        duration: u32,
        reverse: bool,
    ) -> Result<f64, DiagError> {
        let request_id = new_request_id();
        let payload = json!({
            "requestId": request_id,
            "mode": "iperf3",
            "client": true,
            "host": host,
            "port": port,
            "duration": duration,
            "reverse": reverse,
        });
        let reply = self
            .state
            .dispatcher
            .request_op(node_id, CommandKind::Diagnose, payload, CLIENT_RUN_DEADLINE)
            .await;
        match reply {
            Err(e) => {
                self.log(node_id, "Diagnose:iperf3-client", &request_id, false, &e.to_string(), None)
                    .await;
                Err(e.into())
            }
            Ok(reply) => {
                let data: ProbeReply = reply
                    .get("data")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let bandwidth = data.bandwidth_mbps.unwrap_or(0.0);
                self.log(
                    node_id,
                    "Diagnose:iperf3-client",
                    &request_id,
                    data.success,
                    &format!("{bandwidth:.1} Mbps"),
                    None,
                )
                .await;
                if data.success {
                    Ok(bandwidth)
                } else {
                    Err(DiagError::Aborted(format!(
                        "iperf3 client failed: {}",
                        data.message.unwrap_or_default()
                    )))
                }
            }
        }
    }

    // ── Multi-step forward diagnosis ──

    /// Assembles probes along the forward's path. Step order: raw entry
    /// connectivity, entry → exit, node → remote, per-hop path checks,
    /// and an iperf3 measurement for tunnel forwards.
    pub async fn forward_diagnose(&self, forward_id: i64) -> Result<Vec<DiagStep>, DiagError> {
        let forward = self
            .state
            .store
            .forward_by_id(forward_id)
            .await?
            .ok_or(DiagError::Aborted("forward not found".into()))?;
        let tunnel = self
            .state
            .store
            .tunnel_by_id(forward.tunnel_id)
            .await?
            .ok_or(DiagError::Aborted("tunnel not found".into()))?;

        let mut steps = Vec::new();
        steps.push(self.step_entry(&tunnel).await?);
        steps.push(self.step_entry_exit(&tunnel, &forward).await?);
        steps.push(self.step_node_remote(&tunnel, &forward).await?);
        steps.extend(self.step_path(&tunnel, &forward).await?);
        if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
            steps.push(self.step_iperf3(&tunnel).await?);
        }
        Ok(steps)
    }

    /// A single named step of the composite diagnosis.
    pub async fn diagnose_step(&self, forward_id: i64, step: &str) -> Result<Vec<DiagStep>, DiagError> {
        let forward = self
            .state
            .store
            .forward_by_id(forward_id)
            .await?
            .ok_or(DiagError::Aborted("forward not found".into()))?;
        let tunnel = self
            .state
            .store
            .tunnel_by_id(forward.tunnel_id)
            .await?
            .ok_or(DiagError::Aborted("tunnel not found".into()))?;
        match step {
            "entry" => Ok(vec![self.step_entry(&tunnel).await?]),
            "entryExit" => Ok(vec![self.step_entry_exit(&tunnel, &forward).await?]),
            "nodeRemote" => Ok(vec![self.step_node_remote(&tunnel, &forward).await?]),
            "path" => self.step_path(&tunnel, &forward).await,
            "iperf3" => Ok(vec![self.step_iperf3(&tunnel).await?]),
            other => Err(DiagError::Aborted(format!("unknown diagnose step: {other}"))),
        }
    }

    async fn step_entry(&self, tunnel: &Tunnel) -> Result<DiagStep, DiagError> {
        let entry = self.node(tunnel.in_node_id).await?;
        let probe = self.icmp_probe(entry.id, CANONICAL_PUBLIC_IP, 3, 1500).await;
        Ok(render_step("entry connectivity", &entry, CANONICAL_PUBLIC_IP, 0, probe))
    }

    async fn step_entry_exit(
        &self,
        tunnel: &Tunnel,
        forward: &crate::models::Forward,
    ) -> Result<DiagStep, DiagError> {
        let entry = self.node(tunnel.in_node_id).await?;
        if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
            let out_id = tunnel.out_node_id.ok_or(DiagError::NoExitNode)?;
            let exit = self.node(out_id).await?;
            let port = forward
                .out_port
                .ok_or_else(|| DiagError::Aborted("forward has no exit port".into()))? as u16;
            let exit_ip = tunnel.bind_for(exit.id).unwrap_or_else(|| exit.public_addr.clone());
            let probe = self.tcp_probe(entry.id, &exit_ip, port, 3, 1500).await;
            Ok(render_step("entry → exit", &entry, &exit_ip, port, probe))
        } else {
            let (host, port) = split_remote_addr(&forward.remote_addr)
                .ok_or_else(|| DiagError::Aborted("remote address is malformed".into()))?;
            let probe = self.tcp_probe(entry.id, &host, port, 3, 1500).await;
            Ok(render_step("entry → remote", &entry, &host, port, probe))
        }
    }

    async fn step_node_remote(
        &self,
        tunnel: &Tunnel,
        forward: &crate::models::Forward,
    ) -> Result<DiagStep, DiagError> {
        let run_node = if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
            self.node(tunnel.out_node_id.ok_or(DiagError::NoExitNode)?).await?
        } else {
            self.node(tunnel.in_node_id).await?
        };
        let (host, port) = split_remote_addr(&forward.remote_addr)
            .ok_or_else(|| DiagError::Aborted("remote address is malformed".into()))?;
        let probe = self.tcp_probe(run_node.id, &host, port, 3, 1500).await;
        Ok(render_step("node → remote", &run_node, &host, port, probe))
    }

    /// Sequential ICMP along every adjacent hop pair; the final step is
    /// a TCP probe from the last hop to the remote.
    async fn step_path(
        &self,
        tunnel: &Tunnel,
        forward: &crate::models::Forward,
    ) -> Result<Vec<DiagStep>, DiagError> {
        let mut chain = vec![tunnel.in_node_id];
        chain.extend(tunnel.path());
        if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
            chain.push(tunnel.out_node_id.ok_or(DiagError::NoExitNode)?);
        }
        let mut steps = Vec::new();
        for pair in chain.windows(2) {
            let from = self.node(pair[0]).await?;
            let to = self.node(pair[1]).await?;
            let target = hop_dial_addr(tunnel, from.id, tunnel.bind_for(to.id), &to.public_addr);
            let probe = self.icmp_probe(from.id, &target, 3, 1500).await;
            steps.push(render_step(
                &format!("path {} → {}", from.name, to.name),
                &from,
                &target,
                0,
                probe,
            ));
        }
        let last = self.node(*chain.last().unwrap_or(&tunnel.in_node_id)).await?;
        let (host, port) = split_remote_addr(&forward.remote_addr)
            .ok_or_else(|| DiagError::Aborted("remote address is malformed".into()))?;
        let probe = self.tcp_probe(last.id, &host, port, 3, 1500).await;
        steps.push(render_step("path tail → remote", &last, &host, port, probe));
        Ok(steps)
    }

    async fn step_iperf3(&self, tunnel: &Tunnel) -> Result<DiagStep, DiagError> {
        let entry = self.node(tunnel.in_node_id).await?;
        let outcome = self.run_iperf3(tunnel).await?;
        Ok(DiagStep {
            success: outcome.success,
            description: "iperf3 reverse bandwidth".into(),
            node_name: entry.name,
            node_id: entry.id,
            target_ip: String::new(),
            target_port: 0,
            average_time: None,
            packet_loss: None,
            message: outcome.message,
            req_id: Some(outcome.diag_id),
            bandwidth_mbps: Some(outcome.bandwidth_mbps),
        })
    }

    // ── iperf3 path measurement ──

    /// Runs the full iperf3 state machine. Aborts surface as an
    /// unsuccessful outcome (not an error) so callers always get the
    /// structured result; teardown runs regardless.
    pub async fn run_iperf3(&self, tunnel: &Tunnel) -> Result<Iperf3Outcome, DiagError> {
        let out_id = tunnel.out_node_id.ok_or(DiagError::NoExitNode)?;
        let exit = self.node(out_id).await?;
        let mut chain_nodes = vec![self.node(tunnel.in_node_id).await?];
        for mid in tunnel.path() {
            chain_nodes.push(self.node(mid).await?);
        }

        let mut run = TempChain {
            services: Vec::new(),
            srv_port: None,
        };
        let result = self.iperf3_measure(tunnel, &chain_nodes, &exit, &mut run).await;
        self.iperf3_teardown(&run, &exit).await;

        match result {
            Ok(bandwidth) => Ok(Iperf3Outcome {
                success: true,
                bandwidth_mbps: bandwidth,
                message: format!("{bandwidth:.1} Mbps"),
                diag_id: self.diag_id.clone(),
            }),
            Err(DiagError::Aborted(message)) => Ok(Iperf3Outcome {
                success: false,
                bandwidth_mbps: 0.0,
                message,
                diag_id: self.diag_id.clone(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn iperf3_measure(
        &self,
        tunnel: &Tunnel,
        chain_nodes: &[Node],
        exit: &Node,
        run: &mut TempChain,
    ) -> Result<f64, DiagError> {
        let dispatcher = &self.state.dispatcher;
        let store = &self.state.store;
        let last_id = chain_nodes.last().map(|n| n.id).unwrap_or(tunnel.in_node_id);

        // 1. ServerStart: pick a port in the exit's range (overlay pairs
        //    relax to the wide range) and start the server there.
        let (srv_min, srv_max) = hop_port_range(tunnel, Some(last_id), exit);
        let srv_hint =
            planner::find_free_port_on_node(dispatcher, store, exit.id, 0, srv_min, srv_max)
                .await?;
        let srv_port = self.iperf3_server(exit.id, srv_hint).await?;
        run.srv_port = Some(srv_port);

        // 2. TempChain: allocate every hop's port first, then install.
        let run_id = &self.diag_id[..8];
        let mut ports = Vec::with_capacity(chain_nodes.len());
        for (i, node) in chain_nodes.iter().enumerate() {
            let from = if i == 0 { None } else { Some(chain_nodes[i - 1].id) };
            let (min, max) = hop_port_range(tunnel, from, node);
            let port = planner::find_free_port_on_node(dispatcher, store, node.id, 0, min, max)
                .await
                .map_err(|e| DiagError::Aborted(format!("temp port allocation failed: {e}")))?;
            ports.push(port);
        }
        let exit_dial = hop_dial_addr(tunnel, last_id, tunnel.bind_for(exit.id), &exit.public_addr);
        for (i, node) in chain_nodes.iter().enumerate() {
            let name = temp_service_name(tunnel.id, run_id, i);
            let target = match chain_nodes.get(i + 1) {
                Some(next) => {
                    let addr =
                        hop_dial_addr(tunnel, node.id, tunnel.bind_for(next.id), &next.public_addr);
                    host_port(&addr, ports[i + 1])
                }
                None => host_port(&exit_dial, srv_port),
            };
            // The entry must bind 0.0.0.0 so the IPv4 localhost client
            // probe is guaranteed to reach it.
            let addr = if i == 0 {
                format!("0.0.0.0:{}", ports[i])
            } else {
                match tunnel.bind_for(node.id) {
                    Some(bind) if !bind.is_empty() => host_port(&bind, ports[i]),
                    _ => format!(":{}", ports[i]),
                }
            };
            let service = json!({
                "name": name,
                "addr": addr,
                "listener": {"type": "tcp"},
                "handler": {"type": "forward"},
                "forwarder": {"nodes": [{"name": "target", "addr": target}]},
                "metadata": flux_protocol::managed_metadata(crate::config::CONTROLLER_ID),
            });
            run.services.push((node.id, name.clone()));
            let rid = new_request_id();
            match dispatcher.send_command(node.id, CommandKind::AddService, json!([service])) {
                Ok(()) => self.log(node.id, "AddService:temp", &rid, true, &name, None).await,
                Err(e) => {
                    self.log(node.id, "AddService:temp", &rid, false, &e.to_string(), None)
                        .await;
                    return Err(DiagError::Aborted(format!(
                        "temp service install failed on node {}: {e}",
                        node.id
                    )));
                }
            }
        }

        // 3. Restart the data plane on every temp-chain node.
        for node in chain_nodes {
            let _ = dispatcher.send_command(
                node.id,
                CommandKind::RestartGost,
                json!({"reason": "iperf3 temp chain"}),
            );
        }

        // 4. Readiness: poll until each temp service reports listening.
        for (i, node) in chain_nodes.iter().enumerate() {
            let name = temp_service_name(tunnel.id, run_id, i);
            if !self.wait_service_ready(node.id, &name, ports[i]).await {
                self.log(node.id, "Readiness", "", false, &name, None).await;
                return Err(DiagError::Aborted(format!(
                    "temp chain not fully ready: {name} on node {}",
                    node.id
                )));
            }
            self.log(node.id, "Readiness", "", true, &name, None).await;
        }

        // 5. HopTcpCheck: single-shot probes along every adjacent pair.
        for (i, node) in chain_nodes.iter().enumerate() {
            let (host, port) = match chain_nodes.get(i + 1) {
                Some(next) => (
                    hop_dial_addr(tunnel, node.id, tunnel.bind_for(next.id), &next.public_addr),
                    ports[i + 1],
                ),
                None => (exit_dial.clone(), srv_port),
            };
            if !self.hop_check(node.id, &host, port).await {
                return Err(DiagError::Aborted(format!(
                    "hop check failed: node {} → {host}:{port}",
                    node.id
                )));
            }
        }

        // 6. DirectTcpProbe: entry reaches the server over the overlay
        //    path, not the open Internet.
        let entry = &chain_nodes[0];
        let direct = self.tcp_probe(entry.id, &exit_dial, srv_port, 1, 1500).await;
        if !direct.ok {
            return Err(DiagError::Aborted(format!(
                "direct probe to iperf3 server failed: {}",
                direct.message
            )));
        }

        // 7. LocalProbe: the entry's own listener must accept.
        let local_timeout = store.diag_local_probe_timeout_ms().await;
        let mut local = self.tcp_probe(entry.id, "127.0.0.1", ports[0], 1, local_timeout).await;
        if !local.ok {
            let listening = self
                .service_listening(entry.id, &temp_service_name(tunnel.id, run_id, 0), ports[0])
                .await;
            if listening {
                tokio::time::sleep(LOCAL_PROBE_RETRY_DELAY).await;
                local = self.tcp_probe(entry.id, "127.0.0.1", ports[0], 1, local_timeout).await;
            }
            if !local.ok {
                return Err(DiagError::Aborted(format!(
                    "entry local probe failed: {}",
                    local.message
                )));
            }
        }

        // 8. ClientRun: reverse test measures exit → entry bandwidth.
        self.iperf3_client(entry.id, "127.0.0.1", ports[0], 5, true).await
    }

    /// 9. Teardown: delete every temp service and kill the server; runs
    /// after success and after every abort.
    async fn iperf3_teardown(&self, run: &TempChain, exit: &Node) {
        for (node_id, name) in &run.services {
            let rid = new_request_id();
            let ok = self
                .state
                .dispatcher
                .send_command(*node_id, CommandKind::DeleteService, json!({"services": [name]}))
                .is_ok();
            self.log(*node_id, "DeleteService:temp", &rid, ok, name, None).await;
        }
        if let Some(port) = run.srv_port {
            let script = format!("pkill -f 'iperf3.*-s.*-p {port}'");
            // the kill script is idempotent
            let reply = self
                .state
                .dispatcher
                .request_with_retry(
                    exit.id,
                    CommandKind::RunScript,
                    json!({"content": script, "timeoutSec": 10}),
                    Duration::from_secs(10),
                    1,
                )
                .await;
            let (rid, ok, stdout) = match &reply {
                Some(reply) => {
                    let rid = reply
                        .get("requestId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let data: ProbeReply = reply
                        .get("data")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    (rid, data.success, data.stdout.clone())
                }
                None => (String::new(), false, None),
            };
            self.log(exit.id, "RunScript:pkill-iperf3", &rid, ok, &script, stdout.as_deref())
                .await;
        }
    }

    async fn wait_service_ready(&self, node_id: i64, name: &str, port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + READY_DEADLINE;
        loop {
            if self.service_listening(node_id, name, port).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn service_listening(&self, node_id: i64, name: &str, port: u16) -> bool {
        let summaries: Vec<ServiceSummary> =
            match reconcile::query_services(&self.state.dispatcher, node_id, Duration::from_secs(2))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    debug!(node_id, error = %e, "readiness query failed");
                    return false;
                }
            };
        summaries
            .iter()
            .any(|s| (s.name == name || s.port == port) && s.listening)
    }

    async fn hop_check(&self, node_id: i64, host: &str, port: u16) -> bool {
        for attempt in 0..HOP_CHECK_RETRIES {
            let probe = self.tcp_probe(node_id, host, port, 1, 1500).await;
            if probe.ok {
                return true;
            }
            debug!(node_id, host, port, attempt, "hop check attempt failed");
            tokio::time::sleep(HOP_CHECK_BACKOFF).await;
        }
        false
    }
}

fn render_step(
    description: &str,
    node: &Node,
    target_ip: &str,
    target_port: u16,
    probe: ProbeOutcome,
) -> DiagStep {
    DiagStep {
        success: probe.ok,
        description: description.into(),
        node_name: node.name.clone(),
        node_id: node.id,
        target_ip: target_ip.into(),
        target_port,
        average_time: Some(probe.avg_ms),
        packet_loss: Some(probe.loss_pct),
        message: probe.message,
        req_id: Some(probe.request_id),
        bandwidth_mbps: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::Dispatcher;
    use crate::flow::FlowJob;
    use crate::models::{FLOW_MODE_DOUBLE, STATUS_ACTIVE};
    use crate::pending::PendingRequests;
    use crate::registry::{AgentSession, ControlRegistry};
    use crate::store::{NewTunnel, Store};
    use flux_protocol::OutboundFrame;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    #[test]
    fn overlay_membership() {
        assert!(is_overlay("10.126.126.4"));
        assert!(is_overlay("10.126.126.255"));
        assert!(!is_overlay("10.126.127.4"));
        assert!(!is_overlay("192.168.1.1"));
        assert!(!is_overlay("not-an-ip"));
    }

    #[test]
    fn remote_addr_splitting() {
        assert_eq!(split_remote_addr("1.2.3.4:80"), Some(("1.2.3.4".into(), 80)));
        assert_eq!(
            split_remote_addr("1.2.3.4:80,5.6.7.8:81"),
            Some(("1.2.3.4".into(), 80))
        );
        assert_eq!(
            split_remote_addr("[2001:db8::1]:443"),
            Some(("2001:db8::1".into(), 443))
        );
        assert_eq!(split_remote_addr("no-port"), None);
        assert_eq!(split_remote_addr(":80"), None);
    }

    #[test]
    fn temp_names_follow_convention() {
        assert_eq!(temp_service_name(9, "ab12cd34", 2), "tmp_iperf3_9_ab12cd34_2");
    }

    fn overlay_tunnel(in_node: i64, out_node: i64) -> Tunnel {
        let iface_map = format!(r#"{{"{in_node}":"10.126.126.1"}}"#);
        let bind_map = format!(r#"{{"{out_node}":"10.126.126.9"}}"#);
        Tunnel {
            id: 1,
            name: "t".into(),
            in_node_id: in_node,
            out_node_id: Some(out_node),
            kind: TUNNEL_TUNNEL_FORWARD,
            path_node_ids: None,
            iface_map: Some(iface_map),
            bind_map: Some(bind_map),
            iface: None,
            flow_mode: FLOW_MODE_DOUBLE,
            status: STATUS_ACTIVE,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn node(id: i64, public: &str, min: i64, max: i64) -> Node {
        Node {
            id,
            name: format!("node-{id}"),
            secret: format!("secret-{id}"),
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

    #[test]
    fn overlay_pair_relaxes_range_and_addressing() {
        let tunnel = overlay_tunnel(1, 9);
        let exit = node(9, "9.9.9.9", 50000, 50010);
        assert_eq!(
            hop_port_range(&tunnel, Some(1), &exit),
            (OVERLAY_PORT_MIN, OVERLAY_PORT_MAX)
        );
        // entry's own range is never relaxed
        let entry = node(1, "1.1.1.1", 10000, 20000);
        assert_eq!(hop_port_range(&tunnel, None, &entry), (10000, 20000));
        assert_eq!(
            hop_dial_addr(&tunnel, 1, tunnel.bind_for(9), "9.9.9.9"),
            "10.126.126.9"
        );
        // no overlay on the dialing side → public address
        assert_eq!(hop_dial_addr(&tunnel, 9, None, "1.1.1.1"), "1.1.1.1");
    }

    // ── Fake agent harness ──

    type FrameLog = Arc<Mutex<Vec<(i64, OutboundFrame)>>>;

    /// Scripted agent: answers QueryServices with an empty list, starts
    /// iperf3 servers successfully, succeeds on tcp probes, and records
    /// every frame it sees.
    fn spawn_fake_agent(
        pending: Arc<PendingRequests>,
        node_id: i64,
        mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
        log: FrameLog,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                log.lock().await.push((node_id, frame.clone()));
                let rid = frame
                    .data
                    .get("requestId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(rid) = rid else { continue };
                let data = match frame.kind {
                    CommandKind::QueryServices => json!([]),
                    CommandKind::Diagnose => {
                        if frame.data.get("server").and_then(Value::as_bool) == Some(true) {
                            json!({"success": true, "port": frame.data["port"]})
                        } else {
                            json!({"success": true, "averageTime": 1.0, "packetLoss": 0.0})
                        }
                    }
                    CommandKind::RunScript => json!({"success": true, "stdout": ""}),
                    _ => continue,
                };
                pending.complete(&rid, json!({"requestId": rid, "data": data}));
            }
        });
    }

    async fn diag_state() -> (AppState, Arc<PendingRequests>) {
        let store = Store::open_in_memory().await.unwrap();
        let registry = Arc::new(ControlRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), pending.clone()));
        let (flow_tx, _flow_rx) = mpsc::channel::<FlowJob>(8);
        let config = Arc::new(Config {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            database_url: String::new(),
            reconcile_interval: 0,
            strict_reconcile: false,
        });
        (
            AppState::new(config, store, registry, pending.clone(), dispatcher, flow_tx),
            pending,
        )
    }

    /// Readiness never succeeds (the fake agents report no services), so
    /// the run aborts — and still deletes every temp service and pkills
    /// the server on the exit.
    #[tokio::test]
    async fn iperf3_teardown_runs_on_readiness_failure() {
        let (state, pending) = diag_state().await;
        let entry = state
            .store
            .create_node("entry", "1.1.1.1", "1.1.1.1", 10000, 20000)
            .await
            .unwrap();
        let mid = state
            .store
            .create_node("mid", "4.4.4.4", "4.4.4.4", 30000, 40000)
            .await
            .unwrap();
        let exit = state
            .store
            .create_node("exit", "9.9.9.9", "9.9.9.9", 50000, 60000)
            .await
            .unwrap();
        let tunnel = state
            .store
            .create_tunnel(&NewTunnel {
                name: "t".into(),
                in_node_id: entry.id,
                out_node_id: Some(exit.id),
                kind: TUNNEL_TUNNEL_FORWARD,
                path_node_ids: vec![mid.id],
                iface_map: BTreeMap::new(),
                bind_map: BTreeMap::new(),
                iface: None,
                flow_mode: FLOW_MODE_DOUBLE,
            })
            .await
            .unwrap();

        let log: FrameLog = Arc::new(Mutex::new(Vec::new()));
        for node_id in [entry.id, mid.id, exit.id] {
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .registry
                .register(AgentSession::new(node_id, "1.0".into(), tx));
            spawn_fake_agent(pending.clone(), node_id, rx, log.clone());
        }

        let diag = Diagnostics::new(&state);
        let outcome = diag.run_iperf3(&tunnel).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("not fully ready"));

        // give the fake agents a tick to drain their queues
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = log.lock().await;

        // every temp name previously sent is deleted on its node
        let run_id = &diag.diag_id[..8];
        for (i, node_id) in [entry.id, mid.id].iter().enumerate() {
            let name = temp_service_name(tunnel.id, run_id, i);
            assert!(
                frames.iter().any(|(n, f)| n == node_id
                    && f.kind == CommandKind::DeleteService
                    && f.data["services"][0] == name.as_str()),
                "missing DeleteService for {name}"
            );
        }
        // the exit got the pkill script for the server port
        assert!(frames.iter().any(|(n, f)| *n == exit.id
            && f.kind == CommandKind::RunScript
            && f.data["content"]
                .as_str()
                .map(|s| s.starts_with("pkill -f 'iperf3.*-s.*-p "))
                .unwrap_or(false)));

        // op-log rows exist for the failed run
        let ops = state.store.list_ops(None, 200).await.unwrap();
        assert!(ops.iter().any(|op| op.diag_id == diag.diag_id && op.cmd == "Readiness" && !op.success));
        assert!(ops.iter().any(|op| op.diag_id == diag.diag_id && op.cmd == "DeleteService:temp"));
    }
}
