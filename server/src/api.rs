//! # REST API Endpoints
//!
//! The HTTP surface of the controller: node/tunnel/forward lifecycle,
//! the agent-facing reconcile endpoints, flow upload, and diagnostics.
//! Every response uses the `{code, msg, data}` envelope with `code = 0`
//! reserved for success.
//!
//! Identity is an external concern: handlers take the `(userId, roleId)`
//! context from headers placed by the fronting auth layer; role 0 is the
//! administrator.

use std::collections::BTreeMap;

use axum::{
    extract::{FromRequestParts, Query, State},
    http::request::Parts,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use flux_protocol::{CommandKind, FlowReport};

use crate::diagnose::Diagnostics;
use crate::flow::FlowJob;
use crate::models::{Node, Tunnel, STATUS_ACTIVE, STATUS_PAUSED, TUNNEL_PORT_FORWARD, TUNNEL_TUNNEL_FORWARD};
use crate::planner::{self, service_name};
use crate::reconcile;
use crate::state::AppState;
use crate::store::{NewForward, NewTunnel, StoreError};

// ─── Response Envelope ──────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub code: i64,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 0,
        msg: "ok".into(),
        data: serde_json::to_value(data).ok(),
    })
}

fn ok_empty() -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 0,
        msg: "ok".into(),
        data: None,
    })
}

fn err(msg: impl Into<String>) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 1,
        msg: msg.into(),
        data: None,
    })
}

fn store_err(e: StoreError) -> Json<ApiResponse> {
    err(e.to_string())
}

// ─── Identity Context ───────────────────────────────────────────

/// `(userId, roleId)` produced by the fronting identity service.
/// Role 0 is the administrator; absent headers mean an admin-local call.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: i64,
    pub role_id: i64,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role_id == 0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_i64 = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<i64>().ok())
        };
        Ok(Identity {
            user_id: header_i64("x-user-id").unwrap_or(0),
            role_id: header_i64("x-role-id").unwrap_or(0),
        })
    }
}

// ─── Health ─────────────────────────────────────────────────────

pub async fn health() -> &'static str {
    "ok"
}

// ─── Nodes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDto {
    pub name: String,
    pub public_addr: String,
    pub control_addr: String,
    pub port_min: i64,
    pub port_max: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdateDto {
    pub id: i64,
    #[serde(flatten)]
    pub fields: NodeDto,
}

fn valid_port_range(min: i64, max: i64) -> bool {
    (1..=65535).contains(&min) && (1..=65535).contains(&max) && min <= max
}

pub async fn node_create(
    State(state): State<AppState>,
    Json(req): Json<NodeDto>,
) -> Json<ApiResponse> {
    if !valid_port_range(req.port_min, req.port_max) {
        return err("invalid port range");
    }
    match state
        .store
        .create_node(&req.name, &req.public_addr, &req.control_addr, req.port_min, req.port_max)
        .await
    {
        Ok(node) => ok(node),
        Err(e) => store_err(e),
    }
}

pub async fn node_list(State(state): State<AppState>) -> Json<ApiResponse> {
    match state.store.list_nodes().await {
        Ok(nodes) => ok(nodes),
        Err(e) => store_err(e),
    }
}

pub async fn node_update(
    State(state): State<AppState>,
    Json(req): Json<NodeUpdateDto>,
) -> Json<ApiResponse> {
    if !valid_port_range(req.fields.port_min, req.fields.port_max) {
        return err("invalid port range");
    }
    match state
        .store
        .update_node(
            req.id,
            &req.fields.name,
            &req.fields.public_addr,
            &req.fields.control_addr,
            req.fields.port_min,
            req.fields.port_max,
        )
        .await
    {
        Ok(()) => ok_empty(),
        Err(e) => store_err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct IdDto {
    pub id: i64,
}

pub async fn node_delete(
    State(state): State<AppState>,
    Json(req): Json<IdDto>,
) -> Json<ApiResponse> {
    match state.store.delete_node(req.id).await {
        Ok(()) => ok_empty(),
        Err(e) => store_err(e),
    }
}

/// Live sessions per node with the agent versions behind them.
pub async fn node_connections(State(state): State<AppState>) -> Json<ApiResponse> {
    let out: Vec<Value> = state
        .registry
        .connected()
        .into_iter()
        .map(|(node_id, versions)| {
            json!({
                "nodeId": node_id,
                "conns": versions.iter().map(|v| json!({"version": v})).collect::<Vec<_>>(),
            })
        })
        .collect();
    ok(out)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryServicesDto {
    pub node_id: i64,
    #[serde(default)]
    #[allow(dead_code)]
    pub filter: String,
}

pub async fn node_query_services(
    State(state): State<AppState>,
    Json(req): Json<QueryServicesDto>,
) -> Json<ApiResponse> {
    match reconcile::query_services(&state.dispatcher, req.node_id, std::time::Duration::from_secs(5))
        .await
    {
        Ok(services) => ok(services),
        Err(e) => err(format!("query failed: {e}")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsDto {
    #[serde(default)]
    pub node_id: i64,
    #[serde(default)]
    pub limit: i64,
}

pub async fn node_ops(State(state): State<AppState>, Json(req): Json<OpsDto>) -> Json<ApiResponse> {
    let node_id = (req.node_id > 0).then_some(req.node_id);
    let limit = if req.limit > 0 { req.limit } else { 50 };
    match state.store.list_ops(node_id, limit).await {
        Ok(ops) => ok(json!({"ops": ops})),
        Err(e) => store_err(e),
    }
}

// ─── Tunnels ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelDto {
    pub name: String,
    pub in_node_id: i64,
    pub out_node_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub path_node_ids: Vec<i64>,
    #[serde(default)]
    pub iface_map: BTreeMap<i64, String>,
    #[serde(default)]
    pub bind_map: BTreeMap<i64, String>,
    pub iface: Option<String>,
    #[serde(default = "default_flow_mode")]
    pub flow_mode: i64,
}

fn default_flow_mode() -> i64 {
    crate::models::FLOW_MODE_DOUBLE
}

pub async fn tunnel_create(
    State(state): State<AppState>,
    Json(req): Json<TunnelDto>,
) -> Json<ApiResponse> {
    if req.kind != TUNNEL_PORT_FORWARD && req.kind != TUNNEL_TUNNEL_FORWARD {
        return err("unknown tunnel type");
    }
    match state.store.node_by_id(req.in_node_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return err("entry node not found"),
        Err(e) => return store_err(e),
    }
    if req.kind == TUNNEL_TUNNEL_FORWARD {
        let Some(out_id) = req.out_node_id else {
            return err("tunnel-forward requires an exit node");
        };
        match state.store.node_by_id(out_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return err("exit node not found"),
            Err(e) => return store_err(e),
        }
    } else if req.out_node_id.is_some() {
        return err("port-forward must not name an exit node");
    }
    if req
        .path_node_ids
        .iter()
        .any(|id| *id == req.in_node_id || Some(*id) == req.out_node_id)
    {
        return err("path must not contain the entry or exit node");
    }
    for id in &req.path_node_ids {
        match state.store.node_by_id(*id).await {
            Ok(Some(_)) => {}
            Ok(None) => return err(format!("path node {id} not found")),
            Err(e) => return store_err(e),
        }
    }
    match state
        .store
        .create_tunnel(&NewTunnel {
            name: req.name,
            in_node_id: req.in_node_id,
            out_node_id: req.out_node_id,
            kind: req.kind,
            path_node_ids: req.path_node_ids,
            iface_map: req.iface_map,
            bind_map: req.bind_map,
            iface: req.iface,
            flow_mode: req.flow_mode,
        })
        .await
    {
        Ok(tunnel) => ok(tunnel),
        Err(e) => store_err(e),
    }
}

pub async fn tunnel_list(State(state): State<AppState>) -> Json<ApiResponse> {
    match state.store.list_tunnels().await {
        Ok(tunnels) => ok(tunnels),
        Err(e) => store_err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUpdateDto {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_flow_mode")]
    pub flow_mode: i64,
    pub iface: Option<String>,
}

pub async fn tunnel_update(
    State(state): State<AppState>,
    Json(req): Json<TunnelUpdateDto>,
) -> Json<ApiResponse> {
    match state
        .store
        .update_tunnel(req.id, &req.name, req.flow_mode, req.iface.as_deref())
        .await
    {
        Ok(()) => ok_empty(),
        Err(e) => store_err(e),
    }
}

pub async fn tunnel_delete(
    State(state): State<AppState>,
    Json(req): Json<IdDto>,
) -> Json<ApiResponse> {
    match state.store.delete_tunnel(req.id).await {
        Ok(()) => ok_empty(),
        Err(e) => store_err(e),
    }
}

// ─── Forwards ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardDto {
    pub tunnel_id: i64,
    pub name: String,
    pub remote_addr: String,
    /// Hint only; the allocator decides.
    pub in_port: Option<i64>,
    pub iface: Option<String>,
}

/// Every node involved in realizing a forward over its tunnel.
fn involved_nodes(tunnel: &Tunnel) -> Vec<i64> {
    let mut nodes = vec![tunnel.in_node_id];
    nodes.extend(tunnel.path());
    if let Some(out) = tunnel.out_node_id {
        nodes.push(out);
    }
    nodes
}

pub async fn forward_create(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ForwardDto>,
) -> Json<ApiResponse> {
    let tunnel = match state.store.tunnel_by_id(req.tunnel_id).await {
        Ok(Some(t)) => t,
        Ok(None) => return err("tunnel not found"),
        Err(e) => return store_err(e),
    };
    // Non-admins need a permission row on the tunnel.
    let user_tunnel = match state.store.user_tunnel_for(identity.user_id, tunnel.id).await {
        Ok(ut) => ut,
        Err(e) => return store_err(e),
    };
    if !identity.is_admin() && user_tunnel.is_none() {
        return err("no permission on this tunnel");
    }
    let ut_id = user_tunnel.map(|ut| ut.id).unwrap_or(0);

    // Allocate every port before any row or service exists, so an
    // exhausted range has no partial side-effects.
    let in_node = match state.store.node_by_id(tunnel.in_node_id).await {
        Ok(Some(n)) => n,
        Ok(None) => return err("entry node not found"),
        Err(e) => return store_err(e),
    };
    let (in_min, in_max) = in_node.port_range();
    let preferred = req
        .in_port
        .filter(|p| in_node.contains_port(*p))
        .unwrap_or(0) as u16;
    let in_port = match planner::find_free_port_on_node(
        &state.dispatcher,
        &state.store,
        in_node.id,
        preferred,
        in_min,
        in_max,
    )
    .await
    {
        Ok(p) => p as i64,
        Err(e) => return err(format!("portExhausted: {e}")),
    };

    let mut out_port = None;
    if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
        let Some(out_id) = tunnel.out_node_id else {
            return err("tunnel has no exit node");
        };
        let out_node = match state.store.node_by_id(out_id).await {
            Ok(Some(n)) => n,
            Ok(None) => return err("exit node not found"),
            Err(e) => return store_err(e),
        };
        let (min, max) = out_node.port_range();
        match planner::find_free_port_on_node(&state.dispatcher, &state.store, out_id, 0, min, max)
            .await
        {
            Ok(p) => out_port = Some(p as i64),
            Err(e) => return err(format!("portExhausted: {e}")),
        }
    }

    let mut path_ports = BTreeMap::new();
    for mid_id in tunnel.path() {
        let mid = match state.store.node_by_id(mid_id).await {
            Ok(Some(n)) => n,
            Ok(None) => return err(format!("path node {mid_id} not found")),
            Err(e) => return store_err(e),
        };
        let (min, max) = mid.port_range();
        match planner::find_free_port_on_node(&state.dispatcher, &state.store, mid_id, 0, min, max)
            .await
        {
            Ok(p) => {
                path_ports.insert(mid_id, p as i64);
            }
            Err(e) => return err(format!("portExhausted: {e}")),
        }
    }

    let forward = match state
        .store
        .create_forward(&NewForward {
            user_id: identity.user_id,
            tunnel_id: tunnel.id,
            name: req.name,
            in_port,
            out_port,
            path_ports,
            remote_addr: req.remote_addr,
            iface: req.iface,
        })
        .await
    {
        Ok(f) => f,
        Err(e) => return store_err(e),
    };

    match push_forward(&state, &forward, &tunnel, ut_id, CommandKind::AddService).await {
        Ok(()) => ok(forward),
        Err(e) => err(e),
    }
}

/// Plans the forward and pushes the per-node services.
async fn push_forward(
    state: &AppState,
    forward: &crate::models::Forward,
    tunnel: &Tunnel,
    user_tunnel_id: i64,
    kind: CommandKind,
) -> Result<(), String> {
    let nodes: std::collections::HashMap<i64, Node> = match state.store.list_nodes().await {
        Ok(nodes) => nodes.into_iter().map(|n| (n.id, n)).collect(),
        Err(e) => return Err(e.to_string()),
    };
    let plan = planner::plan_forward(forward, tunnel, user_tunnel_id, &nodes)
        .map_err(|e| e.to_string())?;
    planner::push_plan(&state.dispatcher, &plan, kind);
    Ok(())
}

pub async fn forward_list(
    State(state): State<AppState>,
    identity: Identity,
) -> Json<ApiResponse> {
    let scope = (!identity.is_admin()).then_some(identity.user_id);
    match state.store.list_forwards(scope).await {
        Ok(forwards) => ok(forwards),
        Err(e) => store_err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardUpdateDto {
    pub id: i64,
    pub name: String,
    pub remote_addr: String,
}

pub async fn forward_update(
    State(state): State<AppState>,
    Json(req): Json<ForwardUpdateDto>,
) -> Json<ApiResponse> {
    let forward = match state.store.forward_by_id(req.id).await {
        Ok(Some(f)) => f,
        Ok(None) => return err("forward not found"),
        Err(e) => return store_err(e),
    };
    let tunnel = match state.store.tunnel_by_id(forward.tunnel_id).await {
        Ok(Some(t)) => t,
        Ok(None) => return err("tunnel not found"),
        Err(e) => return store_err(e),
    };
    if let Err(e) = state.store.update_forward(req.id, &req.name, &req.remote_addr).await {
        return store_err(e);
    }
    let updated = match state.store.forward_by_id(req.id).await {
        Ok(Some(f)) => f,
        _ => return err("forward not found"),
    };
    let ut_id = match state.store.user_tunnel_for(updated.user_id, tunnel.id).await {
        Ok(ut) => ut.map(|u| u.id).unwrap_or(0),
        Err(e) => return store_err(e),
    };
    match push_forward(&state, &updated, &tunnel, ut_id, CommandKind::UpdateService).await {
        Ok(()) => ok_empty(),
        Err(e) => err(e),
    }
}

pub async fn forward_delete(
    State(state): State<AppState>,
    Json(req): Json<IdDto>,
) -> Json<ApiResponse> {
    let forward = match state.store.forward_by_id(req.id).await {
        Ok(Some(f)) => f,
        Ok(None) => return err("forward not found"),
        Err(e) => return store_err(e),
    };
    if let Ok(Some(tunnel)) = state.store.tunnel_by_id(forward.tunnel_id).await {
        let ut_id = state
            .store
            .user_tunnel_for(forward.user_id, tunnel.id)
            .await
            .ok()
            .flatten()
            .map(|ut| ut.id)
            .unwrap_or(0);
        let name = service_name(forward.id, forward.user_id, ut_id);
        for node_id in involved_nodes(&tunnel) {
            if let Err(e) = state.dispatcher.send_command(
                node_id,
                CommandKind::DeleteService,
                json!({"services": [name]}),
            ) {
                warn!(node_id, error = %e, "delete not delivered");
            }
        }
    }
    match state.store.delete_forward(req.id).await {
        Ok(()) => ok_empty(),
        Err(e) => store_err(e),
    }
}

async fn set_forward_run_state(state: &AppState, id: i64, status: i64) -> Json<ApiResponse> {
    let forward = match state.store.forward_by_id(id).await {
        Ok(Some(f)) => f,
        Ok(None) => return err("forward not found"),
        Err(e) => return store_err(e),
    };
    if let Err(e) = state.store.set_forward_status(id, status).await {
        return store_err(e);
    }
    if let Ok(Some(tunnel)) = state.store.tunnel_by_id(forward.tunnel_id).await {
        let ut_id = state
            .store
            .user_tunnel_for(forward.user_id, tunnel.id)
            .await
            .ok()
            .flatten()
            .map(|ut| ut.id)
            .unwrap_or(0);
        let name = service_name(forward.id, forward.user_id, ut_id);
        let kind = if status == STATUS_ACTIVE {
            CommandKind::ResumeService
        } else {
            CommandKind::PauseService
        };
        let payload = json!({"services": [name]});
        let _ = state
            .dispatcher
            .send_command(tunnel.in_node_id, kind, payload.clone());
        if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
            if let Some(out) = tunnel.out_node_id {
                let _ = state.dispatcher.send_command(out, kind, payload);
            }
        }
    }
    ok_empty()
}

pub async fn forward_pause(
    State(state): State<AppState>,
    Json(req): Json<IdDto>,
) -> Json<ApiResponse> {
    set_forward_run_state(&state, req.id, STATUS_PAUSED).await
}

pub async fn forward_resume(
    State(state): State<AppState>,
    Json(req): Json<IdDto>,
) -> Json<ApiResponse> {
    set_forward_run_state(&state, req.id, STATUS_ACTIVE).await
}

// ─── Diagnostics ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseDto {
    pub forward_id: i64,
}

pub async fn forward_diagnose(
    State(state): State<AppState>,
    Json(req): Json<DiagnoseDto>,
) -> Json<ApiResponse> {
    let diag = Diagnostics::new(&state);
    match diag.forward_diagnose(req.forward_id).await {
        Ok(steps) => ok(json!({
            "diagId": diag.diag_id,
            "timestamp": crate::store::now_ms(),
            "results": steps,
        })),
        Err(e) => err(e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseStepDto {
    pub forward_id: i64,
    pub step: String,
}

pub async fn forward_diagnose_step(
    State(state): State<AppState>,
    Json(req): Json<DiagnoseStepDto>,
) -> Json<ApiResponse> {
    let diag = Diagnostics::new(&state);
    match diag.diagnose_step(req.forward_id, &req.step).await {
        Ok(steps) => ok(json!({"diagId": diag.diag_id, "results": steps})),
        Err(e) => err(e.to_string()),
    }
}

// ─── Agent Endpoints ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SecretDto {
    pub secret: String,
}

async fn node_for_secret(state: &AppState, secret: &str) -> Result<Node, Json<ApiResponse>> {
    match state.store.node_by_secret(secret).await {
        Ok(Some(node)) => Ok(node),
        Ok(None) => Err(err("node not found")),
        Err(e) => Err(store_err(e)),
    }
}

/// The declared service set for the node resolved by secret; the agent
/// pulls this on its own reconcile cycles.
pub async fn agent_desired_services(
    State(state): State<AppState>,
    Json(req): Json<SecretDto>,
) -> Json<ApiResponse> {
    let node = match node_for_secret(&state, &req.secret).await {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    match planner::desired_services(&state.store, node.id).await {
        Ok(services) => ok(services),
        Err(e) => err(e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct PushServicesDto {
    pub secret: String,
    #[serde(default)]
    pub services: Vec<Value>,
}

/// The agent found services missing locally and asks for a push.
pub async fn agent_push_services(
    State(state): State<AppState>,
    Json(req): Json<PushServicesDto>,
) -> Json<ApiResponse> {
    let node = match node_for_secret(&state, &req.secret).await {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    if req.services.is_empty() {
        return ok_empty();
    }
    let chained = req
        .services
        .iter()
        .any(|s| s.pointer("/handler/chain").is_some());
    if let Err(e) =
        state
            .dispatcher
            .send_command(node.id, CommandKind::AddService, Value::Array(req.services))
    {
        return err(format!("push failed: {e}"));
    }
    if chained {
        let _ = state.dispatcher.send_command(
            node.id,
            CommandKind::RestartGost,
            json!({"reason": "push"}),
        );
    }
    ok_empty()
}

#[derive(Debug, Deserialize)]
pub struct RemoveServicesDto {
    pub secret: String,
    #[serde(default)]
    pub services: Vec<String>,
}

pub async fn agent_remove_services(
    State(state): State<AppState>,
    Json(req): Json<RemoveServicesDto>,
) -> Json<ApiResponse> {
    let node = match node_for_secret(&state, &req.secret).await {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    if req.services.is_empty() {
        return ok_empty();
    }
    match state.dispatcher.send_command(
        node.id,
        CommandKind::DeleteService,
        json!({"services": req.services}),
    ) {
        Ok(()) => ok_empty(),
        Err(e) => err(format!("remove failed: {e}")),
    }
}

pub async fn agent_reconcile(
    State(state): State<AppState>,
    Json(req): Json<SecretDto>,
) -> Json<ApiResponse> {
    let node = match node_for_secret(&state, &req.secret).await {
        Ok(node) => node,
        Err(resp) => return resp,
    };
    match reconcile::reconcile_node(&state, node.id).await {
        Ok(outcome) => ok(json!({"pushed": outcome.pushed, "removed": outcome.removed})),
        Err(e) => err(e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdDto {
    pub node_id: i64,
}

/// Admin-triggered reconcile for one node.
pub async fn agent_reconcile_node(
    State(state): State<AppState>,
    Json(req): Json<NodeIdDto>,
) -> Json<ApiResponse> {
    match reconcile::reconcile_node(&state, req.node_id).await {
        Ok(outcome) => ok(json!({"pushed": outcome.pushed, "removed": outcome.removed})),
        Err(e) => err(e.to_string()),
    }
}

// ─── Flow Upload ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    #[serde(default)]
    pub secret: String,
}

/// `POST /flow/upload?secret=…` — always answers `ok`; an unknown
/// secret is indistinguishable from success so node inventory cannot be
/// probed.
pub async fn flow_upload(
    State(state): State<AppState>,
    Query(query): Query<FlowQuery>,
    body: String,
) -> &'static str {
    match state.store.node_by_secret(&query.secret).await {
        Ok(Some(_)) => {}
        _ => return "ok",
    }
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return "ok";
    };
    let Some(report) = FlowReport::parse(&value) else {
        return "ok";
    };
    if state.flow_tx.try_send(FlowJob { report }).is_err() {
        warn!("flow queue saturated, report dropped");
    }
    "ok"
}
