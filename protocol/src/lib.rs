//! # Control-Channel Protocol
//!
//! Wire types shared between the flux-panel controller and its remote
//! agents. All traffic is newline-free JSON frames over a WebSocket:
//!
//! - **Outbound** (controller → agent): `{"type": "<Command>", "data": …}`
//! - **Inbound** (agent → controller): objects tagged by `type`; command
//!   replies additionally carry a top-level `requestId`.
//!
//! Inbound parsing is defensive. Agents in the field have been observed
//! shipping double-encoded frames (a JSON string containing JSON) and
//! frames with stray bytes around the object, so [`parse_envelope`] walks
//! a three-stage recovery path: direct decode, string-unwrap decode, and
//! a brace-trim decode. Only the outermost envelope is untyped; payloads
//! decode into the typed structures below.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame size cap. Oversize frames are fatal for the session.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

// ─── Outbound Commands ──────────────────────────────────────────

/// Command tags understood by the agent. Serialized verbatim as the
/// `type` field of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    AddService,
    UpdateService,
    DeleteService,
    PauseService,
    ResumeService,
    QueryServices,
    Diagnose,
    RestartGost,
    RunScript,
    WriteFile,
    RestartService,
    StopService,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::AddService => "AddService",
            CommandKind::UpdateService => "UpdateService",
            CommandKind::DeleteService => "DeleteService",
            CommandKind::PauseService => "PauseService",
            CommandKind::ResumeService => "ResumeService",
            CommandKind::QueryServices => "QueryServices",
            CommandKind::Diagnose => "Diagnose",
            CommandKind::RestartGost => "RestartGost",
            CommandKind::RunScript => "RunScript",
            CommandKind::WriteFile => "WriteFile",
            CommandKind::RestartService => "RestartService",
            CommandKind::StopService => "StopService",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single controller → agent frame.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub data: Value,
}

impl OutboundFrame {
    pub fn new(kind: CommandKind, data: Value) -> Self {
        Self { kind, data }
    }
}

// ─── Service Configuration ──────────────────────────────────────

/// A named listener+handler pair realized by the agent's data plane.
///
/// Mirrors the agent-local service configuration entry: the agent merges
/// pushed services into its config file keyed by `name`, so re-sending a
/// name replaces the previous definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub listener: ListenerConfig,
    pub handler: HandlerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<ForwarderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// An ordered sequence of hops a connection traverses before reaching
/// the forwarder target. Each hop node names the dialer/connector pair
/// used to reach the next element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<ChainHop>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainHop {
    pub name: String,
    pub nodes: Vec<ChainNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub name: String,
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector: Option<ConnectorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialer: Option<DialerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialerConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub nodes: Vec<ForwarderNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderNode {
    pub name: String,
    pub addr: String,
}

impl ServiceConfig {
    /// True when any part of this service references a chain; the agent's
    /// runtime must be restarted to pick new chains up.
    pub fn has_chain(&self) -> bool {
        self.handler.chain.is_some()
    }
}

/// Builds the `metadata` block marking a service as owned by `controller`.
/// Both spellings of the marker are written for compatibility; either is
/// accepted on read.
pub fn managed_metadata(controller: &str) -> BTreeMap<String, Value> {
    let mut m = BTreeMap::new();
    m.insert("managedBy".to_string(), Value::String(controller.to_string()));
    m.insert("managedby".to_string(), Value::String(controller.to_string()));
    m
}

/// Checks a reported metadata object for the managed marker.
pub fn is_managed(metadata: Option<&Value>, controller: &str) -> bool {
    let Some(meta) = metadata.and_then(Value::as_object) else {
        return false;
    };
    ["managedBy", "managedby"]
        .iter()
        .any(|k| meta.get(*k).and_then(Value::as_str) == Some(controller))
}

/// Formats `host:port`, bracketing bare IPv6 hosts.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ─── Agent Reports ──────────────────────────────────────────────

/// One entry of a `QueryServicesResult` reply: the agent's view of a
/// configured service and whether its port is actually listening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSummary {
    pub name: String,
    pub addr: String,
    pub handler: String,
    pub port: u16,
    pub listening: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Payload of a `Diagnose` command. Field meaning varies by `mode`:
/// `tcp`/`icmp` are connect/ping probes, `iperf3` starts a server or
/// runs a client depending on the `server`/`client` flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseData {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<Value>,
}

/// `data` object of a `DiagnoseResult` reply.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeReply {
    pub success: bool,
    pub average_time: Option<f64>,
    pub packet_loss: Option<f64>,
    pub message: Option<String>,
    pub bandwidth_mbps: Option<f64>,
    pub port: Option<u16>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

// ─── Usage Reports ──────────────────────────────────────────────

/// Legacy single-delta report: service name plus up/down byte counts.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyFlowReport {
    pub n: String,
    #[serde(default)]
    pub u: i64,
    #[serde(default)]
    pub d: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObserverStats {
    #[serde(rename = "inputBytes")]
    pub input_bytes: i64,
    #[serde(rename = "outputBytes")]
    pub output_bytes: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObserverEvent {
    pub kind: String,
    pub service: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub stats: ObserverStats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObserverReport {
    pub events: Vec<ObserverEvent>,
}

/// A usage delta attributed to one service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDelta {
    pub service: String,
    pub in_bytes: i64,
    pub out_bytes: i64,
}

/// Either of the two accepted usage-report shapes.
#[derive(Debug, Clone)]
pub enum FlowReport {
    Observer(ObserverReport),
    Legacy(LegacyFlowReport),
}

impl FlowReport {
    /// Tries the observer-events shape first, then the legacy shape.
    pub fn parse(value: &Value) -> Option<FlowReport> {
        if value.get("events").is_some() {
            if let Ok(r) = serde_json::from_value::<ObserverReport>(value.clone()) {
                return Some(FlowReport::Observer(r));
            }
        }
        serde_json::from_value::<LegacyFlowReport>(value.clone())
            .ok()
            .filter(|r| !r.n.is_empty())
            .map(FlowReport::Legacy)
    }

    /// Flattens the report into per-service deltas. Observer reports sum
    /// bytes across `type == "stats"` events for each service.
    pub fn deltas(&self) -> Vec<FlowDelta> {
        match self {
            FlowReport::Legacy(r) => vec![FlowDelta {
                service: r.n.clone(),
                in_bytes: r.u,
                out_bytes: r.d,
            }],
            FlowReport::Observer(r) => {
                let mut acc: BTreeMap<String, (i64, i64)> = BTreeMap::new();
                for ev in &r.events {
                    if ev.event_type != "stats" || ev.service.is_empty() {
                        continue;
                    }
                    let slot = acc.entry(ev.service.clone()).or_insert((0, 0));
                    slot.0 += ev.stats.input_bytes;
                    slot.1 += ev.stats.output_bytes;
                }
                acc.into_iter()
                    .map(|(service, (i, o))| FlowDelta {
                        service,
                        in_bytes: i,
                        out_bytes: o,
                    })
                    .collect()
            }
        }
    }
}

// ─── Inbound Envelope ───────────────────────────────────────────

/// The untyped outermost shape of an agent frame.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: String,
    pub request_id: Option<String>,
    pub data: Value,
}

/// One inbound frame, routed by class.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Host metrics snapshot, upserted as node runtime metadata.
    SystemInfo(Value),
    /// Interface/IP inventory for the node.
    Interfaces(Value),
    /// The agent's current service list.
    ServicesSnapshot(Value),
    /// A usage report delivered over the control channel.
    FlowReport(Value),
    /// Reply to a pending request, matched by `requestId`.
    Reply {
        kind: String,
        request_id: String,
        body: Value,
    },
    /// Agent-initiated request for a reconcile pass.
    ReconcileHint,
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON after all fallbacks")]
    Unparseable,
    #[error("frame object has no usable `type` tag")]
    MissingType,
}

/// Decodes a raw text frame into an [`Envelope`], applying the
/// three-stage recovery path: direct decode → double-encoded string →
/// brace-trim of the raw bytes.
pub fn parse_envelope(raw: &str) -> Result<Envelope, FrameError> {
    let value = parse_lenient(raw)?;
    let obj = value.as_object().ok_or(FrameError::Unparseable)?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    let request_id = obj
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = obj.get("data").cloned().unwrap_or(Value::Null);
    Ok(Envelope {
        kind,
        request_id,
        data,
    })
}

fn parse_lenient(raw: &str) -> Result<Value, FrameError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) if v.is_object() => return Ok(v),
        Ok(Value::String(inner)) => {
            if let Ok(v) = serde_json::from_str::<Value>(&inner) {
                if v.is_object() {
                    return Ok(v);
                }
            }
            if let Some(v) = brace_trim(&inner) {
                return Ok(v);
            }
        }
        _ => {}
    }
    brace_trim(raw).ok_or(FrameError::Unparseable)
}

fn brace_trim(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&raw[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Routes an envelope into its frame class. Any frame carrying a
/// `requestId` is a reply to a pending request, regardless of its tag.
pub fn classify(envelope: Envelope) -> InboundFrame {
    if let Some(request_id) = envelope.request_id {
        return InboundFrame::Reply {
            kind: envelope.kind,
            request_id,
            body: envelope.data,
        };
    }
    match envelope.kind.as_str() {
        "SystemInfo" => InboundFrame::SystemInfo(envelope.data),
        "Interfaces" => InboundFrame::Interfaces(envelope.data),
        "ServicesSnapshot" => InboundFrame::ServicesSnapshot(envelope.data),
        "FlowReport" => InboundFrame::FlowReport(envelope.data),
        "ReconcileHint" => InboundFrame::ReconcileHint,
        other => InboundFrame::Unknown(other.to_string()),
    }
}
