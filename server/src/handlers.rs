//! # Control-Channel Handlers
//!
//! WebSocket lifecycle for agent sessions:
//! - Upgrading `GET /system-info` after authenticating the node secret
//! - Running the per-session tasks (inbound reader on the upgrade task,
//!   outbound writer + heartbeat in a spawned task) and cleaning the
//!   registry when either side fails
//! - Routing inbound frames to the store, the flow-ingest queue, the
//!   pending-request table, or the reconciler

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flux_protocol::{classify, parse_envelope, FlowReport, InboundFrame, OutboundFrame, MAX_FRAME_BYTES};

use crate::flow::FlowJob;
use crate::models::Node;
use crate::reconcile;
use crate::registry::AgentSession;
use crate::state::AppState;
use crate::store::RuntimeField;

/// Heartbeat ping cadence on the write path.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A session with no inbound frame for this long is considered dead.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline on every transport write, keepalives included.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Agent connect marker; present but otherwise unused.
    #[serde(rename = "type")]
    #[allow(dead_code)]
    pub kind: Option<String>,
    pub secret: String,
    pub version: Option<String>,
}

/// `GET /system-info?type=1&secret=…&version=…` — the agent's control
/// channel. An unknown secret closes the exchange with no response body.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let node = match state.store.node_by_secret(&query.secret).await {
        Ok(Some(node)) => node,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            warn!(error = %e, "secret lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let version = query.version.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_session(socket, state, node, version))
}

/// Supervises one agent session: registers it, runs the reader loop on
/// this task and the writer/heartbeat in a spawned task, and tears both
/// down (idempotently) when either fails.
async fn handle_session(socket: WebSocket, state: AppState, node: Node, version: String) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let session = AgentSession::new(node.id, version.clone(), tx);
    state.registry.register(session.clone());
    if let Err(e) = state.store.set_node_online(node.id, &version).await {
        warn!(node_id = node.id, error = %e, "online mark failed");
    }
    info!(node_id = node.id, %version, "agent session established");

    // One-shot convergence shortly after connect.
    tokio::spawn(reconcile::reconcile_on_connect(state.clone(), node.id));

    let mut writer = tokio::spawn(write_loop(ws_sink, rx));

    // ── Inbound Loop ──
    // Any inbound frame (pongs included) feeds the idle timer. A dead
    // writer (failed or over-deadline write) ends the session too.
    let reader = async {
        loop {
            let next = tokio::time::timeout(READ_IDLE_TIMEOUT, ws_stream.next()).await;
            match next {
                Err(_) => {
                    warn!(node_id = node.id, "session idle past deadline, closing");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(node_id = node.id, error = %e, "read error");
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!(node_id = node.id, len = text.len(), "oversize frame, closing session");
                        break;
                    }
                    route_frame(&state, node.id, text.as_str()).await;
                }
                Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(_))) => {}
            }
        }
    };
    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {
            debug!(node_id = node.id, "writer task ended, closing session");
        }
    }

    // ── Teardown ──
    writer.abort();
    let last = state.registry.unregister(&session);
    if last {
        // NodeDisconnected: in-flight requests fail now rather than at
        // their timeout, and the node shows offline immediately.
        state.pending.fail_node(node.id);
        if let Err(e) = state.store.set_node_offline(node.id).await {
            warn!(node_id = node.id, error = %e, "offline mark failed");
        }
        info!(node_id = node.id, at_ms = crate::store::now_ms(), "node disconnected");
    } else {
        info!(node_id = node.id, "agent session closed");
    }
}

/// Drains the send queue onto the socket and keeps the channel alive
/// with a ping every [`HEARTBEAT_INTERVAL`]. Every write carries
/// [`WRITE_DEADLINE`]; a slow or failed write ends the session.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "frame serialize failed");
                        continue;
                    }
                };
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = heartbeat.tick() => {
                let ping = Message::Ping(axum::body::Bytes::from_static(b"ping"));
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(ping)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

/// Demultiplexes one inbound frame. Unparseable frames are logged and
/// dropped; the session continues.
async fn route_frame(state: &AppState, node_id: i64, raw: &str) {
    let envelope = match parse_envelope(raw) {
        Ok(env) => env,
        Err(e) => {
            warn!(node_id, error = %e, "dropping unparseable frame");
            return;
        }
    };
    match classify(envelope) {
        InboundFrame::SystemInfo(data) => {
            if let Err(e) = state
                .store
                .upsert_runtime(node_id, RuntimeField::SystemInfo, &data)
                .await
            {
                warn!(node_id, error = %e, "system-info upsert failed");
            }
        }
        InboundFrame::Interfaces(data) => {
            if let Err(e) = state
                .store
                .upsert_runtime(node_id, RuntimeField::Interfaces, &data)
                .await
            {
                warn!(node_id, error = %e, "interfaces upsert failed");
            }
        }
        InboundFrame::ServicesSnapshot(data) => {
            if let Err(e) = state
                .store
                .upsert_runtime(node_id, RuntimeField::Services, &data)
                .await
            {
                warn!(node_id, error = %e, "services snapshot upsert failed");
            }
        }
        InboundFrame::FlowReport(data) => match FlowReport::parse(&data) {
            Some(report) => {
                if state.flow_tx.try_send(FlowJob { report }).is_err() {
                    warn!(node_id, "flow queue saturated, report dropped");
                }
            }
            None => debug!(node_id, "flow frame with unknown shape dropped"),
        },
        InboundFrame::Reply {
            kind,
            request_id,
            body,
        } => {
            let reply = json!({"type": kind, "requestId": request_id, "data": body});
            if !state.pending.complete(&request_id, reply) {
                debug!(node_id, request_id, "late or duplicate reply discarded");
            }
        }
        InboundFrame::ReconcileHint => {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = reconcile::reconcile_node(&state, node_id).await {
                    debug!(node_id, error = %e, "hinted reconcile failed");
                }
            });
        }
        InboundFrame::Unknown(kind) => {
            debug!(node_id, %kind, "unknown frame type ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::Dispatcher;
    use crate::pending::PendingRequests;
    use crate::registry::ControlRegistry;
    use crate::store::Store;
    use std::sync::Arc;

    async fn test_state() -> (AppState, mpsc::Receiver<FlowJob>) {
        let store = Store::open_in_memory().await.unwrap();
        let registry = Arc::new(ControlRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), pending.clone()));
        let (flow_tx, flow_rx) = mpsc::channel(8);
        let config = Arc::new(Config {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            database_url: String::new(),
            reconcile_interval: 0,
            strict_reconcile: false,
        });
        (
            AppState::new(config, store, registry, pending, dispatcher, flow_tx),
            flow_rx,
        )
    }

    #[tokio::test]
    async fn telemetry_frames_update_runtime() {
        let (state, _flow_rx) = test_state().await;
        route_frame(
            &state,
            7,
            r#"{"type":"Interfaces","data":["10.0.0.1","10.126.126.7"]}"#,
        )
        .await;
        let runtime = state.store.runtime_for(7).await.unwrap().unwrap();
        assert_eq!(
            runtime.interface_list(),
            vec!["10.0.0.1".to_string(), "10.126.126.7".to_string()]
        );
    }

    #[tokio::test]
    async fn reply_frames_complete_pending_requests() {
        let (state, _flow_rx) = test_state().await;
        let rx = state.pending.register("rid-1", 7);
        route_frame(
            &state,
            7,
            r#"{"type":"QueryServicesResult","requestId":"rid-1","data":[{"name":"a"}]}"#,
        )
        .await;
        let reply = rx.await.unwrap();
        assert_eq!(reply["data"][0]["name"], "a");
    }

    #[tokio::test]
    async fn flow_frames_enter_the_bounded_queue() {
        let (state, mut flow_rx) = test_state().await;
        route_frame(
            &state,
            7,
            r#"{"type":"FlowReport","data":{"n":"1_2_0","u":10,"d":5}}"#,
        )
        .await;
        let job = flow_rx.try_recv().unwrap();
        assert_eq!(job.report.deltas()[0].service, "1_2_0");
    }

    #[tokio::test]
    async fn garbage_frames_are_dropped_quietly() {
        let (state, _flow_rx) = test_state().await;
        // must not panic or disturb state
        route_frame(&state, 7, "not even close to json").await;
        route_frame(&state, 7, r#"{"no_type": true}"#).await;
    }
}
