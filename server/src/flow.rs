//! # Flow Ingest
//!
//! Accepts usage deltas reported by agents, applies them atomically to
//! the forward/user/permission counters, projects the result against
//! quotas and expiry, and pauses every forward of an offending scope.
//!
//! Ingestion is bounded: HTTP handlers and the session router hand
//! reports to a fixed-depth queue and always answer immediately; a
//! single worker task drains the queue so store transactions never run
//! on the transport path. A saturated queue drops reports — the
//! controller is not authoritative for usage under pressure, lost
//! reports are lost.

use std::sync::Arc;

use flux_protocol::{CommandKind, FlowDelta, FlowReport};
use serde_json::json;
use tokio::sync::mpsc;

use crate::dispatch::Dispatcher;
use crate::models::{Forward, Tunnel, FLOW_MODE_SINGLE, STATUS_ACTIVE, STATUS_PAUSED, TUNNEL_TUNNEL_FORWARD};
use crate::planner::service_name;
use crate::store::{hour_key_utc8, now_ms, FlowApply, Store, StoreError};

pub const FLOW_QUEUE_DEPTH: usize = 1024;

/// One report queued for ingestion.
#[derive(Debug)]
pub struct FlowJob {
    pub report: FlowReport,
}

/// Spawns the ingest worker and returns the bounded submission handle.
pub fn spawn_ingest(store: Store, dispatcher: Arc<Dispatcher>) -> mpsc::Sender<FlowJob> {
    let (tx, mut rx) = mpsc::channel::<FlowJob>(FLOW_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            for delta in job.report.deltas() {
                if let Err(e) = process_delta(&store, &dispatcher, &delta).await {
                    tracing::warn!(service = %delta.service, error = %e, "flow delta not applied");
                }
            }
        }
    });
    tx
}

/// Splits `<forwardId>_<userId>_<userTunnelId>`. The agent-internal
/// reporter name and malformed names are ignored.
pub fn parse_service_name(name: &str) -> Option<(i64, i64, i64)> {
    if name == "web_api" {
        return None;
    }
    let mut parts = name.split('_');
    let forward_id = parts.next()?.parse().ok()?;
    let user_id = parts.next()?.parse().ok()?;
    let user_tunnel_id = parts.next()?.parse().ok()?;
    Some((forward_id, user_id, user_tunnel_id))
}

/// Quota charge for one delta: `double` counts both directions,
/// `single` counts the larger one.
pub fn quota_increment(flow_mode: i64, in_inc: i64, out_inc: i64) -> i64 {
    if flow_mode == FLOW_MODE_SINGLE {
        in_inc.max(out_inc)
    } else {
        in_inc + out_inc
    }
}

/// Quota is in GiB; 0 disables the check.
pub fn over_quota(flow_gib: i64, in_bytes: i64, out_bytes: i64) -> bool {
    let limit = flow_gib.saturating_mul(1 << 30);
    limit > 0 && in_bytes + out_bytes > limit
}

pub fn expired(expires_at_ms: Option<i64>, now: i64) -> bool {
    matches!(expires_at_ms, Some(t) if t > 0 && t <= now)
}

pub async fn process_delta(
    store: &Store,
    dispatcher: &Dispatcher,
    delta: &FlowDelta,
) -> Result<(), StoreError> {
    let Some((forward_id, user_id, user_tunnel_id)) = parse_service_name(&delta.service) else {
        return Ok(());
    };
    let Some(forward) = store.forward_by_id(forward_id).await? else {
        return Ok(());
    };
    let Some(tunnel) = store.tunnel_by_id(forward.tunnel_id).await? else {
        return Ok(());
    };

    let in_inc = delta.in_bytes;
    let out_inc = delta.out_bytes;
    store
        .apply_flow(&FlowApply {
            forward_id,
            user_id,
            user_tunnel_id: (user_tunnel_id != 0).then_some(user_tunnel_id),
            in_inc,
            out_inc,
            quota_inc: quota_increment(tunnel.flow_mode, in_inc, out_inc),
            hour_key: hour_key_utc8(),
        })
        .await?;

    // Re-read and project: quota, expiry, and administrative status all
    // pause the scope.
    let now = now_ms();
    if let Some(user) = store.user_by_id(user_id).await? {
        let breached = over_quota(user.flow, user.in_bytes, user.out_bytes)
            || expired(user.expires_at_ms, now)
            || user.status != STATUS_ACTIVE;
        if breached {
            pause_user_scope(store, dispatcher, user_id).await?;
        }
    }
    if user_tunnel_id != 0 {
        if let Some(ut) = store.user_tunnel_by_id(user_tunnel_id).await? {
            let breached = over_quota(ut.flow, ut.in_bytes, ut.out_bytes)
                || expired(ut.expires_at_ms, now)
                || ut.status != STATUS_ACTIVE;
            if breached {
                pause_user_tunnel_scope(store, dispatcher, ut.user_id, ut.tunnel_id, ut.id).await?;
            }
        }
    }
    Ok(())
}

/// Pauses every forward the user owns and marks the user inactive.
pub async fn pause_user_scope(
    store: &Store,
    dispatcher: &Dispatcher,
    user_id: i64,
) -> Result<(), StoreError> {
    store.set_user_status(user_id, STATUS_PAUSED).await?;
    let forwards = store.forwards_for_user(user_id).await?;
    pause_forwards(store, dispatcher, &forwards).await
}

/// Pauses the forwards of one user/tunnel permission.
pub async fn pause_user_tunnel_scope(
    store: &Store,
    dispatcher: &Dispatcher,
    user_id: i64,
    tunnel_id: i64,
    user_tunnel_id: i64,
) -> Result<(), StoreError> {
    store
        .set_user_tunnel_status(user_tunnel_id, STATUS_PAUSED)
        .await?;
    let forwards = store.forwards_for_user_tunnel(user_id, tunnel_id).await?;
    pause_forwards(store, dispatcher, &forwards).await
}

async fn pause_forwards(
    store: &Store,
    dispatcher: &Dispatcher,
    forwards: &[Forward],
) -> Result<(), StoreError> {
    for forward in forwards {
        store.set_forward_status(forward.id, STATUS_PAUSED).await?;
        let Some(tunnel) = store.tunnel_by_id(forward.tunnel_id).await? else {
            continue;
        };
        let ut_id = store
            .user_tunnel_for(forward.user_id, forward.tunnel_id)
            .await?
            .map(|ut| ut.id)
            .unwrap_or(0);
        let name = service_name(forward.id, forward.user_id, ut_id);
        send_pause(dispatcher, &tunnel, &name);
    }
    Ok(())
}

/// `PauseService` goes to the entry node and, for tunnel forwards, the
/// exit node as well. Delivery is best-effort: an offline node converges
/// on its next reconcile.
fn send_pause(dispatcher: &Dispatcher, tunnel: &Tunnel, name: &str) {
    let payload = json!({"services": [name]});
    if let Err(e) = dispatcher.send_command(tunnel.in_node_id, CommandKind::PauseService, payload.clone()) {
        tracing::debug!(node_id = tunnel.in_node_id, error = %e, "pause not delivered");
    }
    if tunnel.kind == TUNNEL_TUNNEL_FORWARD {
        if let Some(out_id) = tunnel.out_node_id {
            if let Err(e) = dispatcher.send_command(out_id, CommandKind::PauseService, payload) {
                tracing::debug!(node_id = out_id, error = %e, "pause not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FLOW_MODE_DOUBLE, TUNNEL_PORT_FORWARD};
    use crate::pending::PendingRequests;
    use crate::registry::{AgentSession, ControlRegistry};
    use crate::store::{NewForward, NewTunnel};
    use flux_protocol::OutboundFrame;
    use std::collections::BTreeMap;

    #[test]
    fn quota_rules() {
        assert_eq!(quota_increment(FLOW_MODE_DOUBLE, 100, 40), 140);
        assert_eq!(quota_increment(FLOW_MODE_SINGLE, 100, 40), 100);
        assert_eq!(quota_increment(FLOW_MODE_SINGLE, 10, 40), 40);
    }

    #[test]
    fn single_mode_counts_max() {
        // the quota charge never exceeds the larger direction
        assert_eq!(quota_increment(FLOW_MODE_SINGLE, 7, 7), 7);
        assert_eq!(quota_increment(FLOW_MODE_SINGLE, 0, 0), 0);
    }

    #[test]
    fn quota_boundary_is_strict() {
        let gib = 1_i64 << 30;
        assert!(!over_quota(1, gib, 0));
        assert!(over_quota(1, gib, 1));
        assert!(!over_quota(0, i64::MAX / 2, 0));
    }

    #[test]
    fn expiry_requires_positive_timestamp() {
        assert!(expired(Some(10), 10));
        assert!(expired(Some(5), 10));
        assert!(!expired(Some(11), 10));
        assert!(!expired(Some(0), 10));
        assert!(!expired(None, 10));
    }

    #[test]
    fn service_names_parse() {
        assert_eq!(parse_service_name("12_3_4"), Some((12, 3, 4)));
        assert_eq!(parse_service_name("12_3_0"), Some((12, 3, 0)));
        assert_eq!(parse_service_name("web_api"), None);
        assert_eq!(parse_service_name("12_3"), None);
        assert_eq!(parse_service_name("x_y_z"), None);
    }

    struct Scenario {
        store: Store,
        dispatcher: Dispatcher,
        entry_rx: tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
        exit_rx: tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
        user_id: i64,
        f1: i64,
        f2: i64,
    }

    /// User with a 1 GiB quota sitting 100 bytes under it, one plain
    /// forward on tunnel T1 and one tunnel-forward on T2.
    async fn quota_breach_scenario() -> Scenario {
        let store = Store::open_in_memory().await.unwrap();
        let entry = store
            .create_node("entry", "1.1.1.1", "1.1.1.1", 10000, 20000)
            .await
            .unwrap();
        let exit = store
            .create_node("exit", "9.9.9.9", "9.9.9.9", 50000, 60000)
            .await
            .unwrap();
        let t1 = store
            .create_tunnel(&NewTunnel {
                name: "t1".into(),
                in_node_id: entry.id,
                out_node_id: None,
                kind: TUNNEL_PORT_FORWARD,
                path_node_ids: vec![],
                iface_map: BTreeMap::new(),
                bind_map: BTreeMap::new(),
                iface: None,
                flow_mode: FLOW_MODE_DOUBLE,
            })
            .await
            .unwrap();
        let t2 = store
            .create_tunnel(&NewTunnel {
                name: "t2".into(),
                in_node_id: entry.id,
                out_node_id: Some(exit.id),
                kind: TUNNEL_TUNNEL_FORWARD,
                path_node_ids: vec![],
                iface_map: BTreeMap::new(),
                bind_map: BTreeMap::new(),
                iface: None,
                flow_mode: FLOW_MODE_DOUBLE,
            })
            .await
            .unwrap();
        let user = store.create_user("u", 1, None).await.unwrap();
        let f1 = store
            .create_forward(&NewForward {
                user_id: user.id,
                tunnel_id: t1.id,
                name: "f1".into(),
                in_port: 10000,
                out_port: None,
                path_ports: BTreeMap::new(),
                remote_addr: "1.2.3.4:80".into(),
                iface: None,
            })
            .await
            .unwrap();
        let f2 = store
            .create_forward(&NewForward {
                user_id: user.id,
                tunnel_id: t2.id,
                name: "f2".into(),
                in_port: 10001,
                out_port: Some(50001),
                path_ports: BTreeMap::new(),
                remote_addr: "5.6.7.8:443".into(),
                iface: None,
            })
            .await
            .unwrap();
        // preload the user to 100 bytes under the limit
        store
            .apply_flow(&FlowApply {
                forward_id: f1.id,
                user_id: user.id,
                user_tunnel_id: None,
                in_inc: (1 << 30) - 100,
                out_inc: 0,
                quota_inc: (1 << 30) - 100,
                hour_key: "00:00".into(),
            })
            .await
            .unwrap();

        let registry = Arc::new(ControlRegistry::new());
        let (entry_tx, entry_rx) = tokio::sync::mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = tokio::sync::mpsc::unbounded_channel();
        registry.register(AgentSession::new(entry.id, "1.0".into(), entry_tx));
        registry.register(AgentSession::new(exit.id, "1.0".into(), exit_tx));
        let dispatcher = Dispatcher::new(registry, Arc::new(PendingRequests::new()));

        Scenario {
            store,
            dispatcher,
            entry_rx,
            exit_rx,
            user_id: user.id,
            f1: f1.id,
            f2: f2.id,
        }
    }

    #[tokio::test]
    async fn quota_breach_pauses_all_user_forwards() {
        let mut s = quota_breach_scenario().await;
        let delta = FlowDelta {
            service: format!("{}_{}_0", s.f1, s.user_id),
            in_bytes: 200,
            out_bytes: 0,
        };
        process_delta(&s.store, &s.dispatcher, &delta).await.unwrap();

        let user = s.store.user_by_id(s.user_id).await.unwrap().unwrap();
        assert_eq!(user.in_bytes, (1 << 30) + 100);
        assert_eq!(user.status, STATUS_PAUSED);
        for fid in [s.f1, s.f2] {
            let f = s.store.forward_by_id(fid).await.unwrap().unwrap();
            assert_eq!(f.status, STATUS_PAUSED);
        }

        let mut entry_paused = Vec::new();
        while let Ok(frame) = s.entry_rx.try_recv() {
            assert_eq!(frame.kind, CommandKind::PauseService);
            entry_paused.push(frame.data["services"][0].as_str().unwrap().to_string());
        }
        assert_eq!(
            entry_paused,
            vec![
                format!("{}_{}_0", s.f1, s.user_id),
                format!("{}_{}_0", s.f2, s.user_id)
            ]
        );

        // the tunnel-forward's exit node is paused too
        let exit_frame = s.exit_rx.try_recv().unwrap();
        assert_eq!(exit_frame.kind, CommandKind::PauseService);
        assert_eq!(
            exit_frame.data["services"][0],
            format!("{}_{}_0", s.f2, s.user_id)
        );
        assert!(s.exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn under_quota_report_pauses_nothing() {
        let mut s = quota_breach_scenario().await;
        let delta = FlowDelta {
            service: format!("{}_{}_0", s.f1, s.user_id),
            in_bytes: 50,
            out_bytes: 0,
        };
        process_delta(&s.store, &s.dispatcher, &delta).await.unwrap();
        let user = s.store.user_by_id(s.user_id).await.unwrap().unwrap();
        assert_eq!(user.status, STATUS_ACTIVE);
        assert!(s.entry_rx.try_recv().is_err());
    }
}
