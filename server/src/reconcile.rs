//! # Reconciler
//!
//! Convergence between the declared service set for a node and the set
//! the agent actually has in its local configuration. Missing services
//! are pushed; in strict mode, controller-managed leftovers are deleted.
//! Services without the managed marker are never touched, which keeps
//! manually-installed services on shared nodes alive.
//!
//! Runs in three ways: a one-shot pass shortly after a session connects,
//! a single periodic task that walks nodes serially, and on demand from
//! the admin/agent HTTP endpoints.

use std::time::Duration;

use flux_protocol::{is_managed, CommandKind, ServiceConfig, ServiceSummary};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CONTROLLER_ID;
use crate::dispatch::{new_request_id, DispatchError, Dispatcher};
use crate::planner::{self, PlanError};
use crate::state::AppState;

const OBSERVE_TIMEOUT: Duration = Duration::from_secs(5);
const ON_CONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub pushed: usize,
    pub removed: usize,
}

/// One diff pass: `missing = D \ O`; `extra` (strict only) is the
/// managed slice of `O \ D`.
pub fn diff_services(
    desired: &[ServiceConfig],
    observed: &[ServiceSummary],
    strict: bool,
) -> (Vec<ServiceConfig>, Vec<String>) {
    let observed_names: std::collections::HashSet<&str> =
        observed.iter().map(|s| s.name.as_str()).collect();
    let missing: Vec<ServiceConfig> = desired
        .iter()
        .filter(|s| !observed_names.contains(s.name.as_str()))
        .cloned()
        .collect();
    let mut extra = Vec::new();
    if strict {
        let desired_names: std::collections::HashSet<&str> =
            desired.iter().map(|s| s.name.as_str()).collect();
        for summary in observed {
            if !desired_names.contains(summary.name.as_str())
                && is_managed(summary.metadata.as_ref(), CONTROLLER_ID)
            {
                extra.push(summary.name.clone());
            }
        }
    }
    (missing, extra)
}

/// Pulls the agent's current service list over the control channel.
pub async fn query_services(
    dispatcher: &Dispatcher,
    node_id: i64,
    timeout: Duration,
) -> Result<Vec<ServiceSummary>, DispatchError> {
    let reply = dispatcher
        .request_op(
            node_id,
            CommandKind::QueryServices,
            json!({"requestId": new_request_id(), "filter": ""}),
            timeout,
        )
        .await?;
    Ok(reply
        .get("data")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default())
}

/// One full reconcile pass for a node.
pub async fn reconcile_node(
    state: &AppState,
    node_id: i64,
) -> Result<ReconcileOutcome, ReconcileError> {
    let desired = planner::desired_services(&state.store, node_id).await?;
    let observed = query_services(&state.dispatcher, node_id, OBSERVE_TIMEOUT).await?;
    let (missing, extra) = diff_services(&desired, &observed, state.config.strict_reconcile);

    let outcome = ReconcileOutcome {
        pushed: missing.len(),
        removed: extra.len(),
    };
    if !missing.is_empty() {
        let restart = missing.iter().any(ServiceConfig::has_chain);
        state.dispatcher.send_command(
            node_id,
            CommandKind::AddService,
            serde_json::to_value(&missing).unwrap_or(Value::Null),
        )?;
        if restart {
            let _ = state.dispatcher.send_command(
                node_id,
                CommandKind::RestartGost,
                json!({"reason": "reconcile"}),
            );
        }
    }
    if !extra.is_empty() {
        state.dispatcher.send_command(
            node_id,
            CommandKind::DeleteService,
            json!({"services": extra}),
        )?;
    }
    if outcome.pushed > 0 || outcome.removed > 0 {
        info!(node_id, pushed = outcome.pushed, removed = outcome.removed, "reconciled");
    } else {
        debug!(node_id, "reconcile: converged");
    }
    Ok(outcome)
}

/// One-shot pass soon after a session registers; gives the agent a
/// moment to finish its own startup before the first sync.
pub async fn reconcile_on_connect(state: AppState, node_id: i64) {
    tokio::time::sleep(ON_CONNECT_DELAY).await;
    if let Err(e) = reconcile_node(&state, node_id).await {
        debug!(node_id, error = %e, "on-connect reconcile failed");
    }
}

/// The periodic loop: one task per process, nodes walked serially so a
/// slow agent never multiplies load. `RECONCILE_INTERVAL=0` disables it.
pub async fn run_periodic(state: AppState) {
    let interval = state.config.reconcile_interval;
    if interval == 0 {
        info!("periodic reconcile disabled");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();
    loop {
        ticker.tick().await;
        let nodes = match state.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "reconcile: node list failed");
                continue;
            }
        };
        for node in nodes {
            if !state.registry.has_session(node.id) {
                continue;
            }
            if let Err(e) = reconcile_node(&state, node.id).await {
                debug!(node_id = node.id, error = %e, "periodic reconcile failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_protocol::{
        managed_metadata, ForwarderConfig, ForwarderNode, HandlerConfig, ListenerConfig,
    };

    fn desired(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            addr: ":10000".into(),
            listener: ListenerConfig { kind: "tcp".into() },
            handler: HandlerConfig {
                kind: "forward".into(),
                auth: None,
                chain: None,
            },
            forwarder: Some(ForwarderConfig {
                nodes: vec![ForwarderNode {
                    name: "target".into(),
                    addr: "1.2.3.4:80".into(),
                }],
            }),
            metadata: Some(managed_metadata(CONTROLLER_ID)),
        }
    }

    fn observed(name: &str, managed: bool) -> ServiceSummary {
        ServiceSummary {
            name: name.into(),
            addr: ":10000".into(),
            handler: "forward".into(),
            port: 10000,
            listening: true,
            metadata: managed.then(|| {
                serde_json::to_value(managed_metadata(CONTROLLER_ID)).unwrap()
            }),
        }
    }

    #[test]
    fn missing_services_are_pushed() {
        let d = vec![desired("s1"), desired("s2")];
        let o = vec![observed("s2", true)];
        let (missing, extra) = diff_services(&d, &o, false);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "s1");
        assert!(extra.is_empty());
    }

    #[test]
    fn strict_mode_deletes_only_managed_extras() {
        let d = vec![desired("s1")];
        let o = vec![
            observed("s1", true),
            observed("s2", true),
            observed("s3", false),
        ];
        let (missing, extra) = diff_services(&d, &o, true);
        assert!(missing.is_empty());
        assert_eq!(extra, vec!["s2".to_string()]);
    }

    #[test]
    fn non_strict_mode_never_deletes() {
        let d = vec![desired("s1")];
        let o = vec![observed("s1", true), observed("s2", true)];
        let (_, extra) = diff_services(&d, &o, false);
        assert!(extra.is_empty());
    }

    #[test]
    fn converged_sets_diff_to_nothing() {
        let d = vec![desired("s1"), desired("s2")];
        let o = vec![observed("s1", true), observed("s2", true)];
        let (missing, extra) = diff_services(&d, &o, true);
        assert!(missing.is_empty());
        assert!(extra.is_empty());
    }
}
