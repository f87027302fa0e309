//! # Flux Panel Controller
//!
//! Control plane for a fleet of edge forwarding agents. Agents dial in
//! over a long-lived WebSocket (`/system-info`); the controller persists
//! the desired topology (nodes, tunnels, forwards, quotas) and drives
//! every agent toward it through command fan-out, request/response
//! correlation, periodic reconciliation, flow accounting, and remote
//! diagnostics.
//!
//! ```text
//! Agent ──WS──► Controller ──SQL──► Store
//!   ▲              │
//!   └── commands ──┘  (AddService / Diagnose / PauseService / …)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`](flux_protocol) — wire frames and service configuration
//! - [`state`]     — root-owned shared state
//! - [`registry`]  — per-node agent session registry
//! - [`pending`]   — requestId → waiter correlation table
//! - [`dispatch`]  — command fan-out and request/response
//! - [`handlers`]  — WebSocket session lifecycle
//! - [`reconcile`] — desired-vs-observed convergence
//! - [`planner`]   — service compilation and port allocation
//! - [`flow`]      — usage ingestion and quota enforcement
//! - [`diagnose`]  — remote probes and the iperf3 path measurement
//! - [`api`]       — REST endpoints

mod api;
mod config;
mod diagnose;
mod dispatch;
mod flow;
mod handlers;
mod models;
mod pending;
mod planner;
mod reconcile;
mod registry;
mod state;
mod store;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::pending::PendingRequests;
use crate::registry::ControlRegistry;
use crate::state::AppState;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flux_panel_server=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))?;

    // Process-wide shared components, owned here and threaded into
    // handlers; no globals.
    let registry = Arc::new(ControlRegistry::new());
    let pending = Arc::new(PendingRequests::new());
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), pending.clone()));
    let flow_tx = flow::spawn_ingest(store.clone(), dispatcher.clone());

    let state = AppState::new(
        config.clone(),
        store,
        registry,
        pending.clone(),
        dispatcher,
        flow_tx,
    );

    tokio::spawn(reconcile::run_periodic(state.clone()));

    let app = Router::new()
        .route("/health", get(api::health))
        // agent control channel
        .route("/system-info", get(handlers::ws_handler))
        // flow accounting
        .route("/flow/upload", post(api::flow_upload))
        // nodes
        .route("/api/v1/node/create", post(api::node_create))
        .route("/api/v1/node/list", post(api::node_list))
        .route("/api/v1/node/update", post(api::node_update))
        .route("/api/v1/node/delete", post(api::node_delete))
        .route("/api/v1/node/connections", get(api::node_connections))
        .route("/api/v1/node/query-services", post(api::node_query_services))
        .route("/api/v1/node/ops", post(api::node_ops))
        // tunnels
        .route("/api/v1/tunnel/create", post(api::tunnel_create))
        .route("/api/v1/tunnel/list", post(api::tunnel_list))
        .route("/api/v1/tunnel/update", post(api::tunnel_update))
        .route("/api/v1/tunnel/delete", post(api::tunnel_delete))
        // forwards
        .route("/api/v1/forward/create", post(api::forward_create))
        .route("/api/v1/forward/list", post(api::forward_list))
        .route("/api/v1/forward/update", post(api::forward_update))
        .route("/api/v1/forward/delete", post(api::forward_delete))
        .route("/api/v1/forward/pause", post(api::forward_pause))
        .route("/api/v1/forward/resume", post(api::forward_resume))
        .route("/api/v1/forward/diagnose", post(api::forward_diagnose))
        .route("/api/v1/forward/diagnose-step", post(api::forward_diagnose_step))
        // agent reconcile surface
        .route("/api/v1/agent/desired-services", post(api::agent_desired_services))
        .route("/api/v1/agent/push-services", post(api::agent_push_services))
        .route("/api/v1/agent/remove-services", post(api::agent_remove_services))
        .route("/api/v1/agent/reconcile", post(api::agent_reconcile))
        .route("/api/v1/agent/reconcile-node", post(api::agent_reconcile_node))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!(addr = %config.listen_addr, "flux-panel controller listening");
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            // wake every in-flight request with a cancellation error
            pending.drain();
            info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}
