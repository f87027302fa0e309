//! # Server State
//!
//! The root-owned shared state threaded into every handler. There are no
//! package-level globals: the registry, pending table, store handle, and
//! flow-ingest queue are all constructed in `main` and cloned into
//! request handlers through Axum's `State`.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::flow::FlowJob;
use crate::pending::PendingRequests;
use crate::registry::ControlRegistry;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub registry: Arc<ControlRegistry>,
    pub pending: Arc<PendingRequests>,
    pub dispatcher: Arc<Dispatcher>,
    /// Bounded hand-off into the flow-ingest worker; reports are dropped
    /// (and logged) when the queue is saturated.
    pub flow_tx: mpsc::Sender<FlowJob>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        registry: Arc<ControlRegistry>,
        pending: Arc<PendingRequests>,
        dispatcher: Arc<Dispatcher>,
        flow_tx: mpsc::Sender<FlowJob>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            pending,
            dispatcher,
            flow_tx,
        }
    }
}
