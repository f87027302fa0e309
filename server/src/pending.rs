//! # Pending Request Table
//!
//! Correlates outbound requests with agent replies by `requestId`. Each
//! entry holds a single-use [`oneshot`] sender, so exactly one waiter is
//! woken per id: the first matching reply wins, later duplicates find no
//! entry and are discarded. Timeout handling lives with the caller
//! (`Dispatcher::request_op`), which removes the entry on expiry.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

struct Waiter {
    node_id: i64,
    tx: oneshot::Sender<Value>,
}

#[derive(Default)]
pub struct PendingRequests {
    waiters: DashMap<String, Waiter>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `request_id`. Must be called before the
    /// command is written so a fast reply cannot race the registration.
    pub fn register(&self, request_id: &str, node_id: i64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .insert(request_id.to_string(), Waiter { node_id, tx });
        rx
    }

    /// Delivers a reply. Returns false when no waiter exists (expired or
    /// duplicate); such replies are dropped by the caller.
    pub fn complete(&self, request_id: &str, reply: Value) -> bool {
        match self.waiters.remove(request_id) {
            Some((_, waiter)) => waiter.tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops the waiter after a timeout so the table cannot leak.
    pub fn forget(&self, request_id: &str) {
        self.waiters.remove(request_id);
    }

    /// Cancels every in-flight request for a node whose connection
    /// dropped. Dropping the senders wakes the receivers with an error.
    pub fn fail_node(&self, node_id: i64) {
        self.waiters.retain(|_, w| w.node_id != node_id);
    }

    /// Drains everything on shutdown.
    pub fn drain(&self) {
        self.waiters.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}
