//! # Command Dispatch
//!
//! The two ways the controller talks to agents:
//!
//! - [`Dispatcher::send_command`] — fire-and-forget fan-out to every
//!   session registered for a node.
//! - [`Dispatcher::request_op`] — request/response with `requestId`
//!   correlation and a caller-supplied timeout. The waiter is registered
//!   before the frame is sent so a fast reply can never be lost.
//!
//! Neither path blocks on disk I/O or holds a registry lock across a
//! transport write; sends only enqueue onto session channels.

use std::sync::Arc;
use std::time::Duration;

use flux_protocol::{CommandKind, OutboundFrame};
use serde_json::Value;
use uuid::Uuid;

use crate::pending::PendingRequests;
use crate::registry::ControlRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no session for node {0}")]
    NoSession(i64),
    #[error("request payload carries no requestId")]
    MissingRequestId,
    #[error("request timed out")]
    Timeout,
    #[error("connection dropped")]
    ConnectionDropped,
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct Dispatcher {
    registry: Arc<ControlRegistry>,
    pending: Arc<PendingRequests>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ControlRegistry>, pending: Arc<PendingRequests>) -> Self {
        Self { registry, pending }
    }

    /// Enqueues `{type, data}` to every session of the node. Sessions
    /// whose queue is already closed are skipped; at least one live
    /// session must accept the frame.
    pub fn send_command(
        &self,
        node_id: i64,
        kind: CommandKind,
        data: Value,
    ) -> Result<(), DispatchError> {
        let sessions = self.registry.sessions_for(node_id);
        if sessions.is_empty() {
            return Err(DispatchError::NoSession(node_id));
        }
        let mut delivered = false;
        for session in &sessions {
            if session
                .tx
                .send(OutboundFrame::new(kind, data.clone()))
                .is_ok()
            {
                delivered = true;
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(DispatchError::NoSession(node_id))
        }
    }

    /// Sends a request frame and waits up to `timeout` for the reply
    /// whose `requestId` matches. `data` must already carry the
    /// client-generated id. Returns the full reply envelope as a JSON
    /// object (`type`, `requestId`, `data`).
    pub async fn request_op(
        &self,
        node_id: i64,
        kind: CommandKind,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let request_id = data
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(DispatchError::MissingRequestId)?;

        let rx = self.pending.register(&request_id, node_id);
        if let Err(e) = self.send_command(node_id, kind, data) {
            self.pending.forget(&request_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DispatchError::ConnectionDropped),
            Err(_) => {
                self.pending.forget(&request_id);
                Err(DispatchError::Timeout)
            }
        }
    }

    /// Retries an idempotent request a few times with 500 ms spacing.
    /// A fresh `requestId` is stamped on every attempt. Used for
    /// install/config style operations where duplicate application is
    /// harmless.
    pub async fn request_with_retry(
        &self,
        node_id: i64,
        kind: CommandKind,
        mut data: Value,
        timeout: Duration,
        retries: u32,
    ) -> Option<Value> {
        for attempt in 0..=retries {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("requestId".into(), Value::String(new_request_id()));
            }
            match self.request_op(node_id, kind, data.clone(), timeout).await {
                Ok(reply) => return Some(reply),
                Err(e) => {
                    tracing::debug!(node_id, %kind, attempt, error = %e, "request attempt failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentSession;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn harness() -> (Dispatcher, Arc<ControlRegistry>, Arc<PendingRequests>) {
        let registry = Arc::new(ControlRegistry::new());
        let pending = Arc::new(PendingRequests::new());
        (
            Dispatcher::new(registry.clone(), pending.clone()),
            registry,
            pending,
        )
    }

    #[tokio::test]
    async fn send_command_requires_a_session() {
        let (dispatcher, registry, _) = harness();
        let err = dispatcher
            .send_command(5, CommandKind::RestartGost, json!({}))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoSession(5)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(AgentSession::new(5, "1.0".into(), tx));
        dispatcher
            .send_command(5, CommandKind::RestartGost, json!({"reason": "test"}))
            .unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.kind, CommandKind::RestartGost);
    }

    #[tokio::test]
    async fn request_op_round_trip() {
        let (dispatcher, registry, pending) = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(AgentSession::new(5, "1.0".into(), tx));

        let pending2 = pending.clone();
        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let rid = frame.data["requestId"].as_str().unwrap().to_string();
            pending2.complete(&rid, json!({"requestId": rid, "data": {"success": true}}));
        });

        let reply = dispatcher
            .request_op(
                5,
                CommandKind::QueryServices,
                json!({"requestId": new_request_id(), "filter": ""}),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply["data"]["success"], true);
        responder.await.unwrap();
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn request_op_timeout_cleans_table() {
        let (dispatcher, registry, pending) = harness();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(AgentSession::new(5, "1.0".into(), tx));

        let err = dispatcher
            .request_op(
                5,
                CommandKind::Diagnose,
                json!({"requestId": "never-answered"}),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn request_op_rejects_missing_id() {
        let (dispatcher, _, _) = harness();
        let err = dispatcher
            .request_op(5, CommandKind::Diagnose, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingRequestId));
    }
}
