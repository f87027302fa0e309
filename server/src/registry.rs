//! # Control Registry
//!
//! Tracks every live agent session per node. A node may be served by
//! several agent hosts at once, so the registry keeps a list of sessions
//! under each node id; broadcast operations hit all of them.
//!
//! Uses [`DashMap`] for lock-free concurrent access — sessions register
//! and drop from many tasks at once, and no lock is ever held while
//! writing to the transport (sends only enqueue onto a session's
//! unbounded channel).

use dashmap::DashMap;
use flux_protocol::OutboundFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half of a session's outbound queue. The session's writer task
/// drains this onto the WebSocket with a per-write deadline.
pub type SessionTx = mpsc::UnboundedSender<OutboundFrame>;

/// One live control channel to one agent process.
#[derive(Debug)]
pub struct AgentSession {
    /// Internal id for unregistration; not visible on the wire.
    pub id: String,
    pub node_id: i64,
    /// Agent-reported version string from the connect query.
    pub version: String,
    pub tx: SessionTx,
}

impl AgentSession {
    pub fn new(node_id: i64, version: String, tx: SessionTx) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            node_id,
            version,
            tx,
        })
    }
}

#[derive(Default)]
pub struct ControlRegistry {
    sessions: DashMap<i64, Vec<Arc<AgentSession>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<AgentSession>) {
        self.sessions
            .entry(session.node_id)
            .or_default()
            .push(session);
    }

    /// Removes the session. Returns true when it was the node's last
    /// session — the caller marks the node disconnected and fails its
    /// pending requests.
    pub fn unregister(&self, session: &AgentSession) -> bool {
        let mut last = false;
        if let Some(mut entry) = self.sessions.get_mut(&session.node_id) {
            entry.retain(|s| s.id != session.id);
            last = entry.is_empty();
        }
        if last {
            self.sessions.remove(&session.node_id);
        }
        last
    }

    /// Snapshot of the node's sessions; safe to iterate without holding
    /// any registry lock.
    pub fn sessions_for(&self, node_id: i64) -> Vec<Arc<AgentSession>> {
        self.sessions
            .get(&node_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn has_session(&self, node_id: i64) -> bool {
        self.sessions
            .get(&node_id)
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    }

    /// (node id, versions) for every connected node.
    pub fn connected(&self) -> Vec<(i64, Vec<String>)> {
        self.sessions
            .iter()
            .map(|e| (*e.key(), e.value().iter().map(|s| s.version.clone()).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_protocol::CommandKind;
    use serde_json::json;

    #[test]
    fn last_unregister_clears_node() {
        let registry = ControlRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let a = AgentSession::new(7, "1.0".into(), tx1);
        let b = AgentSession::new(7, "1.1".into(), tx2);
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.sessions_for(7).len(), 2);
        assert!(!registry.unregister(&a));
        assert!(registry.has_session(7));
        assert!(registry.unregister(&b));
        assert!(!registry.has_session(7));
    }

    #[test]
    fn snapshot_reaches_all_sessions() {
        let registry = ControlRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register(AgentSession::new(3, "1.0".into(), tx1));
        registry.register(AgentSession::new(3, "1.0".into(), tx2));

        for session in registry.sessions_for(3) {
            let _ = session
                .tx
                .send(OutboundFrame::new(CommandKind::RestartGost, json!({})));
        }
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
