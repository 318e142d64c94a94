//! AgentManager (C4): the live-connection registry.

use crate::models::AgentStatusReport;
use crate::queue::dispatcher::AgentSender;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

/// Close code sent to a connection that's being superseded by a newer one
/// presenting auth for the same `agentId`.
pub const REPLACED_CLOSE_CODE: u16 = 4001;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Connected(String),
    Disconnected(String),
}

struct Connection {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    status: AgentStatusReport,
    active_tasks: HashSet<String>,
    connected_at: i64,
    last_heartbeat: i64,
}

pub struct AgentManager {
    connections: RwLock<HashMap<String, Connection>>,
    events: broadcast::Sender<AgentEvent>,
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Register a freshly authenticated connection, superseding any prior
    /// connection for the same `agentId` (closed with [`REPLACED_CLOSE_CODE`]).
    pub async fn register(&self, agent_id: &str, sender: mpsc::UnboundedSender<Vec<u8>>) {
        let now = crate::now_ms();
        let mut connections = self.connections.write().await;
        if let Some(prior) = connections.remove(agent_id) {
            info!(agent_id, "superseding existing connection");
            // Closing is a best-effort signal; a closed/dropped channel is fine too.
            let _ = prior.sender.send(Vec::new());
            drop(prior);
        }
        connections.insert(
            agent_id.to_string(),
            Connection {
                sender,
                status: AgentStatusReport::Online,
                active_tasks: HashSet::new(),
                connected_at: now,
                last_heartbeat: now,
            },
        );
        drop(connections);
        let _ = self.events.send(AgentEvent::Connected(agent_id.to_string()));
    }

    pub async fn unregister(&self, agent_id: &str) {
        let removed = self.connections.write().await.remove(agent_id).is_some();
        if removed {
            let _ = self
                .events
                .send(AgentEvent::Disconnected(agent_id.to_string()));
        }
    }

    pub async fn send(&self, agent_id: &str, bytes: Vec<u8>) -> bool {
        let connections = self.connections.read().await;
        match connections.get(agent_id) {
            Some(conn) => conn.sender.send(bytes).is_ok(),
            None => false,
        }
    }

    pub async fn update_heartbeat(&self, agent_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(agent_id) {
            conn.last_heartbeat = crate::now_ms();
        }
    }

    pub async fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatusReport,
        active_tasks: HashSet<String>,
    ) {
        if let Some(conn) = self.connections.write().await.get_mut(agent_id) {
            conn.status = status;
            conn.active_tasks = active_tasks;
        }
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.read().await.contains_key(agent_id)
    }

    /// Close and remove any agent whose heartbeat is older than `2 * interval_ms`.
    pub async fn sweep_dead(&self, interval_ms: i64) -> Vec<String> {
        let now = crate::now_ms();
        let threshold = now - 2 * interval_ms;
        let mut dead = Vec::new();
        {
            let mut connections = self.connections.write().await;
            connections.retain(|agent_id, conn| {
                if conn.last_heartbeat < threshold {
                    dead.push(agent_id.clone());
                    false
                } else {
                    true
                }
            });
        }
        for agent_id in &dead {
            warn!(agent_id, "swept dead agent connection");
            let _ = self
                .events
                .send(AgentEvent::Disconnected(agent_id.clone()));
        }
        dead
    }

    pub async fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, conn)| AgentSnapshot {
                agent_id: id.clone(),
                status: conn.status,
                active_tasks: conn.active_tasks.len(),
                connected_at: conn.connected_at,
                last_heartbeat: conn.last_heartbeat,
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub status: AgentStatusReport,
    pub active_tasks: usize,
    pub connected_at: i64,
    pub last_heartbeat: i64,
}

#[async_trait::async_trait]
impl AgentSender for AgentManager {
    async fn send(&self, agent_id: &str, bytes: Vec<u8>) -> bool {
        AgentManager::send(self, agent_id, bytes).await
    }
}

pub type SharedAgentManager = Arc<AgentManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_supersedes_prior_connection() {
        let manager = AgentManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.register("a1", tx1).await;
        manager.register("a1", tx2).await;
        // The prior sender receives a close signal (empty payload sentinel).
        assert!(rx1.recv().await.is_some());
        assert!(manager.is_connected("a1").await);
    }

    #[tokio::test]
    async fn send_to_unknown_agent_returns_false() {
        let manager = AgentManager::new();
        assert!(!manager.send("ghost", vec![1]).await);
    }

    #[tokio::test]
    async fn sweep_dead_closes_stale_connections() {
        let manager = AgentManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.register("a1", tx).await;
        // Force a stale heartbeat by sweeping with a huge interval relative to "now".
        let dead = manager.sweep_dead(i64::MAX / 4).await;
        assert_eq!(dead, vec!["a1".to_string()]);
        assert!(!manager.is_connected("a1").await);
        // send() now fails until a new register() occurs.
        assert!(!manager.send("a1", vec![1]).await);
    }

    #[tokio::test]
    async fn events_fire_on_connect_and_disconnect() {
        let manager = AgentManager::new();
        let mut rx = manager.subscribe();
        let (tx, _rx2) = mpsc::unbounded_channel();
        manager.register("a1", tx).await;
        manager.unregister("a1").await;
        assert!(matches!(rx.recv().await.unwrap(), AgentEvent::Connected(id) if id == "a1"));
        assert!(matches!(rx.recv().await.unwrap(), AgentEvent::Disconnected(id) if id == "a1"));
    }
}
