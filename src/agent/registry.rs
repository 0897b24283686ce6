use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct AgentPresence {
    pub agent_id: String,
    pub agent_type: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Presence registry (in-memory)
///
/// Agents register on start, refresh their heartbeat periodically and
/// unregister on stop.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    /// agent_id -> AgentPresence
    agents: Arc<RwLock<HashMap<String, AgentPresence>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent; re-registering replaces the previous entry
    pub async fn register(&self, agent_id: &str, agent_type: &str) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;

        if agents.contains_key(agent_id) {
            tracing::info!(agent_id = %agent_id, "agent re-registering, replacing old entry");
        }

        agents.insert(
            agent_id.to_string(),
            AgentPresence {
                agent_id: agent_id.to_string(),
                agent_type: agent_type.to_string(),
                registered_at: now,
                last_heartbeat: now,
            },
        );
        tracing::info!(agent_id = %agent_id, agent_type = %agent_type, "agent registered");
    }

    /// Refresh the heartbeat; false when the agent is not registered
    pub async fn heartbeat(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(presence) => {
                presence.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn unregister(&self, agent_id: &str) -> Option<AgentPresence> {
        let removed = self.agents.write().await.remove(agent_id);
        if removed.is_some() {
            tracing::info!(agent_id = %agent_id, "agent unregistered");
        }
        removed
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentPresence> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    pub async fn list(&self) -> Vec<AgentPresence> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Agents whose last heartbeat is older than `max_age`
    pub async fn stale_agents(&self, max_age: Duration) -> Vec<AgentPresence> {
        let cutoff = Utc::now() - max_age;
        self.list()
            .await
            .into_iter()
            .filter(|presence| presence.last_heartbeat < cutoff)
            .collect()
    }
}
