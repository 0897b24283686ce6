use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    EventPublished,
    EventRejected,
    EventDropped,
    EventDelivered,
    EventReplayed,
    EventEmitted,
    DeliveryRetry,
    DeliveryFailed,
    AgentStarted,
    AgentStopped,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::EventPublished => "EVENT_PUBLISHED",
            AuditAction::EventRejected => "EVENT_REJECTED",
            AuditAction::EventDropped => "EVENT_DROPPED",
            AuditAction::EventDelivered => "EVENT_DELIVERED",
            AuditAction::EventReplayed => "EVENT_REPLAYED",
            AuditAction::EventEmitted => "EVENT_EMITTED",
            AuditAction::DeliveryRetry => "DELIVERY_RETRY",
            AuditAction::DeliveryFailed => "DELIVERY_FAILED",
            AuditAction::AgentStarted => "AGENT_STARTED",
            AuditAction::AgentStopped => "AGENT_STOPPED",
        }
    }

    fn is_problem(&self) -> bool {
        matches!(
            self,
            AuditAction::EventRejected | AuditAction::EventDropped | AuditAction::DeliveryFailed
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub details: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            event_id: None,
            event_type: None,
            agent_id: None,
            details: Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn event(mut self, event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self.event_type = Some(event_type.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Audit trail of bus activity
///
/// Entries go to the `audit` tracing target and into a bounded in-memory
/// buffer (oldest entries are evicted first). Callers must only pass
/// redacted event data.
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let details = entry.details.to_string();
        if entry.action.is_problem() {
            warn!(
                target: "audit",
                action = %entry.action,
                event_id = entry.event_id.as_deref().unwrap_or("-"),
                event_type = entry.event_type.as_deref().unwrap_or("-"),
                agent_id = entry.agent_id.as_deref().unwrap_or("-"),
                details = %details,
                "audit"
            );
        } else {
            info!(
                target: "audit",
                action = %entry.action,
                event_id = entry.event_id.as_deref().unwrap_or("-"),
                event_type = entry.event_type.as_deref().unwrap_or("-"),
                agent_id = entry.agent_id.as_deref().unwrap_or("-"),
                details = %details,
                "audit"
            );
        }

        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn entries_for(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
