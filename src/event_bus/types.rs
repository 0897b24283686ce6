use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::schema::SCHEMA_VERSION;

/// Core event structure carried by the bus
///
/// Missing identity fields (`event_id`, `version`, `timestamp`) deserialize as
/// empty strings and are filled in by [`Event::normalize`] at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique id (UUID v4 when generated)
    #[serde(default)]
    pub event_id: String,

    /// Event type, drawn from [`super::EventKind`]
    /// Examples: "fraud.alert_created", "transaction.scored"
    #[serde(default)]
    pub event_type: String,

    /// Schema version (semver)
    #[serde(default)]
    pub version: String,

    /// Timestamp (ISO 8601)
    #[serde(default)]
    pub timestamp: String,

    /// Agent that emitted this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,

    /// Links causally related events (alert -> report -> notification)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific data (JSON object)
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Event {
    /// Create a new event; identity fields are assigned on publish
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: String::new(),
            event_type: event_type.into(),
            version: String::new(),
            timestamp: String::new(),
            source_agent: None,
            correlation_id: None,
            payload,
            metadata: None,
        }
    }

    /// Create an event linked to an earlier one
    pub fn with_correlation(
        event_type: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut event = Self::new(event_type, payload);
        event.correlation_id = Some(correlation_id.into());
        event
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Fill in `event_id`, `timestamp` and `version` when absent
    pub fn normalize(&mut self) {
        if self.event_id.trim().is_empty() {
            self.event_id = Uuid::new_v4().to_string();
        }
        if self.timestamp.trim().is_empty() {
            self.timestamp = now_rfc3339();
        }
        if self.version.trim().is_empty() {
            self.version = SCHEMA_VERSION.to_string();
        }
    }

    /// Parsed timestamp, if it is valid ISO 8601
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts RFC 3339 as well as naive `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC)
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ============================================================================
// Persistence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            _ => Err(()),
        }
    }
}

/// An event as held by the store
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: Event,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

/// `(event_id, agent_id) -> processed_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub event_id: String,
    pub agent_id: String,
    pub processed_at: DateTime<Utc>,
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueItem {
    /// PII-protected form of the event
    pub event: Event,
    /// Monotonic enqueue counter
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Snapshot returned by `get_queue_stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    /// A drain cycle is currently running
    pub processing: bool,
    pub in_flight: usize,
    pub next_sequence: u64,
    pub published: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
    pub failed: u64,
}
