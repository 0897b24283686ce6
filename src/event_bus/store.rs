use super::types::{Event, EventStatus, ProcessingRecord, StoredEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conservator::{Executor, Migrator, PooledConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Event Store trait for persistence
///
/// Events arrive already PII-protected. The body is immutable once stored;
/// only `status` changes afterwards.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a new event with `status = pending`
    async fn store_event(&self, event: &Event) -> Result<()>;

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>>;

    async fn get_event_status(&self, event_id: &str) -> Result<Option<EventStatus>>;

    /// Events of one type, ascending by creation time, bounds inclusive
    async fn get_events(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>>;

    async fn is_event_processed(&self, event_id: &str, agent_id: &str) -> Result<bool>;

    /// Record that `agent_id` consumed `event_id` and mark the event completed.
    /// A second call for the same pair is a no-op.
    async fn mark_event_processed(&self, event_id: &str, agent_id: &str) -> Result<()>;

    /// Mark an event whose delivery exhausted its retries
    async fn mark_event_failed(&self, event_id: &str) -> Result<()>;

    async fn get_processing_history(&self, event_id: &str) -> Result<Vec<ProcessingRecord>>;

    /// Failed events, oldest first
    async fn get_failed_events(&self, limit: usize) -> Result<Vec<Event>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    events: HashMap<String, StoredEvent>,
    /// Insertion order of event ids
    order: Vec<String>,
    processing: HashMap<String, Vec<ProcessingRecord>>,
}

impl MemoryInner {
    fn ordered(&self) -> impl Iterator<Item = &StoredEvent> {
        self.order.iter().filter_map(|id| self.events.get(id))
    }
}

/// Process-local store, used when no database is configured and in tests
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn store_event(&self, event: &Event) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.events.contains_key(&event.event_id) {
            return Err(anyhow!("event {} already stored", event.event_id));
        }

        inner.events.insert(
            event.event_id.clone(),
            StoredEvent {
                event: event.clone(),
                status: EventStatus::Pending,
                created_at: Utc::now(),
            },
        );
        inner.order.push(event.event_id.clone());
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let inner = self.inner.read().await;
        Ok(inner.events.get(event_id).map(|stored| stored.event.clone()))
    }

    async fn get_event_status(&self, event_id: &str) -> Result<Option<EventStatus>> {
        let inner = self.inner.read().await;
        Ok(inner.events.get(event_id).map(|stored| stored.status))
    }

    async fn get_events(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&StoredEvent> = inner
            .ordered()
            .filter(|stored| stored.event.event_type == event_type)
            .filter(|stored| from.is_none_or(|from| stored.created_at >= from))
            .filter(|stored| to.is_none_or(|to| stored.created_at <= to))
            .collect();
        matching.sort_by_key(|stored| stored.created_at);

        Ok(matching.into_iter().map(|stored| stored.event.clone()).collect())
    }

    async fn is_event_processed(&self, event_id: &str, agent_id: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .processing
            .get(event_id)
            .is_some_and(|records| records.iter().any(|r| r.agent_id == agent_id)))
    }

    async fn mark_event_processed(&self, event_id: &str, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;

        let records = inner.processing.entry(event_id.to_string()).or_default();
        if records.iter().any(|r| r.agent_id == agent_id) {
            return Ok(());
        }
        records.push(ProcessingRecord {
            event_id: event_id.to_string(),
            agent_id: agent_id.to_string(),
            processed_at: Utc::now(),
        });

        if let Some(stored) = inner.events.get_mut(event_id) {
            stored.status = EventStatus::Completed;
        }
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.events.get_mut(event_id) {
            Some(stored) => {
                stored.status = EventStatus::Failed;
                Ok(())
            }
            None => Err(anyhow!("event {event_id} not found")),
        }
    }

    async fn get_processing_history(&self, event_id: &str) -> Result<Vec<ProcessingRecord>> {
        let inner = self.inner.read().await;
        let mut records = inner.processing.get(event_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| r.processed_at);
        Ok(records)
    }

    async fn get_failed_events(&self, limit: usize) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut failed: Vec<&StoredEvent> = inner
            .ordered()
            .filter(|stored| stored.status == EventStatus::Failed)
            .collect();
        failed.sort_by_key(|stored| stored.created_at);

        Ok(failed
            .into_iter()
            .take(limit)
            .map(|stored| stored.event.clone())
            .collect())
    }
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

/// PostgreSQL implementation of Event Store
pub struct PgEventStore {
    pool: Arc<PooledConnection>,
}

impl PgEventStore {
    pub fn new(pool: Arc<PooledConnection>) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str) -> Result<Self> {
        let pool = PooledConnection::from_url(database_url)?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Run the `events` / `event_processing` migrations
    pub async fn migrate(&self) -> Result<()> {
        let migrator = Migrator::from_path("./migrations")?;
        let mut conn = self.pool.get().await?;
        migrator.run(&mut conn).await?;

        tracing::info!("Event store migrations completed");
        Ok(())
    }
}

fn row_to_event(row: &tokio_postgres::Row) -> Result<Event> {
    let body: serde_json::Value = row.get("body");
    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn store_event(&self, event: &Event) -> Result<()> {
        let conn = self.pool.get().await?;
        let body = serde_json::to_value(event)?;

        conn.execute(
            r#"
            INSERT INTO events (event_id, event_type, body, source_agent, correlation_id, metadata, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            &[
                &event.event_id,
                &event.event_type,
                &body,
                &event.source_agent,
                &event.correlation_id,
                &event.metadata,
                &EventStatus::Pending.as_str(),
            ],
        )
        .await?;

        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query("SELECT body FROM events WHERE event_id = $1", &[&event_id])
            .await?;

        rows.first().map(row_to_event).transpose()
    }

    async fn get_event_status(&self, event_id: &str) -> Result<Option<EventStatus>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query("SELECT status FROM events WHERE event_id = $1", &[&event_id])
            .await?;

        rows.first()
            .map(|row| {
                let status: String = row.get("status");
                status
                    .parse::<EventStatus>()
                    .map_err(|_| anyhow!("unknown event status '{status}'"))
            })
            .transpose()
    }

    async fn get_events(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let conn = self.pool.get().await?;

        let rows = conn
            .query(
                r#"
                SELECT body
                FROM events
                WHERE event_type = $1
                  AND ($2::TIMESTAMPTZ IS NULL OR created_at >= $2)
                  AND ($3::TIMESTAMPTZ IS NULL OR created_at <= $3)
                ORDER BY created_at ASC
                "#,
                &[&event_type, &from, &to],
            )
            .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn is_event_processed(&self, event_id: &str, agent_id: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM event_processing WHERE event_id = $1 AND agent_id = $2
                ) AS processed
                "#,
                &[&event_id, &agent_id],
            )
            .await?;

        Ok(row.get("processed"))
    }

    async fn mark_event_processed(&self, event_id: &str, agent_id: &str) -> Result<()> {
        let conn = self.pool.get().await?;

        let inserted = conn
            .execute(
                r#"
                INSERT INTO event_processing (event_id, agent_id, processed_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (event_id, agent_id) DO NOTHING
                "#,
                &[&event_id, &agent_id],
            )
            .await?;

        if inserted > 0 {
            conn.execute(
                "UPDATE events SET status = $2 WHERE event_id = $1",
                &[&event_id, &EventStatus::Completed.as_str()],
            )
            .await?;
        }

        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE events SET status = $2 WHERE event_id = $1",
                &[&event_id, &EventStatus::Failed.as_str()],
            )
            .await?;

        if updated == 0 {
            return Err(anyhow!("event {event_id} not found"));
        }
        Ok(())
    }

    async fn get_processing_history(&self, event_id: &str) -> Result<Vec<ProcessingRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                r#"
                SELECT event_id, agent_id, processed_at
                FROM event_processing
                WHERE event_id = $1
                ORDER BY processed_at ASC
                "#,
                &[&event_id],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ProcessingRecord {
                event_id: row.get("event_id"),
                agent_id: row.get("agent_id"),
                processed_at: row.get("processed_at"),
            })
            .collect())
    }

    async fn get_failed_events(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.pool.get().await?;
        let limit_i64 = limit.min(10000) as i64;

        let rows = conn
            .query(
                r#"
                SELECT body
                FROM events
                WHERE status = $1
                ORDER BY created_at ASC
                LIMIT $2
                "#,
                &[&EventStatus::Failed.as_str(), &limit_i64],
            )
            .await?;

        rows.iter().map(row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_store_trait() {
        // Compile-time check that both stores implement EventStore
        fn _assert_impl<T: EventStore>() {}
        _assert_impl::<PgEventStore>();
        _assert_impl::<MemoryEventStore>();
    }

    fn event(id: &str, event_type: &str) -> Event {
        let mut event = Event::new(event_type, json!({"alert_id": id}));
        event.event_id = id.to_string();
        event.normalize();
        event
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let store = MemoryEventStore::new();
        let e = event("e-1", "report.requested");
        store.store_event(&e).await.unwrap();

        assert_eq!(store.get_event("e-1").await.unwrap(), Some(e));
        assert_eq!(
            store.get_event_status("e-1").await.unwrap(),
            Some(EventStatus::Pending)
        );
        assert!(store.get_event("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let store = MemoryEventStore::new();
        store.store_event(&event("e-1", "report.requested")).await.unwrap();
        assert!(store.store_event(&event("e-1", "report.requested")).await.is_err());
    }

    #[tokio::test]
    async fn test_get_events_filters_and_orders() {
        let store = MemoryEventStore::new();
        store.store_event(&event("a", "report.requested")).await.unwrap();
        store.store_event(&event("b", "report.generated")).await.unwrap();
        store.store_event(&event("c", "report.requested")).await.unwrap();

        let ids: Vec<_> = store
            .get_events("report.requested", None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(store
            .get_events("report.requested", Some(future), None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .get_events("report.requested", None, Some(future))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_mark_processed_is_idempotent() {
        let store = MemoryEventStore::new();
        store.store_event(&event("e-1", "report.requested")).await.unwrap();

        assert!(!store.is_event_processed("e-1", "agent-a").await.unwrap());
        store.mark_event_processed("e-1", "agent-a").await.unwrap();
        let first = store.get_processing_history("e-1").await.unwrap();
        store.mark_event_processed("e-1", "agent-a").await.unwrap();
        let second = store.get_processing_history("e-1").await.unwrap();

        assert!(store.is_event_processed("e-1", "agent-a").await.unwrap());
        assert!(!store.is_event_processed("e-1", "agent-b").await.unwrap());
        assert_eq!(first, second);
        assert_eq!(
            store.get_event_status("e-1").await.unwrap(),
            Some(EventStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_failed_events_oldest_first() {
        let store = MemoryEventStore::new();
        for id in ["a", "b", "c"] {
            store.store_event(&event(id, "report.requested")).await.unwrap();
        }
        store.mark_event_failed("c").await.unwrap();
        store.mark_event_failed("a").await.unwrap();

        let ids: Vec<_> = store
            .get_failed_events(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(store.get_failed_events(1).await.unwrap().len(), 1);
        assert!(store.mark_event_failed("missing").await.is_err());
    }
}
