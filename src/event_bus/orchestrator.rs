use super::audit::{AuditAction, AuditEntry, AuditLog};
use super::pii::PiiProtector;
use super::store::EventStore;
use super::types::{Event, QueueItem, QueueStats};
use super::validator::EventValidator;
use crate::error::BusError;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Async event handler; an `Err` (or a panic) counts as a failed delivery
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// A handler registered by an agent for one or more event types
#[derive(Clone)]
pub struct Subscription {
    pub event_types: Vec<String>,
    pub agent_id: String,
    pub priority: i32,
    pub handler: EventHandler,
}

impl Subscription {
    pub fn new<I, S>(event_types: I, agent_id: impl Into<String>, handler: EventHandler) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
            agent_id: agent_id.into(),
            priority: 0,
            handler,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_types", &self.event_types)
            .field("agent_id", &self.agent_id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub event_type: String,
    pub agent_id: String,
    pub priority: i32,
}

#[derive(Clone)]
struct Registration {
    agent_id: String,
    priority: i32,
    handler: EventHandler,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_queue_size: usize,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Linear backoff unit: the n-th retry waits `base_retry_delay * n`
    pub base_retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_retries: 3,
            base_retry_delay: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: String,
    /// `None` when the queue was full and the event was only persisted
    pub sequence: Option<u64>,
}

impl PublishReceipt {
    pub fn queued(&self) -> bool {
        self.sequence.is_some()
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Event Orchestrator
///
/// Owns the subscription registry, the ordered delivery queue and the
/// retry state machine. Events are validated, PII-protected and persisted on
/// publish, then delivered by a background loop to every matching
/// subscriber in priority order.
///
/// Handlers run one at a time. A failed delivery is re-appended to the tail
/// of the queue and the loop sleeps for the backoff before continuing, so a
/// failing handler delays every other queued event.
pub struct EventOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn EventStore>,
    validator: EventValidator,
    pii: PiiProtector,
    audit: Arc<AuditLog>,
    subscriptions: RwLock<HashMap<String, Vec<Registration>>>,
    queue: Mutex<VecDeque<QueueItem>>,
    next_sequence: AtomicU64,
    /// `event_id:agent_id` keys currently being handled
    in_flight: Mutex<HashSet<String>>,
    processing: AtomicBool,
    counters: Counters,
    active: Arc<RwLock<bool>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn EventStore>,
        pii: PiiProtector,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            store,
            validator: EventValidator::new(),
            pii,
            audit,
            subscriptions: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(1),
            in_flight: Mutex::new(HashSet::new()),
            processing: AtomicBool::new(false),
            counters: Counters::default(),
            active: Arc::new(RwLock::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    // ========================================================================
    // Delivery loop
    // ========================================================================

    /// Start the delivery loop (spawns background task)
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            warn!("Event orchestrator already running");
            return;
        }

        *self.active.write().await = true;

        let orchestrator = Arc::clone(self);
        let active = self.active.clone();

        *worker = Some(tokio::spawn(async move {
            info!(
                poll_interval_ms = orchestrator.config.poll_interval.as_millis() as u64,
                "Event orchestrator started"
            );

            // interval() panics on a zero period
            let period = orchestrator.config.poll_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while *active.read().await {
                ticker.tick().await;
                if !*active.read().await {
                    break;
                }
                orchestrator.process_queue().await;
            }

            info!("Event orchestrator stopped");
        }));
    }

    /// Stop the delivery loop, waiting for the current drain cycle to finish
    pub async fn stop(&self) {
        *self.active.write().await = false;

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Event orchestrator task ended abnormally: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.active.read().await
    }

    /// Run one drain cycle: deliver queued items strictly FIFO until the
    /// queue is empty. A no-op when another cycle is already running.
    pub async fn process_queue(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        loop {
            let item = self.queue.lock().await.pop_front();
            let Some(item) = item else {
                break;
            };
            self.deliver(item).await;
        }

        self.processing.store(false, Ordering::Release);
    }

    async fn deliver(&self, item: QueueItem) {
        let event_id = item.event.event_id.clone();
        let event_type = item.event.event_type.clone();

        let registrations = self
            .subscriptions
            .read()
            .await
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        if registrations.is_empty() {
            debug!(event_id = %event_id, event_type = %event_type, "no subscribers");
            return;
        }

        let mut revealed: Option<Event> = None;
        let mut failures: Vec<(String, String)> = Vec::new();

        for registration in registrations {
            let agent_id = registration.agent_id;
            let key = format!("{}:{}", event_id, agent_id);

            if !self.in_flight.lock().await.insert(key.clone()) {
                debug!(event_id = %event_id, agent_id = %agent_id, "delivery already in flight, skipping");
                continue;
            }

            match self.store.is_event_processed(&event_id, &agent_id).await {
                Ok(true) => {
                    self.in_flight.lock().await.remove(&key);
                    debug!(event_id = %event_id, agent_id = %agent_id, "already processed, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        event_id = %event_id,
                        agent_id = %agent_id,
                        error = %e,
                        "idempotency check failed, delivering anyway"
                    );
                }
            }

            let event = revealed
                .get_or_insert_with(|| self.pii.reveal(&item.event))
                .clone();

            let outcome = AssertUnwindSafe((registration.handler)(event))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    if let Err(e) = self.store.mark_event_processed(&event_id, &agent_id).await {
                        error!(
                            event_id = %event_id,
                            agent_id = %agent_id,
                            error = %e,
                            "failed to record processing"
                        );
                    }
                    self.in_flight.lock().await.remove(&key);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);

                    self.audit
                        .record(
                            AuditEntry::new(AuditAction::EventDelivered)
                                .event(&event_id, &event_type)
                                .agent(&agent_id)
                                .details(json!({
                                    "sequence": item.sequence,
                                    "retry_count": item.retry_count,
                                })),
                        )
                        .await;
                }
                Ok(Err(e)) => {
                    self.in_flight.lock().await.remove(&key);
                    warn!(
                        event_id = %event_id,
                        agent_id = %agent_id,
                        retry_count = item.retry_count,
                        error = %e,
                        "handler failed"
                    );
                    failures.push((agent_id, e.to_string()));
                }
                Err(_) => {
                    self.in_flight.lock().await.remove(&key);
                    error!(event_id = %event_id, agent_id = %agent_id, "handler panicked");
                    failures.push((agent_id, "handler panicked".to_string()));
                }
            }
        }

        if failures.is_empty() {
            return;
        }

        let failures: Vec<_> = failures
            .into_iter()
            .map(|(agent_id, error)| json!({"agent_id": agent_id, "error": error}))
            .collect();

        if item.retry_count < self.config.max_retries {
            let retry_count = item.retry_count + 1;
            let delay = self.config.base_retry_delay * retry_count;

            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            self.audit
                .record(
                    AuditEntry::new(AuditAction::DeliveryRetry)
                        .event(&event_id, &event_type)
                        .details(json!({
                            "retry_count": retry_count,
                            "delay_ms": delay.as_millis() as u64,
                            "failures": failures,
                        })),
                )
                .await;

            // Retried items already held a queue slot, so capacity is not rechecked
            self.queue.lock().await.push_back(QueueItem {
                retry_count,
                ..item
            });

            tokio::time::sleep(delay).await;
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                event_id = %event_id,
                event_type = %event_type,
                attempts = item.retry_count + 1,
                "delivery permanently failed"
            );

            if let Err(e) = self.store.mark_event_failed(&event_id).await {
                error!(event_id = %event_id, error = %e, "failed to mark event failed");
            }

            self.audit
                .record(
                    AuditEntry::new(AuditAction::DeliveryFailed)
                        .event(&event_id, &event_type)
                        .details(json!({
                            "attempts": item.retry_count + 1,
                            "failures": failures,
                        })),
                )
                .await;
        }
    }

    // ========================================================================
    // Publish / replay
    // ========================================================================

    /// Validate, protect, persist and enqueue an event
    ///
    /// Only validation, PII and storage errors are returned. A full queue is
    /// not an error: the event stays persisted and the receipt carries no
    /// sequence.
    pub async fn publish(&self, mut event: Event) -> Result<PublishReceipt, BusError> {
        event.normalize();

        let validation = self.validator.validate(&event);
        for warning in &validation.warnings {
            warn!(
                event_id = %event.event_id,
                field = %warning.field,
                "{}",
                warning.message
            );
        }

        if !validation.valid {
            self.audit
                .record(
                    AuditEntry::new(AuditAction::EventRejected)
                        .event(&event.event_id, &event.event_type)
                        .details(json!({ "errors": validation.errors })),
                )
                .await;
            return Err(BusError::Validation(validation.errors));
        }

        let protected = self.pii.protect(&event)?;
        self.store
            .store_event(&protected)
            .await
            .map_err(BusError::Store)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        self.audit
            .record(
                AuditEntry::new(AuditAction::EventPublished)
                    .event(&protected.event_id, &protected.event_type)
                    .details(json!({ "event": self.pii.redact(&protected) })),
            )
            .await;

        let event_id = protected.event_id.clone();
        let sequence = self.enqueue(protected).await;

        Ok(PublishReceipt { event_id, sequence })
    }

    async fn enqueue(&self, event: Event) -> Option<u64> {
        let mut queue = self.queue.lock().await;

        if queue.len() >= self.config.max_queue_size {
            drop(queue);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.event_id,
                max_queue_size = self.config.max_queue_size,
                "queue full, event dropped from delivery"
            );
            self.audit
                .record(
                    AuditEntry::new(AuditAction::EventDropped)
                        .event(&event.event_id, &event.event_type)
                        .details(json!({
                            "reason": "queue_full",
                            "max_queue_size": self.config.max_queue_size,
                        })),
                )
                .await;
            return None;
        }

        // Assigned under the queue lock so queue order matches sequence order
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        debug!(event_id = %event.event_id, sequence, "event enqueued");
        queue.push_back(QueueItem {
            event,
            sequence,
            enqueued_at: Utc::now(),
            retry_count: 0,
        });

        Some(sequence)
    }

    /// Re-enqueue stored events of one type; returns how many were queued
    ///
    /// Agents that already processed an event skip it on delivery.
    pub async fn replay(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, BusError> {
        let events = self
            .store
            .get_events(event_type, from, to)
            .await
            .map_err(BusError::Store)?;

        let found = events.len();
        let mut queued = 0;
        let mut skipped = 0;

        for mut event in events {
            if !self.validator.is_replay_safe(&self.pii.reveal(&event)) {
                warn!(event_id = %event.event_id, "event is not replay safe, skipping");
                skipped += 1;
                continue;
            }

            // Stored form is already protected; decryption happens at dispatch
            event.normalize();
            if self.enqueue(event).await.is_some() {
                queued += 1;
            }
        }

        info!(event_type, found, queued, skipped, "replay enqueued");
        self.audit
            .record(AuditEntry::new(AuditAction::EventReplayed).details(json!({
                "event_type": event_type,
                "from": from,
                "to": to,
                "found": found,
                "queued": queued,
                "skipped": skipped,
            })))
            .await;

        Ok(queued)
    }

    /// Re-enqueue permanently failed events with a fresh retry budget
    pub async fn redrive_failed(&self, limit: usize) -> Result<usize, BusError> {
        let events = self
            .store
            .get_failed_events(limit)
            .await
            .map_err(BusError::Store)?;

        let mut queued = 0;
        for event in events {
            if self.enqueue(event).await.is_some() {
                queued += 1;
            }
        }

        info!(queued, "failed events re-driven");
        Ok(queued)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>, BusError> {
        self.store.get_event(event_id).await.map_err(BusError::Store)
    }

    pub async fn get_failed_events(&self, limit: usize) -> Result<Vec<Event>, BusError> {
        self.store
            .get_failed_events(limit)
            .await
            .map_err(BusError::Store)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn subscribe(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.write().await;

        for event_type in &subscription.event_types {
            let handlers = subscriptions.entry(event_type.clone()).or_default();
            handlers.push(Registration {
                agent_id: subscription.agent_id.clone(),
                priority: subscription.priority,
                handler: subscription.handler.clone(),
            });
            // Stable: equal priorities keep registration order
            handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        info!(
            agent_id = %subscription.agent_id,
            event_types = ?subscription.event_types,
            priority = subscription.priority,
            "subscription registered"
        );
    }

    /// Remove an agent's handlers, for one type or all; returns how many were removed
    pub async fn unsubscribe(&self, agent_id: &str, event_type: Option<&str>) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let mut removed = 0;

        subscriptions.retain(|registered_type, handlers| {
            if event_type.is_none_or(|t| t == registered_type.as_str()) {
                let before = handlers.len();
                handlers.retain(|r| r.agent_id != agent_id);
                removed += before - handlers.len();
            }
            !handlers.is_empty()
        });

        if removed > 0 {
            info!(agent_id, event_type = ?event_type, removed, "subscriptions removed");
        }
        removed
    }

    pub async fn get_subscription_count(&self, event_type: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// All registrations, grouped by type in dispatch order
    pub async fn get_all_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let subscriptions = self.subscriptions.read().await;
        let mut types: Vec<&String> = subscriptions.keys().collect();
        types.sort();

        types
            .into_iter()
            .flat_map(|event_type| {
                subscriptions[event_type].iter().map(move |r| SubscriptionInfo {
                    event_type: event_type.clone(),
                    agent_id: r.agent_id.clone(),
                    priority: r.priority,
                })
            })
            .collect()
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        QueueStats {
            size: self.queue.lock().await.len(),
            max_size: self.config.max_queue_size,
            processing: self.processing.load(Ordering::Acquire),
            in_flight: self.in_flight.lock().await.len(),
            next_sequence: self.next_sequence.load(Ordering::SeqCst),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
