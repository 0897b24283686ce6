use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::AgentRegistry;
use crate::config::Settings;
use crate::error::AgentError;
use crate::event_bus::{
    AuditAction, AuditEntry, Event, EventBus, EventHandler, PublishReceipt, Subscription,
};

// ============================================================================
// Agent Stage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStage {
    #[default]
    Init,
    Listen,
    Analyze,
    Emit,
    Terminate,
}

impl AgentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStage::Init => "INIT",
            AgentStage::Listen => "LISTEN",
            AgentStage::Analyze => "ANALYZE",
            AgentStage::Emit => "EMIT",
            AgentStage::Terminate => "TERMINATE",
        }
    }
}

impl fmt::Display for AgentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Agent hooks
// ============================================================================

/// Agent-specific behaviour plugged into [`BaseAgent`]
#[async_trait]
pub trait AgentBehavior: Send + Sync + 'static {
    /// Register handlers via [`BaseAgent::subscribe`]
    async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()>;

    async fn on_start(&self, _agent: &BaseAgent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _agent: &BaseAgent) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Base Agent
// ============================================================================

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct AgentInner {
    id: String,
    agent_type: String,
    bus: EventBus,
    registry: AgentRegistry,
    behavior: Arc<dyn AgentBehavior>,
    stage: RwLock<AgentStage>,
    running: AtomicBool,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Lifecycle runtime shared by every agent
///
/// `INIT -> LISTEN -> ANALYZE -> EMIT -> LISTEN`, terminal `TERMINATE`.
/// Clones share state; handlers capture a clone to publish.
#[derive(Clone)]
pub struct BaseAgent {
    inner: Arc<AgentInner>,
}

impl BaseAgent {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        bus: EventBus,
        registry: AgentRegistry,
        behavior: Arc<dyn AgentBehavior>,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                id: id.into(),
                agent_type: agent_type.into(),
                bus,
                registry,
                behavior,
                stage: RwLock::new(AgentStage::Init),
                running: AtomicBool::new(false),
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Agent whose heartbeat period comes from `heartbeat_interval_secs`
    pub fn from_settings(
        settings: &Settings,
        id: impl Into<String>,
        agent_type: impl Into<String>,
        bus: EventBus,
        registry: AgentRegistry,
        behavior: Arc<dyn AgentBehavior>,
    ) -> Self {
        Self::new(id, agent_type, bus, registry, behavior)
            .with_heartbeat_interval(settings.heartbeat_interval())
    }

    /// Override the heartbeat period; only valid before the first clone is shared
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.heartbeat_interval = interval;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn agent_type(&self) -> &str {
        &self.inner.agent_type
    }

    pub fn is_active(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn current_stage(&self) -> AgentStage {
        *self.inner.stage.read().await
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    async fn transition(&self, to: AgentStage) {
        let mut stage = self.inner.stage.write().await;
        if *stage != to {
            debug!(agent_id = %self.inner.id, from = %*stage, to = %to, "stage transition");
            *stage = to;
        }
    }

    /// Stage change driven by event handling; never leaves `TERMINATE`
    async fn advance(&self, to: AgentStage) {
        let mut stage = self.inner.stage.write().await;
        if *stage != AgentStage::Terminate && *stage != to {
            debug!(agent_id = %self.inner.id, from = %*stage, to = %to, "stage transition");
            *stage = to;
        }
    }

    /// Register, subscribe, start the heartbeat and enter `LISTEN`
    pub async fn start(&self) -> Result<(), AgentError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning(self.inner.id.clone()));
        }

        self.transition(AgentStage::Init).await;
        self.inner
            .registry
            .register(&self.inner.id, &self.inner.agent_type)
            .await;

        if let Err(e) = self.inner.behavior.setup_subscriptions(self).await {
            error!(agent_id = %self.inner.id, error = %e, "subscription setup failed");
            self.teardown().await;
            return Err(AgentError::Hook(e));
        }

        self.start_heartbeat().await;

        if let Err(e) = self.inner.behavior.on_start(self).await {
            error!(agent_id = %self.inner.id, error = %e, "on_start hook failed");
            self.teardown().await;
            return Err(AgentError::Hook(e));
        }

        self.transition(AgentStage::Listen).await;
        self.inner
            .bus
            .audit()
            .record(
                AuditEntry::new(AuditAction::AgentStarted)
                    .agent(&self.inner.id)
                    .details(json!({ "agent_type": self.inner.agent_type })),
            )
            .await;

        info!(agent_id = %self.inner.id, agent_type = %self.inner.agent_type, "agent started");
        Ok(())
    }

    /// Stop future dispatch to this agent; a no-op when not running
    pub async fn stop(&self) -> Result<(), AgentError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.transition(AgentStage::Terminate).await;
        self.teardown().await;

        let hook = self.inner.behavior.on_stop(self).await;
        if let Err(e) = &hook {
            warn!(agent_id = %self.inner.id, error = %e, "on_stop hook failed");
        }

        self.inner
            .bus
            .audit()
            .record(AuditEntry::new(AuditAction::AgentStopped).agent(&self.inner.id))
            .await;

        info!(agent_id = %self.inner.id, "agent stopped");
        hook.map_err(AgentError::Hook)
    }

    async fn teardown(&self) {
        if let Some(handle) = self.inner.heartbeat.lock().await.take() {
            handle.abort();
        }
        self.inner.registry.unregister(&self.inner.id).await;
        self.inner.bus.unsubscribe(&self.inner.id, None).await;
        self.transition(AgentStage::Terminate).await;
        self.inner.running.store(false, Ordering::SeqCst);
    }

    async fn start_heartbeat(&self) {
        let registry = self.inner.registry.clone();
        let agent_id = self.inner.id.clone();
        let period = self.inner.heartbeat_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately; registration already set the heartbeat
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !registry.heartbeat(&agent_id).await {
                    warn!(agent_id = %agent_id, "heartbeat for unregistered agent");
                }
            }
        });

        *self.inner.heartbeat.lock().await = Some(handle);
    }

    /// Subscribe `handler` to one or more event types
    ///
    /// Around every invocation the stage moves to `ANALYZE`, then (on
    /// success) through `EMIT` back to `LISTEN`. Errors are logged and
    /// returned to the orchestrator so it can retry.
    pub async fn subscribe<I, S>(&self, event_types: I, priority: i32, handler: EventHandler)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent = self.clone();
        let wrapped: EventHandler = Arc::new(move |event: Event| {
            let agent = agent.clone();
            let handler = handler.clone();
            async move {
                agent.advance(AgentStage::Analyze).await;
                let event_id = event.event_id.clone();
                let event_type = event.event_type.clone();

                let outcome = match AssertUnwindSafe(handler(event)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("handler panicked")),
                };

                match outcome {
                    Ok(()) => {
                        agent.advance(AgentStage::Emit).await;
                        agent.advance(AgentStage::Listen).await;
                        Ok(())
                    }
                    Err(e) => {
                        agent.advance(AgentStage::Listen).await;
                        error!(
                            agent_id = %agent.inner.id,
                            event_id = %event_id,
                            event_type = %event_type,
                            error = %e,
                            "handler failed"
                        );
                        Err(e)
                    }
                }
            }
            .boxed()
        });

        self.inner
            .bus
            .subscribe(Subscription::new(event_types, self.inner.id.clone(), wrapped).priority(priority))
            .await;
    }

    /// Publish as this agent
    ///
    /// Stamps `source_agent` and fills missing identity fields. Publishing
    /// from inside a handler moves the stage from `ANALYZE` to `EMIT`.
    pub async fn publish(&self, mut event: Event) -> Result<PublishReceipt, AgentError> {
        event.source_agent = Some(self.inner.id.clone());
        event.normalize();

        {
            let mut stage = self.inner.stage.write().await;
            if *stage == AgentStage::Analyze {
                *stage = AgentStage::Emit;
            }
        }

        self.inner
            .bus
            .audit()
            .record(
                AuditEntry::new(AuditAction::EventEmitted)
                    .event(&event.event_id, &event.event_type)
                    .agent(&self.inner.id)
                    .details(json!({ "correlation_id": event.correlation_id })),
            )
            .await;

        Ok(self.inner.bus.publish(event).await?)
    }
}

impl fmt::Debug for BaseAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseAgent")
            .field("id", &self.inner.id)
            .field("agent_type", &self.inner.agent_type)
            .field("running", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{
        handler_fn, AuditLog, EventKind, EventOrchestrator, MemoryEventStore, OrchestratorConfig,
        PiiCipher, PiiProtector,
    };
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(EventOrchestrator::new(
            OrchestratorConfig {
                base_retry_delay: Duration::from_millis(1),
                ..OrchestratorConfig::default()
            },
            Arc::new(MemoryEventStore::new()),
            PiiProtector::new(PiiCipher::from_secret("agent-test").unwrap()),
            Arc::new(AuditLog::new(100)),
        )))
    }

    /// Records the stage seen inside the handler and re-publishes an alert
    struct Escalator {
        stages: Arc<Mutex<Vec<AgentStage>>>,
    }

    #[async_trait]
    impl AgentBehavior for Escalator {
        async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()> {
            let stages = self.stages.clone();
            let me = agent.clone();
            agent
                .subscribe(
                    [EventKind::TRANSACTION_SCORED],
                    10,
                    handler_fn(move |event: Event| {
                        let stages = stages.clone();
                        let me = me.clone();
                        async move {
                            stages.lock().await.push(me.current_stage().await);
                            me.publish(Event::with_correlation(
                                EventKind::FRAUD_ALERT_CREATED,
                                event.event_id.clone(),
                                json!({"user_id": event.payload["user_id"], "severity": "high"}),
                            ))
                            .await?;
                            stages.lock().await.push(me.current_stage().await);
                            Ok(())
                        }
                    }),
                )
                .await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl AgentBehavior for Broken {
        async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()> {
            agent
                .subscribe(
                    [EventKind::AGENT_HEARTBEAT],
                    0,
                    handler_fn(|_event: Event| async move { Err(anyhow::anyhow!("always fails")) }),
                )
                .await;
            Ok(())
        }
    }

    /// Stops itself from inside its own handler
    struct SelfStopping;

    #[async_trait]
    impl AgentBehavior for SelfStopping {
        async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()> {
            let me = agent.clone();
            agent
                .subscribe(
                    [EventKind::SYSTEM_HEALTH_CHECK],
                    0,
                    handler_fn(move |_event: Event| {
                        let me = me.clone();
                        async move {
                            me.stop().await?;
                            Ok(())
                        }
                    }),
                )
                .await;
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl AgentBehavior for Panicking {
        async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()> {
            agent
                .subscribe(
                    [EventKind::AGENT_ERROR],
                    0,
                    handler_fn(|_event: Event| async move {
                        if true {
                            panic!("scoring model missing");
                        }
                        Ok(())
                    }),
                )
                .await;
            Ok(())
        }
    }

    struct FailsSetup;

    #[async_trait]
    impl AgentBehavior for FailsSetup {
        async fn setup_subscriptions(&self, _agent: &BaseAgent) -> anyhow::Result<()> {
            anyhow::bail!("missing dependency")
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let bus = bus();
        let registry = AgentRegistry::new();
        let stages = Arc::new(Mutex::new(Vec::new()));
        let agent = BaseAgent::new(
            "fraud-1",
            "fraud_detection",
            bus.clone(),
            registry.clone(),
            Arc::new(Escalator { stages: stages.clone() }),
        );

        assert!(!agent.is_active());
        agent.start().await.unwrap();
        assert!(agent.is_active());
        assert_eq!(agent.current_stage().await, AgentStage::Listen);
        assert!(registry.is_registered("fraud-1").await);
        assert_eq!(bus.get_subscription_count(EventKind::TRANSACTION_SCORED).await, 1);

        assert!(matches!(agent.start().await, Err(AgentError::AlreadyRunning(_))));

        agent.stop().await.unwrap();
        assert!(!agent.is_active());
        assert_eq!(agent.current_stage().await, AgentStage::Terminate);
        assert!(!registry.is_registered("fraud-1").await);
        assert_eq!(bus.get_subscription_count(EventKind::TRANSACTION_SCORED).await, 0);

        // Second stop is a no-op
        agent.stop().await.unwrap();

        let started = bus.audit().entries_for(AuditAction::AgentStarted).await;
        let stopped = bus.audit().entries_for(AuditAction::AgentStopped).await;
        assert_eq!(started.len(), 1);
        assert_eq!(stopped.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_stages_and_publish() {
        let bus = bus();
        let stages = Arc::new(Mutex::new(Vec::new()));
        let agent = BaseAgent::new(
            "fraud-1",
            "fraud_detection",
            bus.clone(),
            AgentRegistry::new(),
            Arc::new(Escalator { stages: stages.clone() }),
        );
        agent.start().await.unwrap();

        let receipt = bus
            .publish(Event::new(
                EventKind::TRANSACTION_SCORED,
                json!({"transaction_id": "t-1", "user_id": "u-1", "risk_score": 91}),
            ))
            .await
            .unwrap();
        bus.process_queue().await;

        assert_eq!(*stages.lock().await, vec![AgentStage::Analyze, AgentStage::Emit]);
        assert_eq!(agent.current_stage().await, AgentStage::Listen);

        let emitted = bus.audit().entries_for(AuditAction::EventEmitted).await;
        assert_eq!(emitted.len(), 1);
        let alert = bus
            .get_event(emitted[0].event_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.source_agent.as_deref(), Some("fraud-1"));
        assert_eq!(alert.correlation_id.as_deref(), Some(receipt.event_id.as_str()));

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_reaches_orchestrator() {
        let bus = bus();
        let agent = BaseAgent::new("broken", "router", bus.clone(), AgentRegistry::new(), Arc::new(Broken));
        agent.start().await.unwrap();

        bus.publish(Event::new(EventKind::AGENT_HEARTBEAT, json!({})))
            .await
            .unwrap();
        bus.process_queue().await;

        let stats = bus.get_queue_stats().await;
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(agent.current_stage().await, AgentStage::Listen);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_setup_rolls_back() {
        let registry = AgentRegistry::new();
        let agent = BaseAgent::new("x", "report", bus(), registry.clone(), Arc::new(FailsSetup));

        assert!(matches!(agent.start().await, Err(AgentError::Hook(_))));
        assert!(!agent.is_active());
        assert!(!registry.is_registered("x").await);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_registry() {
        let registry = AgentRegistry::new();
        let agent = BaseAgent::new("hb", "supervisor", bus(), registry.clone(), Arc::new(FailsSetup))
            .with_heartbeat_interval(Duration::from_millis(10));
        assert_eq!(agent.inner.heartbeat_interval, Duration::from_millis(10));

        registry.register("hb", "supervisor").await;
        let first = registry.get("hb").await.unwrap().last_heartbeat;
        agent.start_heartbeat().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = registry.get("hb").await.unwrap().last_heartbeat;
        assert!(later > first);

        agent.teardown().await;
        assert!(agent.inner.heartbeat.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_inside_handler_stays_terminated() {
        let bus = bus();
        let agent = BaseAgent::new("monitor", "supervisor", bus.clone(), AgentRegistry::new(), Arc::new(SelfStopping));
        agent.start().await.unwrap();

        bus.publish(Event::new(EventKind::SYSTEM_HEALTH_CHECK, json!({})))
            .await
            .unwrap();
        bus.process_queue().await;

        assert!(!agent.is_active());
        assert_eq!(agent.current_stage().await, AgentStage::Terminate);
        assert_eq!(bus.get_queue_stats().await.delivered, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_returns_to_listen() {
        let bus = bus();
        let agent = BaseAgent::new("panicky", "report", bus.clone(), AgentRegistry::new(), Arc::new(Panicking));
        agent.start().await.unwrap();

        bus.publish(Event::new(
            EventKind::AGENT_ERROR,
            json!({"agent_id": "other", "error": "timeout"}),
        ))
        .await
        .unwrap();
        bus.process_queue().await;

        assert_eq!(agent.current_stage().await, AgentStage::Listen);
        let stats = bus.get_queue_stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_interval_from_settings() {
        let settings = Settings {
            encryption_key: "k".to_string(),
            heartbeat_interval_secs: 7,
            ..Settings::default()
        };
        let agent = BaseAgent::from_settings(
            &settings,
            "hb",
            "supervisor",
            bus(),
            AgentRegistry::new(),
            Arc::new(FailsSetup),
        );
        assert_eq!(agent.inner.heartbeat_interval, Duration::from_secs(7));

        let default = BaseAgent::new("d", "supervisor", bus(), AgentRegistry::new(), Arc::new(FailsSetup));
        assert_eq!(default.inner.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }
}
