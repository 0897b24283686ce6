use super::audit::AuditLog;
use super::orchestrator::{
    EventOrchestrator, OrchestratorConfig, PublishReceipt, Subscription, SubscriptionInfo,
};
use super::pii::{PiiCipher, PiiProtector};
use super::store::EventStore;
use super::types::{Event, QueueStats};
use crate::config::Settings;
use crate::error::BusError;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Event Bus
///
/// Thin façade agents publish and subscribe through. Cloning is cheap; all
/// clones share one orchestrator.
#[derive(Clone)]
pub struct EventBus {
    orchestrator: Arc<EventOrchestrator>,
}

impl EventBus {
    pub fn new(orchestrator: Arc<EventOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build a bus from settings on top of `store`
    pub fn from_settings(settings: &Settings, store: Arc<dyn EventStore>) -> Result<Self, BusError> {
        let cipher = PiiCipher::from_secret(&settings.encryption_key)?;
        let orchestrator = EventOrchestrator::new(
            OrchestratorConfig::from(settings),
            store,
            PiiProtector::new(cipher),
            Arc::new(AuditLog::new(settings.audit_buffer_size)),
        );
        Ok(Self::new(Arc::new(orchestrator)))
    }

    pub fn orchestrator(&self) -> &Arc<EventOrchestrator> {
        &self.orchestrator
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.orchestrator.audit()
    }

    pub async fn start(&self) {
        self.orchestrator.start().await;
    }

    pub async fn stop(&self) {
        self.orchestrator.stop().await;
    }

    /// Run one drain cycle now instead of waiting for the next tick
    pub async fn process_queue(&self) {
        self.orchestrator.process_queue().await;
    }

    pub async fn publish(&self, event: Event) -> Result<PublishReceipt, BusError> {
        self.orchestrator.publish(event).await
    }

    pub async fn subscribe(&self, subscription: Subscription) {
        self.orchestrator.subscribe(subscription).await;
    }

    pub async fn unsubscribe(&self, agent_id: &str, event_type: Option<&str>) -> usize {
        self.orchestrator.unsubscribe(agent_id, event_type).await
    }

    /// Stored (PII-protected) form of an event
    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>, BusError> {
        self.orchestrator.get_event(event_id).await
    }

    pub async fn replay_events(
        &self,
        event_type: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, BusError> {
        self.orchestrator.replay(event_type, from, to).await
    }

    pub async fn get_failed_events(&self, limit: usize) -> Result<Vec<Event>, BusError> {
        self.orchestrator.get_failed_events(limit).await
    }

    pub async fn redrive_failed(&self, limit: usize) -> Result<usize, BusError> {
        self.orchestrator.redrive_failed(limit).await
    }

    pub async fn get_subscription_count(&self, event_type: &str) -> usize {
        self.orchestrator.get_subscription_count(event_type).await
    }

    pub async fn get_all_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.orchestrator.get_all_subscriptions().await
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        self.orchestrator.get_queue_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::store::MemoryEventStore;

    #[test]
    fn test_from_settings_requires_key() {
        let settings = Settings::default();
        let result = EventBus::from_settings(&settings, Arc::new(MemoryEventStore::new()));
        assert!(matches!(result, Err(BusError::Pii(_))));
    }

    #[test]
    fn test_from_settings_applies_limits() {
        let settings = Settings {
            encryption_key: "secret".to_string(),
            max_queue_size: 7,
            max_retries: 1,
            ..Settings::default()
        };
        let bus = EventBus::from_settings(&settings, Arc::new(MemoryEventStore::new())).unwrap();

        let config = bus.orchestrator().config();
        assert_eq!(config.max_queue_size, 7);
        assert_eq!(config.max_retries, 1);
    }
}
