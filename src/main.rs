use std::sync::Arc;

use async_trait::async_trait;
use fraudwatch::agent::{AgentBehavior, AgentRegistry, BaseAgent};
use fraudwatch::config::Settings;
use fraudwatch::event_bus::{
    handler_fn, Event, EventBus, EventKind, EventStore, MemoryEventStore, PgEventStore,
};
use tracing::{error, info, warn};

// ============================================================================
// Health monitor
// ============================================================================

/// Built-in agent that logs health checks and errors reported by other agents
struct HealthMonitor;

#[async_trait]
impl AgentBehavior for HealthMonitor {
    async fn setup_subscriptions(&self, agent: &BaseAgent) -> anyhow::Result<()> {
        agent
            .subscribe(
                [EventKind::SYSTEM_HEALTH_CHECK, EventKind::AGENT_ERROR],
                0,
                handler_fn(|event: Event| async move {
                    if event.event_type == EventKind::AGENT_ERROR {
                        warn!(
                            event_id = %event.event_id,
                            agent_id = %event.payload["agent_id"],
                            error = %event.payload["error"],
                            "agent reported an error"
                        );
                    } else {
                        info!(event_id = %event.event_id, "health check received");
                    }
                    Ok(())
                }),
            )
            .await;
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting FraudWatch event bus");

    let settings = Settings::new().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let store: Arc<dyn EventStore> = match &settings.database_url {
        Some(url) => {
            info!("Initializing event store...");
            let store = PgEventStore::connect(url)?;

            info!("Running database migrations...");
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            warn!("No database_url configured, events are kept in memory only");
            Arc::new(MemoryEventStore::new())
        }
    };

    let bus = EventBus::from_settings(&settings, store)?;
    let registry = AgentRegistry::new();
    bus.start().await;

    let monitor = BaseAgent::from_settings(
        &settings,
        "health-monitor",
        "monitor",
        bus.clone(),
        registry.clone(),
        Arc::new(HealthMonitor),
    );
    monitor.start().await?;

    let heartbeat = settings.heartbeat_interval();
    let stale_after = chrono::Duration::from_std(heartbeat * 3)?;
    let mut ticker = tokio::time::interval(heartbeat);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = bus.get_queue_stats().await;
                info!(
                    size = stats.size,
                    published = stats.published,
                    delivered = stats.delivered,
                    retried = stats.retried,
                    dropped = stats.dropped,
                    failed = stats.failed,
                    "queue stats"
                );

                for presence in registry.stale_agents(stale_after).await {
                    warn!(
                        agent_id = %presence.agent_id,
                        last_heartbeat = %presence.last_heartbeat,
                        "agent missed heartbeats"
                    );
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down event bus...");
    if let Err(e) = monitor.stop().await {
        warn!("Health monitor did not stop cleanly: {}", e);
    }
    bus.stop().await;
    Ok(())
}
