// Event Bus
//
// Event-driven orchestration core shared by every surveillance agent.
// Events are validated, PII-protected and persisted on publish, then
// delivered in order to subscribers with retry and idempotent replay.

pub mod types;
pub mod kinds;
pub mod schema;
pub mod validator;
pub mod pii;
pub mod audit;
pub mod store;
pub mod orchestrator;
pub mod bus;

pub use types::{Event, EventStatus, ProcessingRecord, QueueItem, QueueStats};
pub use kinds::EventKind;
pub use validator::{EventValidator, ValidationIssue, ValidationResult};
pub use pii::{PiiCipher, PiiProtector};
pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use store::{EventStore, MemoryEventStore, PgEventStore};
pub use orchestrator::{
    handler_fn, EventHandler, EventOrchestrator, OrchestratorConfig, PublishReceipt, Subscription,
    SubscriptionInfo,
};
pub use bus::EventBus;
