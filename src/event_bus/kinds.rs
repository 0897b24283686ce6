/// Standard event types (namespace-prefixed)
///
/// This module defines the closed event taxonomy of the surveillance platform.
/// Event types follow the format: `<category>.<action>`
///
/// Categories:
/// - transaction: Trades and payments entering surveillance
/// - fraud: Alerts raised by detection agents
/// - report: Investigation reports
/// - notification: Outbound messages (WhatsApp, email, ...)
/// - supervisor: Human/supervisor decisions
/// - agent: Agent lifecycle
/// - system: System-level events

pub struct EventKind;

impl EventKind {
    // ========================================================================
    // Transactions
    // ========================================================================
    pub const TRANSACTION_CREATED: &'static str = "transaction.created";
    pub const TRANSACTION_SCORED: &'static str = "transaction.scored";

    // ========================================================================
    // Fraud alerts
    // ========================================================================
    pub const FRAUD_ALERT_CREATED: &'static str = "fraud.alert_created";
    pub const FRAUD_ALERT_UPDATED: &'static str = "fraud.alert_updated";
    pub const FRAUD_ALERT_RESOLVED: &'static str = "fraud.alert_resolved";
    pub const FRAUD_CASE_ESCALATED: &'static str = "fraud.case_escalated";

    // ========================================================================
    // Reports
    // ========================================================================
    pub const REPORT_REQUESTED: &'static str = "report.requested";
    pub const REPORT_GENERATED: &'static str = "report.generated";
    pub const REPORT_FAILED: &'static str = "report.failed";

    // ========================================================================
    // Notifications
    // ========================================================================
    pub const NOTIFICATION_REQUESTED: &'static str = "notification.requested";
    pub const NOTIFICATION_SENT: &'static str = "notification.sent";
    pub const NOTIFICATION_FAILED: &'static str = "notification.failed";

    // ========================================================================
    // Supervision
    // ========================================================================
    pub const SUPERVISOR_REVIEW_REQUESTED: &'static str = "supervisor.review_requested";
    pub const SUPERVISOR_DECISION: &'static str = "supervisor.decision";

    // ========================================================================
    // Agent lifecycle
    // ========================================================================
    pub const AGENT_STARTED: &'static str = "agent.started";
    pub const AGENT_STOPPED: &'static str = "agent.stopped";
    pub const AGENT_HEARTBEAT: &'static str = "agent.heartbeat";
    pub const AGENT_ERROR: &'static str = "agent.error";

    // ========================================================================
    // System
    // ========================================================================
    pub const SYSTEM_HEALTH_CHECK: &'static str = "system.health_check";

    pub const ALL: &'static [&'static str] = &[
        Self::TRANSACTION_CREATED,
        Self::TRANSACTION_SCORED,
        Self::FRAUD_ALERT_CREATED,
        Self::FRAUD_ALERT_UPDATED,
        Self::FRAUD_ALERT_RESOLVED,
        Self::FRAUD_CASE_ESCALATED,
        Self::REPORT_REQUESTED,
        Self::REPORT_GENERATED,
        Self::REPORT_FAILED,
        Self::NOTIFICATION_REQUESTED,
        Self::NOTIFICATION_SENT,
        Self::NOTIFICATION_FAILED,
        Self::SUPERVISOR_REVIEW_REQUESTED,
        Self::SUPERVISOR_DECISION,
        Self::AGENT_STARTED,
        Self::AGENT_STOPPED,
        Self::AGENT_HEARTBEAT,
        Self::AGENT_ERROR,
        Self::SYSTEM_HEALTH_CHECK,
    ];

    pub fn is_known(event_type: &str) -> bool {
        Self::ALL.contains(&event_type)
    }
}
