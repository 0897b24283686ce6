//! Per-type payload rules.
//!
//! Validation is table-driven: each event type maps to a [`PayloadRule`]
//! listing required payload fields plus enumerated and numeric-range
//! constraints. Field paths are dot-separated and relative to `payload`.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::kinds::EventKind;

/// Schema version produced by this build
pub const SCHEMA_VERSION: &str = "1.0.0";

const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];

#[derive(Debug, Clone, Copy)]
pub struct PayloadRule {
    pub required: &'static [&'static str],
    /// `(path, allowed values)`; checked only when the field is present
    pub enums: &'static [(&'static str, &'static [&'static str])],
    /// `(path, min, max)` inclusive; checked only when the field is present
    pub ranges: &'static [(&'static str, f64, f64)],
}

impl PayloadRule {
    const fn required(required: &'static [&'static str]) -> Self {
        Self {
            required,
            enums: &[],
            ranges: &[],
        }
    }
}

/// Rule for `event_type`, if one is registered
pub fn payload_rule(event_type: &str) -> Option<&'static PayloadRule> {
    rules().get(event_type)
}

fn rules() -> &'static HashMap<&'static str, PayloadRule> {
    static RULES: OnceLock<HashMap<&'static str, PayloadRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        HashMap::from([
            (
                EventKind::TRANSACTION_CREATED,
                PayloadRule {
                    required: &["transaction_id", "user_id", "amount", "currency"],
                    enums: &[(
                        "transaction_type",
                        &["deposit", "withdrawal", "transfer", "trade", "payment"],
                    )],
                    ranges: &[("amount", 0.0, f64::MAX)],
                },
            ),
            (
                EventKind::TRANSACTION_SCORED,
                PayloadRule {
                    required: &["transaction_id", "user_id", "risk_score"],
                    enums: &[("risk_level", SEVERITIES)],
                    ranges: &[("risk_score", 0.0, 100.0)],
                },
            ),
            (
                EventKind::FRAUD_ALERT_CREATED,
                PayloadRule {
                    required: &["user_id", "severity"],
                    enums: &[("severity", SEVERITIES)],
                    ranges: &[("risk_score", 0.0, 100.0)],
                },
            ),
            (
                EventKind::FRAUD_ALERT_UPDATED,
                PayloadRule {
                    required: &["alert_id", "status"],
                    enums: &[
                        ("status", &["open", "investigating", "escalated", "resolved"]),
                        ("severity", SEVERITIES),
                    ],
                    ranges: &[("risk_score", 0.0, 100.0)],
                },
            ),
            (
                EventKind::FRAUD_ALERT_RESOLVED,
                PayloadRule {
                    required: &["alert_id", "resolution"],
                    enums: &[(
                        "resolution",
                        &["confirmed_fraud", "false_positive", "inconclusive"],
                    )],
                    ranges: &[],
                },
            ),
            (
                EventKind::FRAUD_CASE_ESCALATED,
                PayloadRule {
                    required: &["alert_id", "reason"],
                    enums: &[("severity", SEVERITIES)],
                    ranges: &[],
                },
            ),
            (
                EventKind::REPORT_REQUESTED,
                PayloadRule {
                    required: &["alert_id", "report_type"],
                    enums: &[("report_type", &["investigation", "regulatory", "summary"])],
                    ranges: &[],
                },
            ),
            (
                EventKind::REPORT_GENERATED,
                PayloadRule::required(&["report_id", "alert_id"]),
            ),
            (
                EventKind::REPORT_FAILED,
                PayloadRule::required(&["alert_id", "error"]),
            ),
            (
                EventKind::NOTIFICATION_REQUESTED,
                PayloadRule {
                    required: &["channel", "recipient", "message"],
                    enums: &[("channel", &["whatsapp", "email", "sms"])],
                    ranges: &[],
                },
            ),
            (
                EventKind::NOTIFICATION_SENT,
                PayloadRule {
                    required: &["notification_id", "channel"],
                    enums: &[("channel", &["whatsapp", "email", "sms"])],
                    ranges: &[],
                },
            ),
            (
                EventKind::NOTIFICATION_FAILED,
                PayloadRule::required(&["notification_id", "error"]),
            ),
            (
                EventKind::SUPERVISOR_REVIEW_REQUESTED,
                PayloadRule::required(&["alert_id"]),
            ),
            (
                EventKind::SUPERVISOR_DECISION,
                PayloadRule {
                    required: &["alert_id", "decision"],
                    enums: &[("decision", &["approve", "reject", "escalate"])],
                    ranges: &[],
                },
            ),
            (
                EventKind::AGENT_ERROR,
                PayloadRule::required(&["agent_id", "error"]),
            ),
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_only_reference_known_types() {
        for event_type in rules().keys() {
            assert!(EventKind::is_known(event_type), "{event_type}");
        }
    }

    #[test]
    fn test_types_without_rule() {
        assert!(payload_rule(EventKind::AGENT_HEARTBEAT).is_none());
        assert!(payload_rule(EventKind::SYSTEM_HEALTH_CHECK).is_none());
    }

    #[test]
    fn test_alert_rule() {
        let rule = payload_rule(EventKind::FRAUD_ALERT_CREATED).unwrap();
        assert_eq!(rule.required, &["user_id", "severity"]);
        assert_eq!(rule.ranges, &[("risk_score", 0.0, 100.0)]);
    }
}
