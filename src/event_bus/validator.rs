use serde::Serialize;
use serde_json::Value;

use super::kinds::EventKind;
use super::schema::{payload_rule, PayloadRule, SCHEMA_VERSION};
use super::types::{parse_timestamp, Event};
use crate::error::BusError;

/// A single validation finding; `field` is the dotted path it refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// Stateless structural and per-type payload validation
#[derive(Debug, Clone, Copy, Default)]
pub struct EventValidator;

impl EventValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, event: &Event) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if event.event_id.trim().is_empty() {
            errors.push(ValidationIssue::new("event_id", "event_id is required"));
        }

        let event_type = event.event_type.trim();
        let known_type = if event_type.is_empty() {
            errors.push(ValidationIssue::new("event_type", "event_type is required"));
            false
        } else if !EventKind::is_known(event_type) {
            errors.push(ValidationIssue::new(
                "event_type",
                format!("unknown event type '{event_type}'"),
            ));
            false
        } else {
            true
        };

        if event.version.trim().is_empty() {
            errors.push(ValidationIssue::new("version", "version is required"));
        } else if event.version != SCHEMA_VERSION {
            warnings.push(ValidationIssue::new(
                "version",
                format!(
                    "schema version {} differs from supported version {}",
                    event.version, SCHEMA_VERSION
                ),
            ));
        }

        if event.timestamp.trim().is_empty() {
            errors.push(ValidationIssue::new("timestamp", "timestamp is required"));
        } else if parse_timestamp(&event.timestamp).is_none() {
            errors.push(ValidationIssue::new(
                "timestamp",
                format!("'{}' is not a valid ISO-8601 timestamp", event.timestamp),
            ));
        }

        match &event.payload {
            Value::Object(_) => {
                if known_type {
                    if let Some(rule) = payload_rule(event_type) {
                        check_payload(&event.payload, rule, &mut errors);
                    }
                }
            }
            Value::Null => errors.push(ValidationIssue::new("payload", "payload is required")),
            _ => errors.push(ValidationIssue::new("payload", "payload must be an object")),
        }

        if let Some(metadata) = &event.metadata {
            if !metadata.is_object() {
                errors.push(ValidationIssue::new("metadata", "metadata must be an object"));
            }
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Encode an event for transport
    pub fn serialize(&self, event: &Event) -> Result<String, BusError> {
        Ok(serde_json::to_string(event)?)
    }

    /// Decode and revalidate an event received from transport
    pub fn deserialize(&self, raw: &str) -> Result<Event, BusError> {
        let event: Event = serde_json::from_str(raw)?;
        let result = self.validate(&event);
        if !result.valid {
            return Err(BusError::Validation(result.errors));
        }
        Ok(event)
    }

    /// Minimum bar for reprocessing a stored event
    pub fn is_replay_safe(&self, event: &Event) -> bool {
        self.validate(event).valid
            && !event.event_id.trim().is_empty()
            && !event.timestamp.trim().is_empty()
    }
}

fn check_payload(payload: &Value, rule: &PayloadRule, errors: &mut Vec<ValidationIssue>) {
    for path in rule.required {
        if is_missing(lookup(payload, path)) {
            errors.push(ValidationIssue::new(
                format!("payload.{path}"),
                format!("{path} is required"),
            ));
        }
    }

    for (path, allowed) in rule.enums {
        let Some(value) = present(lookup(payload, path)) else {
            continue;
        };
        let ok = value.as_str().is_some_and(|s| allowed.contains(&s));
        if !ok {
            errors.push(ValidationIssue::new(
                format!("payload.{path}"),
                format!("{value} is not one of [{}]", allowed.join(", ")),
            ));
        }
    }

    for (path, min, max) in rule.ranges {
        let Some(value) = present(lookup(payload, path)) else {
            continue;
        };
        match value.as_f64() {
            Some(n) if n >= *min && n <= *max => {}
            Some(n) => errors.push(ValidationIssue::new(
                format!("payload.{path}"),
                format!("{n} is outside [{min}, {max}]"),
            )),
            None => errors.push(ValidationIssue::new(
                format!("payload.{path}"),
                "must be a number",
            )),
        }
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |value, key| value.get(key))
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: Value) -> Event {
        let mut event = Event::new(event_type, payload);
        event.normalize();
        event
    }

    #[test]
    fn test_valid_alert() {
        let result = EventValidator::new().validate(&event(
            EventKind::FRAUD_ALERT_CREATED,
            json!({"user_id": "u-1", "severity": "high"}),
        ));
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_required_field_names_path() {
        let result = EventValidator::new().validate(&event(
            EventKind::FRAUD_ALERT_CREATED,
            json!({"user_id": "u-1"}),
        ));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "payload.severity");
    }

    #[test]
    fn test_missing_base_fields() {
        let raw = Event::new("", Value::Null);
        let result = EventValidator::new().validate(&raw);
        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["event_id", "event_type", "version", "timestamp", "payload"]
        );
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result = EventValidator::new().validate(&event("fraud.mystery", json!({})));
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "event_type");
    }

    #[test]
    fn test_type_without_rule_skips_payload_checks() {
        let result =
            EventValidator::new().validate(&event(EventKind::AGENT_HEARTBEAT, json!({"any": 1})));
        assert!(result.valid);
    }

    #[test]
    fn test_enum_constraint() {
        let result = EventValidator::new().validate(&event(
            EventKind::FRAUD_ALERT_CREATED,
            json!({"user_id": "u-1", "severity": "apocalyptic"}),
        ));
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "payload.severity");
    }

    #[test]
    fn test_risk_score_range() {
        let validator = EventValidator::new();
        let scored = |score: Value| {
            event(
                EventKind::TRANSACTION_SCORED,
                json!({"transaction_id": "t-1", "user_id": "u-1", "risk_score": score}),
            )
        };

        assert!(validator.validate(&scored(json!(0))).valid);
        assert!(validator.validate(&scored(json!(100))).valid);
        assert!(validator.validate(&scored(json!(57.5))).valid);
        assert!(!validator.validate(&scored(json!(100.1))).valid);
        assert!(!validator.validate(&scored(json!(-1))).valid);
        assert!(!validator.validate(&scored(json!("high"))).valid);
    }

    #[test]
    fn test_version_mismatch_is_warning() {
        let mut e = event(
            EventKind::FRAUD_ALERT_CREATED,
            json!({"user_id": "u-1", "severity": "low"}),
        );
        e.version = "0.9.0".to_string();

        let result = EventValidator::new().validate(&e);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].field, "version");
    }

    #[test]
    fn test_invalid_timestamp() {
        let mut e = event(EventKind::AGENT_HEARTBEAT, json!({}));
        e.timestamp = "not-a-date".to_string();
        let result = EventValidator::new().validate(&e);
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "timestamp");
    }

    #[test]
    fn test_payload_must_be_object() {
        let result = EventValidator::new().validate(&event(EventKind::AGENT_HEARTBEAT, json!([1])));
        assert!(!result.valid);
        assert_eq!(result.errors[0].message, "payload must be an object");
    }

    #[test]
    fn test_deserialize_revalidates() {
        let validator = EventValidator::new();
        let e = event(
            EventKind::SUPERVISOR_DECISION,
            json!({"alert_id": "a-1", "decision": "approve"}),
        );
        let wire = validator.serialize(&e).unwrap();
        assert_eq!(validator.deserialize(&wire).unwrap(), e);

        let broken = wire.replace("approve", "shrug");
        let err = validator.deserialize(&broken).unwrap_err();
        assert_eq!(err.validation_issues()[0].field, "payload.decision");

        assert!(matches!(
            validator.deserialize("{not json"),
            Err(BusError::Serialization(_))
        ));
    }

    #[test]
    fn test_replay_safe() {
        let validator = EventValidator::new();
        let e = event(EventKind::AGENT_HEARTBEAT, json!({}));
        assert!(validator.is_replay_safe(&e));

        let mut no_id = e.clone();
        no_id.event_id.clear();
        assert!(!validator.is_replay_safe(&no_id));
    }
}
