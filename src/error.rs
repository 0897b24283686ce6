use thiserror::Error;

use crate::event_bus::pii::PiiError;
use crate::event_bus::validator::ValidationIssue;

// ============================================================================
// Error types
// ============================================================================

/// Errors surfaced synchronously by the bus
///
/// Delivery failures never show up here; they are contained by the
/// orchestrator and only visible through the audit log and queue stats.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Validation failed: {}", describe(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("PII protection error: {0}")]
    Pii(#[from] PiiError),

    #[error("Store error: {0}")]
    Store(anyhow::Error),
}

impl BusError {
    pub fn validation_issues(&self) -> &[ValidationIssue] {
        match self {
            BusError::Validation(issues) => issues,
            _ => &[],
        }
    }
}

fn describe(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Agent hook failed: {0}")]
    Hook(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
