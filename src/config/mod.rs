use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::event_bus::OrchestratorConfig;

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_audit_buffer_size() -> usize {
    1_000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Secret the PII encryption key is derived from (required)
    #[serde(default)]
    pub encryption_key: String,
    /// PostgreSQL event store; in-memory when unset
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_audit_buffer_size")]
    pub audit_buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            encryption_key: String::new(),
            database_url: None,
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            audit_buffer_size: default_audit_buffer_size(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables (FRAUDWATCH_MAX_QUEUE_SIZE, ...)
            .add_source(
                Environment::with_prefix("FRAUDWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption_key.trim().is_empty() {
            return Err(ConfigError::Message(
                "encryption_key is required for PII protection".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Message(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Message(
                "heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_queue_size: settings.max_queue_size,
            max_retries: settings.max_retries,
            base_retry_delay: Duration::from_millis(settings.base_retry_delay_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        }
    }
}
