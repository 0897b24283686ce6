pub mod agent;
pub mod config;
pub mod error;
pub mod event_bus;

pub use error::{AgentError, BusError};
