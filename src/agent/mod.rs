// Agent runtime
//
// Lifecycle shared by every surveillance agent plus the presence registry
// that tracks which agents are alive.

pub mod registry;
pub mod runtime;

pub use registry::{AgentPresence, AgentRegistry};
pub use runtime::{AgentBehavior, AgentStage, BaseAgent};
