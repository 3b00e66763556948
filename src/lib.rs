pub mod agent;
pub mod blackboard;
pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod workflow;

/// Opaque task and message payload. The core never inspects it beyond the
/// success/failure boundary.
pub type Payload = serde_json::Value;

pub use agent::{AgentId, AgentSpec};
pub use blackboard::{Blackboard, BlackboardConfig, MemoryEntry};
pub use bus::{Message, MessageBus, MessageType};
pub use core::{Priority, Task, TaskId, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{
    AgentRuntime, DispatchOutcome, ExecutionSummary, FnWorker, Orchestrator, OrchestratorConfig,
    TaskSpec, Worker,
};
pub use workflow::{WorkflowDefinition, WorkflowHandle, WorkflowStep};
