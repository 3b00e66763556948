use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Adding dependency {node} -> {depends_on} would create a cycle")]
    Cycle { node: TaskId, depends_on: TaskId },

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("No available agent of type '{agent_type}'")]
    NoAvailableAgent { agent_type: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    DispatchTimeout { task_id: TaskId, timeout: Duration },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id} from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;
