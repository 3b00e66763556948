//! Task data model for the scheduler.
//!
//! Tasks are the atomic units of work dispatched to agents. Each task
//! tracks its priority, dependencies, status, assignment and outcome.

use crate::agent::AgentId;
use crate::error::{Error, Result};
use crate::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task priority. Lower numeric value means higher precedence, so the
/// derived ordering sorts `Critical` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "0" => Ok(Priority::Critical),
            "high" | "1" => Ok(Priority::High),
            "medium" | "2" => Ok(Priority::Medium),
            "low" | "3" => Ok(Priority::Low),
            other => Err(Error::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Task status in its lifecycle.
///
/// Pending -> InProgress -> {Completed, Failed}. Cancelled can be reached
/// from any non-terminal state. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted; may or may not have its dependencies satisfied yet.
    #[default]
    Pending,
    /// Dequeued and dispatched to an agent.
    InProgress,
    /// Completed successfully.
    Completed,
    /// Failed with an error.
    Failed,
    /// Cancelled before reaching another terminal state.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything needed to create a task. The queue assigns status and
/// timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Pre-assigned ID; generated when `None`.
    pub id: Option<TaskId>,
    pub agent_type: String,
    pub action: String,
    pub input_data: Payload,
    pub priority: Priority,
    pub dependencies: BTreeSet<TaskId>,
    pub metadata: BTreeMap<String, Payload>,
    pub timeout: Option<Duration>,
}

impl NewTask {
    pub fn new(agent_type: &str, action: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            action: action.to_string(),
            ..Default::default()
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Agent type required to run this task.
    pub agent_type: String,
    /// Action the agent should perform.
    pub action: String,
    /// Opaque input handed to the worker.
    pub input_data: Payload,
    pub priority: Priority,
    /// Tasks that must be Completed before this one is eligible.
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Payload>,
    /// Reply window for dispatch; the orchestrator default applies when unset.
    #[serde(default, with = "duration_secs")]
    pub timeout: Option<Duration>,
    /// Current execution status.
    pub status: TaskStatus,
    /// ID of the agent the task was dispatched to.
    pub agent_id: Option<AgentId>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

impl Task {
    /// Create a new Pending task from its definition.
    pub fn new(def: NewTask) -> Self {
        Self {
            id: def.id.unwrap_or_default(),
            agent_type: def.agent_type,
            action: def.action,
            input_data: def.input_data,
            priority: def.priority,
            dependencies: def.dependencies,
            metadata: def.metadata,
            timeout: def.timeout,
            status: TaskStatus::Pending,
            agent_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn transition(&mut self, allowed: &[TaskStatus], to: TaskStatus) -> Result<()> {
        if allowed.contains(&self.status) {
            self.status = to;
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Start the task execution.
    ///
    /// Transitions Pending to InProgress and records the start time.
    pub fn start(&mut self) -> Result<()> {
        self.transition(&[TaskStatus::Pending], TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as successfully completed with its result.
    pub fn complete(&mut self, result: Payload) -> Result<()> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Completed)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Failed)?;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a task that has not reached a terminal state.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(
            &[TaskStatus::Pending, TaskStatus::InProgress],
            TaskStatus::Cancelled,
        )?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Return an in-progress task to Pending without recording an outcome.
    pub fn release(&mut self) -> Result<()> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Pending)?;
        self.started_at = None;
        self.agent_id = None;
        Ok(())
    }

    /// Assign an agent to this task.
    pub fn assign_agent(&mut self, agent_id: AgentId) {
        self.agent_id = Some(agent_id);
    }

    /// Execution time, available once the task has started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
