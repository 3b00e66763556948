//! Orchestration layer for the Hive multi-agent system.
//!
//! This module ties the core task structures to running agents: the
//! directory tracks who can do what, runtimes execute work behind the
//! message bus, the orchestrator schedules and dispatches tasks, and the
//! aggregator combines answers from several agents.

pub mod aggregator;
pub mod directory;
pub mod runtime;
pub mod scheduler;

pub use aggregator::{
    aggregate, aggregate_lists, aggregate_numeric, analyze_agreement, confident_result,
    AgentResult, AggregationStrategy, AgreementReport, NumericMethod,
};
pub use directory::{AgentDirectory, AgentInfo, AgentStatus, DirectoryStats};
pub use runtime::{AgentRuntime, FnWorker, TaskRequest, Worker};
pub use scheduler::{
    result_key, task_key, DispatchOutcome, ExecutionSummary, Orchestrator, OrchestratorConfig,
    SchedulerEvent, SystemStatus, TaskSpec,
};
