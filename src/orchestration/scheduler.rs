//! Orchestrator: dependency-aware dispatch of tasks to agents.
//!
//! The Orchestrator validates submissions against the dependency graph,
//! pulls ready tasks from its [`TaskSource`], picks the least-loaded
//! matching agent, hands the task over the message bus and waits for the
//! reply. Outcomes are recorded on the task, on the agent directory and,
//! when enabled, on the blackboard.

use crate::agent::{AgentId, AgentSpec};
use crate::blackboard::{Blackboard, BlackboardStats};
use crate::bus::{BusStats, Message, MessageBus, MessageType};
use crate::core::dag::{DependencyGraph, GraphStats};
use crate::core::queue::{QueueStats, TaskQueue, TaskSource};
use crate::core::task::{NewTask, Priority, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::directory::{AgentDirectory, AgentInfo, DirectoryStats};
use crate::orchestration::runtime::{AgentRuntime, Worker};
use crate::workflow::{WorkflowDefinition, WorkflowHandle, STEP_ID_KEY};
use crate::Payload;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Author recorded on blackboard entries written by the orchestrator.
const ORCHESTRATOR_AUTHOR: &str = "orchestrator";

/// Tunables for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Upper bound on worker runtimes spawned through `register_worker`.
    pub max_concurrent_agents: usize,
    /// Reply window for tasks without their own timeout.
    pub default_timeout: Duration,
    /// Carried through from configuration for callers that retry failed
    /// tasks themselves. The run loop never consults it.
    pub max_retries: u32,
    /// Iteration cap used by `run_all`.
    pub max_iterations: usize,
    /// How long `run` waits for a ready task before re-checking state.
    pub poll_interval: Duration,
    /// Write `task:{id}` and `result:{id}` entries to the blackboard.
    pub record_to_blackboard: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            default_timeout: Duration::from_secs(300),
            max_retries: 3,
            max_iterations: 100,
            poll_interval: Duration::from_millis(100),
            record_to_blackboard: true,
        }
    }
}

/// Events emitted by the orchestrator for task lifecycle changes.
///
/// These events allow callers to react to task state changes without
/// polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task has been handed to an agent.
    TaskStarted {
        /// The task that was started.
        task_id: TaskId,
        /// The agent assigned to the task.
        agent_id: AgentId,
    },
    /// A task completed successfully.
    TaskCompleted { task_id: TaskId, agent_id: AgentId },
    /// A task failed or its agent did not answer in time.
    TaskFailed {
        task_id: TaskId,
        /// Reason recorded on the task.
        error: String,
    },
    /// No agent could take the task; it waits for the next pass.
    TaskDeferred { task_id: TaskId },
    /// A run ended with nothing left pending.
    AllTasksComplete,
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed { agent_id: AgentId, result: Payload },
    Failed { agent_id: AgentId, error: String },
    TimedOut { agent_id: AgentId, timeout: Duration },
    /// No selectable agent; the task was deferred and stays Pending.
    NoAvailableAgent,
}

/// Summary returned by [`Orchestrator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    /// Tasks known to the queue when the run started.
    pub total_tasks: usize,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Tasks still pending when the run ended. Their status is left at
    /// Pending so a later run can pick them up.
    pub cancelled: Vec<TaskId>,
    pub iterations: usize,
}

/// Point-in-time view of every subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub running_runtimes: usize,
    pub task_queue: QueueStats,
    pub agent_directory: DirectoryStats,
    pub message_bus: BusStats,
    pub blackboard: BlackboardStats,
    pub dependency_graph: GraphStats,
}

/// Builder for a task submission.
///
/// ```ignore
/// let spec = TaskSpec::new("researcher", "search")
///     .input(json!({"topic": "rust"}))
///     .priority(Priority::High)
///     .depends_on(previous.id);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub agent_type: String,
    pub action: String,
    pub input_data: Payload,
    pub priority: Priority,
    pub dependencies: BTreeSet<TaskId>,
    pub metadata: BTreeMap<String, Payload>,
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(agent_type: &str, action: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            action: action.to_string(),
            ..Default::default()
        }
    }

    pub fn input(mut self, input: Payload) -> Self {
        self.input_data = input;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn depends_on_all(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<Payload>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.agent_type.trim().is_empty() {
            return Err(Error::Validation("agent_type must not be empty".to_string()));
        }
        if self.action.trim().is_empty() {
            return Err(Error::Validation("action must not be empty".to_string()));
        }
        Ok(())
    }

    fn into_new_task(self, id: TaskId) -> NewTask {
        NewTask {
            id: Some(id),
            agent_type: self.agent_type,
            action: self.action,
            input_data: self.input_data,
            priority: self.priority,
            dependencies: self.dependencies,
            metadata: self.metadata,
            timeout: self.timeout,
        }
    }
}

/// Coordinates the queue, graph, directory, bus and blackboard.
pub struct Orchestrator {
    config: OrchestratorConfig,
    /// Mailbox replies arrive on.
    address: AgentId,
    queue: Arc<dyn TaskSource>,
    /// The task dependency graph.
    graph: Arc<RwLock<DependencyGraph>>,
    directory: Arc<RwLock<AgentDirectory>>,
    bus: Arc<MessageBus>,
    blackboard: Arc<Blackboard>,
    runtimes: Mutex<HashMap<AgentId, AgentRuntime>>,
    /// Parent of every runtime's cancellation token.
    cancel: CancellationToken,
    /// Channel for emitting scheduler events.
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Orchestrator {
    /// Create an orchestrator with an in-memory queue, bus and blackboard.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(TaskQueue::new()),
            Arc::new(MessageBus::new()),
            Arc::new(Blackboard::new()),
        )
    }

    /// Create an orchestrator over existing components.
    pub fn with_parts(
        config: OrchestratorConfig,
        queue: Arc<dyn TaskSource>,
        bus: Arc<MessageBus>,
        blackboard: Arc<Blackboard>,
    ) -> Self {
        let address = AgentId::orchestrator();
        bus.register_agent(&address);
        Self {
            config,
            address,
            queue,
            graph: Arc::new(RwLock::new(DependencyGraph::new())),
            directory: Arc::new(RwLock::new(AgentDirectory::new())),
            bus,
            blackboard,
            runtimes: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Emit [`SchedulerEvent`]s on `tx`.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn directory(&self) -> &Arc<RwLock<AgentDirectory>> {
        &self.directory
    }

    pub fn graph(&self) -> &Arc<RwLock<DependencyGraph>> {
        &self.graph
    }

    pub fn queue(&self) -> &Arc<dyn TaskSource> {
        &self.queue
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    // ----- Agents -----

    /// Register an agent and spawn a runtime that feeds it tasks.
    pub async fn register_worker(
        &self,
        spec: AgentSpec,
        worker: Arc<dyn Worker>,
    ) -> Result<AgentInfo> {
        let mut runtimes = self.runtimes.lock().await;
        let replacing = runtimes.remove(&spec.agent_id);
        if replacing.is_none() && runtimes.len() >= self.config.max_concurrent_agents {
            return Err(Error::Validation(format!(
                "cannot run more than {} agents",
                self.config.max_concurrent_agents
            )));
        }
        if let Some(old) = replacing {
            old.shutdown().await;
        }

        let info = self.register_agent(spec).await;
        let runtime = AgentRuntime::spawn(
            info.agent_id.clone(),
            worker,
            Arc::clone(&self.bus),
            self.cancel.child_token(),
        );
        runtimes.insert(info.agent_id.clone(), runtime);
        Ok(info)
    }

    /// Register an agent without a runtime. Something else must answer
    /// its mailbox.
    pub async fn register_agent(&self, spec: AgentSpec) -> AgentInfo {
        self.bus.register_agent(&spec.agent_id);
        self.directory.write().await.register(spec)
    }

    /// Remove an agent everywhere and stop its runtime.
    pub async fn unregister_agent(&self, id: &AgentId) -> Result<AgentInfo> {
        let info = self.directory.write().await.unregister(id)?;
        self.bus.unregister_agent(id);
        let runtime = self.runtimes.lock().await.remove(id);
        if let Some(runtime) = runtime {
            runtime.shutdown().await;
        }
        Ok(info)
    }

    // ----- Submission -----

    /// Validate a task, record it in the dependency graph and enqueue it.
    ///
    /// Nothing is enqueued when an error is returned.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Task> {
        spec.validate()?;
        for dep in &spec.dependencies {
            if self.queue.get_task(dep).is_none() {
                return Err(Error::Validation(format!("unknown dependency {}", dep)));
            }
        }

        let id = TaskId::new();
        {
            let mut graph = self.graph.write().await;
            graph.add_node(id);
            for dep in &spec.dependencies {
                if let Err(e) = graph.add_dependency(id, *dep) {
                    graph.remove_node(&id);
                    return Err(e);
                }
            }
        }

        let task = self.queue.add_task(spec.into_new_task(id));
        info!(
            task = %task.id.short(),
            agent_type = %task.agent_type,
            action = %task.action,
            "task submitted"
        );
        Ok(task)
    }

    /// Submit every step of a workflow in dependency order.
    pub async fn submit_workflow(&self, workflow: &WorkflowDefinition) -> Result<WorkflowHandle> {
        let order = workflow.step_order()?;
        let mut handle = WorkflowHandle::new(&workflow.name);

        for step in order {
            let mut spec = TaskSpec::new(&step.agent_type, &step.action)
                .input(step.input.clone())
                .priority(step.priority)
                .metadata(STEP_ID_KEY, step.id.as_str())
                .metadata("workflow", workflow.name.as_str());
            if !workflow.parameters.is_empty() {
                spec = spec.metadata("parameters", json!(workflow.parameters));
            }
            if let Some(secs) = step.timeout_secs {
                spec = spec.timeout(Duration::from_secs(secs));
            }
            for dep in &step.depends_on {
                // step_order() yields dependencies first.
                let dep_id = handle.task_id(dep).ok_or_else(|| {
                    Error::Validation(format!("step '{}' depends on unknown step '{}'", step.id, dep))
                })?;
                spec = spec.depends_on(dep_id);
            }

            let task = self.submit(spec).await?;
            handle.insert(&step.id, task.id);
        }

        info!(workflow = %workflow.name, steps = handle.len(), "workflow submitted");
        Ok(handle)
    }

    // ----- Dispatch -----

    /// Hand one dequeued task to an agent and wait for its reply.
    ///
    /// `task` must be InProgress, as returned by the queue.
    pub async fn dispatch(&self, task: &Task) -> DispatchOutcome {
        let agent_id = {
            let directory = self.directory.read().await;
            directory
                .find_available_agent(Some(&task.agent_type), None)
                .map(|a| a.agent_id.clone())
        };

        let Some(agent_id) = agent_id else {
            let reason = Error::NoAvailableAgent {
                agent_type: task.agent_type.clone(),
            };
            warn!(task = %task.id.short(), error = %reason, "deferring task");
            if let Err(e) = self.queue.defer_task(&task.id) {
                error!(task = %task.id.short(), error = %e, "failed to defer task");
            }
            self.emit(SchedulerEvent::TaskDeferred { task_id: task.id }).await;
            return DispatchOutcome::NoAvailableAgent;
        };

        if let Err(e) = self.directory.write().await.increment_agent_workload(&agent_id) {
            warn!(agent = %agent_id, error = %e, "failed to update workload");
        }
        if let Err(e) = self.queue.assign_agent(&task.id, &agent_id) {
            warn!(task = %task.id.short(), error = %e, "failed to record assignment");
        }
        if self.config.record_to_blackboard {
            self.record_task(task, &agent_id);
        }

        info!(task = %task.id.short(), agent = %agent_id, "dispatching task");
        self.emit(SchedulerEvent::TaskStarted {
            task_id: task.id,
            agent_id: agent_id.clone(),
        })
        .await;

        let request = Message::new(
            self.address.clone(),
            agent_id.clone(),
            MessageType::Task,
            json!({
                "task_id": task.id,
                "action": task.action,
                "input_data": task.input_data,
                "metadata": task.metadata,
            }),
        )
        .for_task(task.id);
        self.bus.send(request);

        let timeout = task.timeout.unwrap_or(self.config.default_timeout);
        let outcome = match self.await_reply(task.id, timeout).await {
            Ok(Some(reply)) => self.reply_outcome(&agent_id, reply),
            Ok(None) => DispatchOutcome::TimedOut {
                agent_id: agent_id.clone(),
                timeout,
            },
            Err(e) => DispatchOutcome::Failed {
                agent_id: agent_id.clone(),
                error: format!("reply channel unavailable: {}", e),
            },
        };

        self.record_outcome(task, &outcome).await;
        outcome
    }

    /// Wait for the reply tagged with `task_id`, discarding stale replies
    /// from earlier dispatches.
    async fn await_reply(&self, task_id: TaskId, timeout: Duration) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.bus.receive(&self.address, remaining).await? {
                Some(reply) if reply.task_id() == Some(task_id) => return Ok(Some(reply)),
                Some(stale) => {
                    warn!(
                        task = %task_id.short(),
                        sender = %stale.sender(),
                        reply_for = ?stale.task_id(),
                        "discarding stale reply"
                    );
                }
                None => return Ok(None),
            }
        }
    }

    fn reply_outcome(&self, agent_id: &AgentId, reply: Message) -> DispatchOutcome {
        match reply.msg_type() {
            MessageType::Result => DispatchOutcome::Completed {
                agent_id: agent_id.clone(),
                result: reply.content().clone(),
            },
            MessageType::Error => {
                let reason = reply
                    .content()
                    .get("error")
                    .and_then(Payload::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| reply.content().to_string());
                DispatchOutcome::Failed {
                    agent_id: agent_id.clone(),
                    error: format!("agent {} reported an error: {}", agent_id, reason),
                }
            }
            other => DispatchOutcome::Failed {
                agent_id: agent_id.clone(),
                error: format!("unexpected {} reply from agent {}", other, agent_id),
            },
        }
    }

    async fn record_outcome(&self, task: &Task, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Completed { agent_id, result } => {
                if let Err(e) = self.queue.complete_task(&task.id, result.clone()) {
                    error!(task = %task.id.short(), error = %e, "failed to complete task");
                }
                self.release_agent(agent_id, true).await;
                if self.config.record_to_blackboard {
                    self.blackboard
                        .write(&result_key(&task.id), result.clone(), agent_id.as_str());
                }
                info!(task = %task.id.short(), agent = %agent_id, "task completed");
                self.emit(SchedulerEvent::TaskCompleted {
                    task_id: task.id,
                    agent_id: agent_id.clone(),
                })
                .await;
            }
            DispatchOutcome::Failed { agent_id, error } => {
                self.fail(task, agent_id, error.clone()).await;
            }
            DispatchOutcome::TimedOut { agent_id, timeout } => {
                let timeout = Error::DispatchTimeout {
                    task_id: task.id,
                    timeout: *timeout,
                };
                let reason = format!("agent {} did not respond: {}", agent_id, timeout);
                self.fail(task, agent_id, reason).await;
            }
            DispatchOutcome::NoAvailableAgent => {}
        }
    }

    async fn fail(&self, task: &Task, agent_id: &AgentId, reason: String) {
        if let Err(e) = self.queue.fail_task(&task.id, &reason) {
            error!(task = %task.id.short(), error = %e, "failed to mark task failed");
        }
        self.release_agent(agent_id, false).await;
        error!(task = %task.id.short(), agent = %agent_id, reason = %reason, "task failed");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task.id,
            error: reason,
        })
        .await;
    }

    async fn release_agent(&self, agent_id: &AgentId, success: bool) {
        // The agent may have been unregistered while the task was in flight.
        if let Err(e) = self
            .directory
            .write()
            .await
            .record_task_completion(agent_id, success)
        {
            debug!(agent = %agent_id, error = %e, "could not record completion");
        }
    }

    fn record_task(&self, task: &Task, agent_id: &AgentId) {
        let mut record = task.clone();
        record.assign_agent(agent_id.clone());
        match serde_json::to_value(&record) {
            Ok(value) => {
                self.blackboard
                    .write(&task_key(&task.id), value, ORCHESTRATOR_AUTHOR);
            }
            Err(e) => error!(task = %task.id.short(), error = %e, "failed to serialize task"),
        }
    }

    /// Dispatch ready tasks until nothing is pending or `max_iterations`
    /// passes have run.
    ///
    /// Each pass either dispatches one task or, when nothing is ready,
    /// re-admits deferred tasks so an agent registered mid-run can pick
    /// them up. The run ends early only when the pending tasks left can
    /// never become ready.
    pub async fn run(&self, max_iterations: usize) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            total_tasks: self.queue.len(),
            ..Default::default()
        };
        info!(tasks = summary.total_tasks, max_iterations, "starting task execution");

        while summary.iterations < max_iterations {
            summary.iterations += 1;

            let Some(task) = self.queue.get_next_task(self.config.poll_interval).await else {
                if self.queue.pending_ids().is_empty() {
                    break;
                }
                if self.queue.deferred_len() == 0 {
                    warn!(
                        pending = self.queue.pending_ids().len(),
                        "pending tasks are blocked by tasks that did not complete"
                    );
                    break;
                }
                debug!(deferred = self.queue.deferred_len(), "re-admitting deferred tasks");
                self.queue.readmit_deferred();
                continue;
            };

            match self.dispatch(&task).await {
                DispatchOutcome::Completed { .. } => summary.completed.push(task.id),
                DispatchOutcome::Failed { .. } | DispatchOutcome::TimedOut { .. } => {
                    summary.failed.push(task.id)
                }
                DispatchOutcome::NoAvailableAgent => {}
            }
        }

        summary.cancelled = self.queue.pending_ids();
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled.len(),
            iterations = summary.iterations,
            "task execution finished"
        );
        if summary.cancelled.is_empty() {
            self.emit(SchedulerEvent::AllTasksComplete).await;
        }
        summary
    }

    /// `run` with the configured `max_iterations` cap.
    pub async fn run_all(&self) -> ExecutionSummary {
        self.run(self.config.max_iterations).await
    }

    // ----- Queries -----

    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.queue.get_task(id)
    }

    /// Result of a completed task, falling back to the blackboard.
    pub fn get_task_result(&self, id: &TaskId) -> Option<Payload> {
        if let Some(task) = self.queue.get_task(id) {
            if task.status == TaskStatus::Completed {
                return task.result;
            }
        }
        self.blackboard.read(&result_key(id))
    }

    /// Tasks grouped into layers that can run in parallel.
    pub async fn execution_plan(&self) -> Result<Vec<Vec<TaskId>>> {
        self.graph.read().await.get_execution_layers()
    }

    pub async fn system_status(&self) -> SystemStatus {
        let running_runtimes = {
            let runtimes = self.runtimes.lock().await;
            runtimes.values().filter(|r| !r.is_finished()).count()
        };
        SystemStatus {
            timestamp: Utc::now(),
            running_runtimes,
            task_queue: self.queue.stats(),
            agent_directory: self.directory.read().await.stats(),
            message_bus: self.bus.stats(),
            blackboard: self.blackboard.stats(),
            dependency_graph: self.graph.read().await.stats(),
        }
    }

    /// Stop every agent runtime.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let runtimes: Vec<AgentRuntime> = self.runtimes.lock().await.drain().map(|(_, r)| r).collect();
        let count = runtimes.len();
        for runtime in runtimes {
            runtime.shutdown().await;
        }
        info!(runtimes = count, "orchestrator shut down");
    }

    /// Forget every task. Agents stay registered.
    pub async fn reset(&self) {
        self.queue.clear();
        self.graph.write().await.clear();
        info!("orchestrator reset");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("tasks", &self.queue.len())
            .finish()
    }
}

/// Blackboard key for a dispatched task record.
pub fn task_key(id: &TaskId) -> String {
    format!("task:{}", id)
}

/// Blackboard key for a completed task's result.
pub fn result_key(id: &TaskId) -> String {
    format!("result:{}", id)
}
