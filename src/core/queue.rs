//! Priority task queue with dependency gating.
//!
//! Tasks become ready once every dependency has completed. Ready tasks are
//! served highest priority first and FIFO among equal priorities.

use crate::agent::AgentId;
use crate::core::task::{NewTask, Priority, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::Payload;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Aggregate counters over every task the queue has seen.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QueueStats {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub ready_tasks: usize,
    /// Completed over total, 0.0 for an empty queue.
    pub success_rate: f64,
}

/// Where the scheduler gets its work from.
///
/// [`TaskQueue`] is the in-process implementation.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Create a Pending task.
    fn add_task(&self, def: NewTask) -> Task;

    /// Wait up to `timeout` for a ready task and mark it InProgress.
    async fn get_next_task(&self, timeout: Duration) -> Option<Task>;

    /// Take a ready task without waiting.
    fn try_next_task(&self) -> Option<Task>;

    /// Complete a task, returning the dependents it made ready.
    fn complete_task(&self, id: &TaskId, result: Payload) -> Result<Vec<TaskId>>;

    fn fail_task(&self, id: &TaskId, error: &str) -> Result<()>;

    fn cancel_task(&self, id: &TaskId) -> Result<()>;

    /// Record which agent a task was dispatched to.
    fn assign_agent(&self, id: &TaskId, agent: &AgentId) -> Result<()>;

    /// Return an InProgress task to Pending and hold it back until
    /// [`TaskSource::readmit_deferred`].
    fn defer_task(&self, id: &TaskId) -> Result<()>;

    /// Push every deferred task back onto the ready set.
    fn readmit_deferred(&self) -> usize;

    fn get_task(&self, id: &TaskId) -> Option<Task>;

    fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task>;

    /// Pending task IDs in submission order.
    fn pending_ids(&self) -> Vec<TaskId>;

    fn ready_len(&self) -> usize;

    fn deferred_len(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> QueueStats;

    fn clear(&self);
}

type HeapEntry = Reverse<(Priority, u64, TaskId)>;

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    /// Submission order.
    order: Vec<TaskId>,
    /// Insertion sequence per task, the FIFO tie-break in the heap.
    seq: HashMap<TaskId, u64>,
    next_seq: u64,
    heap: BinaryHeap<HeapEntry>,
    /// Tasks with a live heap entry. Heap entries for anything else are stale.
    ready: HashSet<TaskId>,
    deferred: Vec<TaskId>,
}

impl QueueState {
    fn push_ready(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get(&id) else {
            return false;
        };
        if !self.ready.insert(id) {
            return false;
        }
        let seq = self.seq.get(&id).copied().unwrap_or_default();
        self.heap.push(Reverse((task.priority, seq, id)));
        true
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    fn pop_ready(&mut self) -> Option<Task> {
        while let Some(Reverse((_, _, id))) = self.heap.pop() {
            if !self.ready.remove(&id) {
                continue;
            }
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.start().is_err() {
                continue;
            }
            return Some(task.clone());
        }
        None
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

/// In-process priority queue of tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tasks that need the given agent type, in submission order.
    pub fn tasks_by_agent_type(&self, agent_type: &str) -> Vec<Task> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.agent_type == agent_type)
            .cloned()
            .collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskSource for TaskQueue {
    fn add_task(&self, def: NewTask) -> Task {
        let task = Task::new(def);
        let id = task.id;

        let ready = {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.seq.insert(id, seq);
            state.order.push(id);
            let ready = state.deps_completed(&task);
            state.tasks.insert(id, task.clone());
            ready && state.push_ready(id)
        };

        if ready {
            self.notify.notify_one();
        }
        debug!(
            task = %id.short(),
            priority = %task.priority,
            ready,
            "task added"
        );
        task
    }

    async fn get_next_task(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_next_task() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_next_task();
            }
        }
    }

    fn try_next_task(&self) -> Option<Task> {
        let task = self.state().pop_ready()?;
        debug!(task = %task.id.short(), action = %task.action, "task dequeued");
        Some(task)
    }

    fn complete_task(&self, id: &TaskId, result: Payload) -> Result<Vec<TaskId>> {
        let newly_ready = {
            let mut state = self.state();
            state.task_mut(id)?.complete(result)?;

            // Re-evaluate every waiting task, not only direct dependents.
            let candidates: Vec<TaskId> = state
                .order
                .iter()
                .filter(|tid| !state.ready.contains(*tid) && !state.deferred.contains(*tid))
                .filter(|tid| {
                    state
                        .tasks
                        .get(*tid)
                        .is_some_and(|t| t.status == TaskStatus::Pending && state.deps_completed(t))
                })
                .copied()
                .collect();

            candidates
                .into_iter()
                .filter(|tid| state.push_ready(*tid))
                .collect::<Vec<_>>()
        };

        for _ in &newly_ready {
            self.notify.notify_one();
        }
        info!(task = %id.short(), unblocked = newly_ready.len(), "task completed");
        Ok(newly_ready)
    }

    fn fail_task(&self, id: &TaskId, error: &str) -> Result<()> {
        self.state().task_mut(id)?.fail(error)?;
        info!(task = %id.short(), error, "task failed");
        Ok(())
    }

    fn cancel_task(&self, id: &TaskId) -> Result<()> {
        let mut state = self.state();
        state.task_mut(id)?.cancel()?;
        state.ready.remove(id);
        state.deferred.retain(|d| d != id);
        info!(task = %id.short(), "task cancelled");
        Ok(())
    }

    fn assign_agent(&self, id: &TaskId, agent: &AgentId) -> Result<()> {
        self.state().task_mut(id)?.assign_agent(agent.clone());
        Ok(())
    }

    fn defer_task(&self, id: &TaskId) -> Result<()> {
        let mut state = self.state();
        state.task_mut(id)?.release()?;
        if !state.deferred.contains(id) {
            state.deferred.push(*id);
        }
        debug!(task = %id.short(), "task deferred");
        Ok(())
    }

    fn readmit_deferred(&self) -> usize {
        let readmitted = {
            let mut state = self.state();
            let deferred = std::mem::take(&mut state.deferred);
            deferred
                .into_iter()
                .filter(|id| {
                    let pending = state
                        .tasks
                        .get(id)
                        .is_some_and(|t| t.status == TaskStatus::Pending);
                    pending && state.push_ready(*id)
                })
                .count()
        };

        for _ in 0..readmitted {
            self.notify.notify_one();
        }
        if readmitted > 0 {
            debug!(count = readmitted, "deferred tasks readmitted");
        }
        readmitted
    }

    fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.state().tasks.get(id).cloned()
    }

    fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    fn pending_ids(&self) -> Vec<TaskId> {
        let state = self.state();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.status == TaskStatus::Pending)
            })
            .copied()
            .collect()
    }

    fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    fn deferred_len(&self) -> usize {
        self.state().deferred.len()
    }

    fn len(&self) -> usize {
        self.state().tasks.len()
    }

    fn stats(&self) -> QueueStats {
        let state = self.state();
        let total_tasks = state.tasks.len();
        let completed_tasks = state.count(TaskStatus::Completed);
        QueueStats {
            total_tasks,
            completed_tasks,
            failed_tasks: state.count(TaskStatus::Failed),
            cancelled_tasks: state.count(TaskStatus::Cancelled),
            pending_tasks: state.count(TaskStatus::Pending),
            in_progress_tasks: state.count(TaskStatus::InProgress),
            ready_tasks: state.ready.len(),
            success_rate: if total_tasks > 0 {
                completed_tasks as f64 / total_tasks as f64
            } else {
                0.0
            },
        }
    }

    fn clear(&self) {
        *self.state() = QueueState::default();
        debug!("task queue cleared");
    }
}
