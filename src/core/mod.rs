//! Core domain models for task orchestration.
//!
//! This module contains the task model, the dependency graph that orders
//! tasks, and the priority queue that hands ready tasks to the scheduler.

pub mod dag;
pub mod queue;
pub mod task;

pub use dag::{DependencyGraph, GraphStats};
pub use queue::{QueueStats, TaskQueue, TaskSource};
pub use task::{NewTask, Priority, Task, TaskId, TaskStatus};
