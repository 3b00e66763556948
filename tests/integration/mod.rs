//! Integration test suite for Hive.
//!
//! These tests drive the public API end to end: tasks are submitted to an
//! orchestrator, dispatched over the message bus to worker runtimes and
//! recorded on the blackboard.
//!
//! # Test Categories
//!
//! - `orchestration`: Dependency-ordered execution, priorities, load balancing
//! - `messaging`: Message bus and blackboard behaviour across tasks and threads
//! - `workflow_e2e`: Workflow definitions from JSON through to aggregated results
//!
//! All workers are in-process closures, so the suite needs no external
//! services.

mod fixtures;

mod messaging;
mod orchestration;
mod workflow_e2e;
