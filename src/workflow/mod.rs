//! Typed workflow definitions.
//!
//! A workflow is a named set of steps with dependencies between them. It is
//! validated up front and then submitted to the orchestrator as ordinary
//! tasks.

mod definition;

pub use definition::{WorkflowDefinition, WorkflowHandle, WorkflowStep, STEP_ID_KEY};
