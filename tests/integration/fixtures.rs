//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Orchestrators tuned for fast tests
//! - Workers that echo, fail or record what they were asked to do
//! - A sample workflow definition

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use hive::agent::AgentId;
use hive::orchestration::TaskRequest;
use hive::{Error, FnWorker, Orchestrator, OrchestratorConfig, Worker};

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        default_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn orchestrator() -> Orchestrator {
    Orchestrator::new(fast_config())
}

/// Replies with the action and input it was given.
pub fn echo_worker() -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(|request: TaskRequest| {
        Ok(json!({ "action": request.action, "input": request.input_data }))
    }))
}

/// Fails every task whose action is `fail`, echoes the rest.
pub fn flaky_worker() -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(|request: TaskRequest| {
        if request.action == "fail" {
            return Err(Error::Worker(format!("cannot {}", request.action)));
        }
        Ok(json!({ "action": request.action }))
    }))
}

/// Log of `(agent, action)` pairs in the order work was done.
pub type WorkLog = Arc<Mutex<Vec<(String, String)>>>;

pub fn work_log() -> WorkLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Appends every request to `log` under `agent`, then echoes.
pub fn recording_worker(agent: &AgentId, log: &WorkLog) -> Arc<dyn Worker> {
    let agent = agent.to_string();
    let log = Arc::clone(log);
    Arc::new(FnWorker::new(move |request: TaskRequest| {
        log.lock()
            .unwrap()
            .push((agent.clone(), request.action.clone()));
        Ok(json!({ "done": request.action, "by": agent }))
    }))
}

pub fn actions(log: &WorkLog) -> Vec<String> {
    log.lock().unwrap().iter().map(|(_, a)| a.clone()).collect()
}

pub const RESEARCH_WORKFLOW: &str = r#"{
    "name": "research-report",
    "description": "Research a topic from two angles and write it up",
    "parameters": {"topic": "ownership"},
    "steps": [
        {"id": "gather", "agent_type": "researcher", "action": "gather",
         "input": {"sources": 3}, "priority": "high"},
        {"id": "fact_check", "agent_type": "checker", "action": "verify",
         "depends_on": ["gather"]},
        {"id": "outline", "agent_type": "writer", "action": "outline",
         "depends_on": ["gather"]},
        {"id": "draft", "agent_type": "writer", "action": "draft",
         "depends_on": ["fact_check", "outline"], "timeout_secs": 5}
    ]
}"#;
