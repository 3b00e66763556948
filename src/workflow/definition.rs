//! Workflow and step definitions.

use crate::core::dag::DependencyGraph;
use crate::core::task::{Priority, TaskId};
use crate::error::{Error, Result};
use crate::Payload;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Task metadata key holding the step a task was created from.
pub const STEP_ID_KEY: &str = "step_id";

/// One step of a workflow; becomes one task on submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    pub agent_type: String,
    pub action: String,
    #[serde(default)]
    pub input: Payload,
    /// IDs of steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: &str, agent_type: &str, action: &str) -> Self {
        Self {
            id: id.to_string(),
            agent_type: agent_type.to_string(),
            action: action.to_string(),
            input: Payload::Null,
            depends_on: Vec::new(),
            priority: Priority::default(),
            timeout_secs: None,
        }
    }

    pub fn depends_on(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }
}

/// A named, parameterised set of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Passed to every step's task under the `parameters` metadata key.
    #[serde(default)]
    pub parameters: BTreeMap<String, Payload>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: &str, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            parameters: BTreeMap::new(),
            steps,
        }
    }

    /// Parse a JSON definition.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON definition from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Check structure and dependencies.
    pub fn validate(&self) -> Result<()> {
        self.step_graph().map(|_| ())
    }

    /// Steps ordered so every step comes after the steps it depends on.
    pub fn step_order(&self) -> Result<Vec<&WorkflowStep>> {
        let (graph, steps) = self.step_graph()?;
        let order = graph.topological_sort()?;
        Ok(order.iter().filter_map(|id| steps.get(id).copied()).collect())
    }

    /// Step IDs grouped into layers that can run in parallel.
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>> {
        let (graph, steps) = self.step_graph()?;
        let layers = graph.get_execution_layers()?;
        Ok(layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|id| steps.get(id).map(|s| s.id.clone()))
                    .collect()
            })
            .collect())
    }

    /// Validate and build a dependency graph with one node per step.
    fn step_graph(&self) -> Result<(DependencyGraph, HashMap<TaskId, &WorkflowStep>)> {
        if self.steps.is_empty() {
            return Err(invalid(format!("workflow '{}' has no steps", self.name)));
        }

        let mut ids: HashMap<&str, TaskId> = HashMap::new();
        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(invalid(format!("step {} has an empty id", i)));
            }
            if step.agent_type.trim().is_empty() {
                return Err(invalid(format!("step '{}' has an empty agent_type", step.id)));
            }
            if step.action.trim().is_empty() {
                return Err(invalid(format!("step '{}' has an empty action", step.id)));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
            ids.insert(step.id.as_str(), TaskId::new());
        }

        let mut graph = DependencyGraph::new();
        let mut steps = HashMap::new();
        for step in &self.steps {
            let node = ids[step.id.as_str()];
            graph.add_node(node);
            steps.insert(node, step);
        }

        for step in &self.steps {
            let node = ids[step.id.as_str()];
            for dep in &step.depends_on {
                let Some(&dep_node) = ids.get(dep.as_str()) else {
                    return Err(invalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                };
                if graph.add_dependency(node, dep_node).is_err() {
                    return Err(invalid(format!(
                        "dependency of step '{}' on '{}' creates a cycle",
                        step.id, dep
                    )));
                }
            }
        }

        Ok((graph, steps))
    }
}

fn invalid(message: String) -> Error {
    Error::Validation(message)
}

/// Mapping from step IDs to the tasks created for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowHandle {
    pub name: String,
    /// In submission order.
    tasks: Vec<(String, TaskId)>,
}

impl WorkflowHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: Vec::new(),
        }
    }

    pub fn insert(&mut self, step: &str, task_id: TaskId) {
        self.tasks.push((step.to_string(), task_id));
    }

    pub fn task_id(&self, step: &str) -> Option<TaskId> {
        self.tasks
            .iter()
            .find(|(s, _)| s == step)
            .map(|(_, id)| *id)
    }

    /// `(step id, task id)` pairs in submission order.
    pub fn tasks(&self) -> &[(String, TaskId)] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
