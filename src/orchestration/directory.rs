//! Agent directory with load-aware selection.
//!
//! The `AgentDirectory` indexes registered agents by ID, by type and by
//! capability, tracks each agent's workload, and picks the least-loaded
//! agent for a task. Type and capability indices keep registration order
//! so that ties between equally loaded agents are deterministic.

use crate::agent::{AgentId, AgentSpec};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No tasks in flight.
    Idle,
    /// At least one task in flight.
    Busy,
    /// Taken out of rotation; never selected.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Directory record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Tasks currently dispatched to this agent.
    pub workload: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentInfo {
    fn new(spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            agent_id: spec.agent_id,
            agent_type: spec.agent_type,
            name: spec.name,
            capabilities: spec.capabilities,
            status: AgentStatus::Idle,
            workload: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            registered_at: now,
            last_active: now,
        }
    }

    /// Fraction of finished tasks that succeeded, 0.0 before any finish.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    pub fn is_available(&self) -> bool {
        self.status != AgentStatus::Offline
    }

    /// Recompute Idle/Busy from the workload. Offline is left alone.
    fn refresh_status(&mut self) {
        if self.status != AgentStatus::Offline {
            self.status = if self.workload == 0 {
                AgentStatus::Idle
            } else {
                AgentStatus::Busy
            };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DirectoryStats {
    pub total_agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub offline_agents: usize,
    pub total_agent_types: usize,
    pub total_capabilities: usize,
    pub total_tasks_processed: u64,
    pub total_tasks_completed: u64,
    pub system_success_rate: f64,
}

/// Registry of agents and their load.
///
/// Held behind `Arc<tokio::sync::RwLock<_>>` by the orchestrator.
#[derive(Debug, Default)]
pub struct AgentDirectory {
    /// Agents indexed by their ID.
    agents: HashMap<AgentId, AgentInfo>,
    /// Agent IDs per type, in registration order.
    by_type: HashMap<String, Vec<AgentId>>,
    /// Agent IDs per capability, in registration order.
    by_capability: HashMap<String, Vec<AgentId>>,
    /// Registration order across all agents.
    order: Vec<AgentId>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any existing record with the same ID.
    pub fn register(&mut self, spec: AgentSpec) -> AgentInfo {
        if self.agents.contains_key(&spec.agent_id) {
            warn!(agent = %spec.agent_id, "agent already registered, replacing record");
            self.remove_from_indices(&spec.agent_id);
        }

        let info = AgentInfo::new(spec);
        let id = info.agent_id.clone();
        self.by_type
            .entry(info.agent_type.clone())
            .or_default()
            .push(id.clone());
        for capability in &info.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .push(id.clone());
        }
        self.order.push(id.clone());
        self.agents.insert(id.clone(), info.clone());

        info!(agent = %id, agent_type = %info.agent_type, "agent registered");
        info
    }

    /// Remove an agent from every index.
    pub fn unregister(&mut self, id: &AgentId) -> Result<AgentInfo> {
        if !self.agents.contains_key(id) {
            return Err(Error::UnknownAgent(id.clone()));
        }
        let info = self.remove_from_indices(id);
        info!(agent = %id, "agent unregistered");
        info.ok_or_else(|| Error::UnknownAgent(id.clone()))
    }

    fn remove_from_indices(&mut self, id: &AgentId) -> Option<AgentInfo> {
        let info = self.agents.remove(id)?;

        if let Some(ids) = self.by_type.get_mut(&info.agent_type) {
            ids.retain(|a| a != id);
            if ids.is_empty() {
                self.by_type.remove(&info.agent_type);
            }
        }
        for capability in &info.capabilities {
            if let Some(ids) = self.by_capability.get_mut(capability) {
                ids.retain(|a| a != id);
                if ids.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
        self.order.retain(|a| a != id);
        Some(info)
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<&AgentInfo> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Agents of a type, in registration order.
    pub fn find_by_type(&self, agent_type: &str) -> Vec<&AgentInfo> {
        self.collect(self.by_type.get(agent_type))
    }

    /// Agents with a capability, in registration order.
    pub fn find_by_capability(&self, capability: &str) -> Vec<&AgentInfo> {
        self.collect(self.by_capability.get(capability))
    }

    fn collect(&self, ids: Option<&Vec<AgentId>>) -> Vec<&AgentInfo> {
        ids.map(|ids| ids.iter().filter_map(|id| self.agents.get(id)).collect())
            .unwrap_or_default()
    }

    /// All agents in registration order.
    pub fn all_agents(&self) -> Vec<&AgentInfo> {
        self.order.iter().filter_map(|id| self.agents.get(id)).collect()
    }

    pub fn agent_types(&self) -> BTreeSet<String> {
        self.by_type.keys().cloned().collect()
    }

    pub fn capabilities(&self) -> BTreeSet<String> {
        self.by_capability.keys().cloned().collect()
    }

    /// Pick the least-loaded agent matching every given filter.
    ///
    /// Offline agents are skipped. Ties go to the earliest registered agent.
    pub fn find_available_agent(
        &self,
        agent_type: Option<&str>,
        capability: Option<&str>,
    ) -> Option<&AgentInfo> {
        let candidates: Vec<&AgentInfo> = match (agent_type, capability) {
            (Some(t), _) => self.find_by_type(t),
            (None, Some(c)) => self.find_by_capability(c),
            (None, None) => self.all_agents(),
        };

        // min_by_key keeps the first of equal minima.
        let selected = candidates
            .into_iter()
            .filter(|a| a.is_available())
            .filter(|a| capability.map_or(true, |c| a.capabilities.contains(c)))
            .min_by_key(|a| a.workload);

        if selected.is_none() {
            debug!(?agent_type, ?capability, "no available agent");
        }
        selected
    }

    fn agent_mut(&mut self, id: &AgentId) -> Result<&mut AgentInfo> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAgent(id.clone()))
    }

    pub fn increment_agent_workload(&mut self, id: &AgentId) -> Result<u32> {
        let agent = self.agent_mut(id)?;
        agent.workload += 1;
        agent.last_active = Utc::now();
        agent.refresh_status();
        debug!(agent = %id, workload = agent.workload, "workload incremented");
        Ok(agent.workload)
    }

    /// Decrease the workload, never below zero.
    pub fn decrement_agent_workload(&mut self, id: &AgentId) -> Result<u32> {
        let agent = self.agent_mut(id)?;
        agent.workload = agent.workload.saturating_sub(1);
        agent.last_active = Utc::now();
        agent.refresh_status();
        debug!(agent = %id, workload = agent.workload, "workload decremented");
        Ok(agent.workload)
    }

    /// Count a finished task against the agent and release its slot.
    pub fn record_task_completion(&mut self, id: &AgentId, success: bool) -> Result<()> {
        let agent = self.agent_mut(id)?;
        if success {
            agent.tasks_completed += 1;
        } else {
            agent.tasks_failed += 1;
        }
        self.decrement_agent_workload(id)?;
        Ok(())
    }

    pub fn set_offline(&mut self, id: &AgentId) -> Result<()> {
        let agent = self.agent_mut(id)?;
        agent.status = AgentStatus::Offline;
        info!(agent = %id, "agent offline");
        Ok(())
    }

    pub fn set_online(&mut self, id: &AgentId) -> Result<()> {
        let agent = self.agent_mut(id)?;
        agent.status = AgentStatus::Idle;
        agent.refresh_status();
        info!(agent = %id, status = %agent.status, "agent online");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
        self.by_type.clear();
        self.by_capability.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> DirectoryStats {
        let count = |status: AgentStatus| self.agents.values().filter(|a| a.status == status).count();
        let completed: u64 = self.agents.values().map(|a| a.tasks_completed).sum();
        let failed: u64 = self.agents.values().map(|a| a.tasks_failed).sum();
        let processed = completed + failed;

        DirectoryStats {
            total_agents: self.agents.len(),
            idle_agents: count(AgentStatus::Idle),
            busy_agents: count(AgentStatus::Busy),
            offline_agents: count(AgentStatus::Offline),
            total_agent_types: self.by_type.len(),
            total_capabilities: self.by_capability.len(),
            total_tasks_processed: processed,
            total_tasks_completed: completed,
            system_success_rate: if processed > 0 {
                completed as f64 / processed as f64
            } else {
                0.0
            },
        }
    }
}
