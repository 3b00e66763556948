//! Agent identity and registration records.
//!
//! Agents are addressed by string IDs so that sentinels such as the
//! orchestrator and the broadcast address live in the same namespace as
//! generated worker IDs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

const ORCHESTRATOR: &str = "orchestrator";
const BROADCAST: &str = "broadcast";

/// Unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Generate a new UUID-based agent identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The address the orchestrator receives replies on.
    pub fn orchestrator() -> Self {
        Self(ORCHESTRATOR.to_string())
    }

    /// The sentinel receiver for broadcast messages.
    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registration record for an agent: who it is and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: AgentId,
    /// Capability selector matched against `Task::agent_type`.
    pub agent_type: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
}

impl AgentSpec {
    /// Create a spec with a generated ID and the type doubling as the name.
    pub fn new(agent_type: &str) -> Self {
        Self {
            agent_id: AgentId::generate(),
            agent_type: agent_type.to_string(),
            name: agent_type.to_string(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.agent_id = id.into();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}
