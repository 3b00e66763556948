use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::blackboard::{Blackboard, BlackboardConfig};
use crate::bus::{MessageBus, DEFAULT_HISTORY_CAPACITY};
use crate::core::TaskQueue;
use crate::orchestration::{Orchestrator, OrchestratorConfig};
use crate::{Error, Result};

/// Contents of `~/.hive/hive.toml`. Every field has a default, so a
/// partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorSection,
    pub bus: BusSection,
    pub blackboard: BlackboardSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_concurrent_agents: usize,
    pub default_timeout_secs: u64,
    pub max_retries: u32,
    /// Cap used by `Orchestrator::run_all`.
    pub max_iterations: usize,
    pub poll_interval_ms: u64,
    pub record_to_blackboard: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            max_concurrent_agents: defaults.max_concurrent_agents,
            default_timeout_secs: defaults.default_timeout.as_secs(),
            max_retries: defaults.max_retries,
            max_iterations: defaults.max_iterations,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            record_to_blackboard: defaults.record_to_blackboard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub history_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BlackboardSection {
    pub persistence: bool,
    /// Defaults to `~/.hive/blackboard.json`.
    pub persistence_path: Option<String>,
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn default_blackboard_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("blackboard.json"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Defaults when `path` does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(?config, "config loaded");
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            max_concurrent_agents: o.max_concurrent_agents,
            default_timeout: Duration::from_secs(o.default_timeout_secs),
            max_retries: o.max_retries,
            max_iterations: o.max_iterations,
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            record_to_blackboard: o.record_to_blackboard,
        }
    }

    pub fn blackboard_config(&self) -> Result<BlackboardConfig> {
        if !self.blackboard.persistence {
            return Ok(BlackboardConfig::default());
        }
        let path = match &self.blackboard.persistence_path {
            Some(p) => expand_tilde(p),
            None => Self::default_blackboard_path()?,
        };
        Ok(BlackboardConfig::persistent(path))
    }

    /// An orchestrator wired up from every section of this config.
    pub fn build_orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::with_parts(
            self.orchestrator_config(),
            Arc::new(TaskQueue::new()),
            Arc::new(MessageBus::with_history_capacity(self.bus.history_capacity)),
            Arc::new(Blackboard::open(self.blackboard_config()?)),
        ))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
