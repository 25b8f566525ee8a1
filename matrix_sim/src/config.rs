//! Node configuration file (JSON).
//!
//! ```json
//! {
//!   "sandbox": { "max_memory_pages": 256, "max_fuel": 1000000 },
//!   "bus": { "queue_capacity": 100 },
//!   "storage": { "path": null },
//!   "simulation": { "seed": 42, "agents": 6, "steps": 50, "tick_rate_hz": 10 }
//! }
//! ```
//!
//! Missing sections fall back to their defaults.

use crate::world::SimConfig;
use matrix_core::{ResourceLimits, DEFAULT_QUEUE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub queue_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// sled directory; in-memory storage when absent
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub seed: u64,
    pub agents: usize,
    pub steps: u64,
    pub tick_rate_hz: u32,
}

impl Default for SimulationSection {
    fn default() -> Self {
        let sim = SimConfig::default();
        Self {
            seed: sim.seed,
            agents: sim.num_agents,
            steps: sim.num_steps,
            tick_rate_hz: sim.tick_rate_hz,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub sandbox: ResourceLimits,
    pub bus: BusSection,
    pub storage: StorageSection,
    pub simulation: SimulationSection,
}

impl NodeConfig {
    /// Reads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the default configuration to `path`.
    pub fn write_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(&NodeConfig::default())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Sandbox limits are checked first; nothing is built from an invalid file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sandbox
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.bus.queue_capacity == 0 {
            return Err(ConfigError::Invalid("bus.queue_capacity must be at least 1".into()));
        }
        if self.simulation.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("simulation.tick_rate_hz must be at least 1".into()));
        }
        Ok(())
    }

    pub fn to_sim_config(&self) -> SimConfig {
        SimConfig {
            seed: self.simulation.seed,
            num_agents: self.simulation.agents,
            num_steps: self.simulation.steps,
            tick_rate_hz: self.simulation.tick_rate_hz,
            queue_capacity: self.bus.queue_capacity,
            limits: self.sandbox,
            storage_path: self.storage.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("matrix-config-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_default_round_trips_through_file() {
        let path = temp_path("default");
        NodeConfig::write_default(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, NodeConfig::default());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "simulation": { "seed": 7 } }"#).unwrap();
        assert_eq!(config.simulation.seed, 7);
        assert_eq!(config.simulation.agents, SimConfig::default().num_agents);
        assert_eq!(config.sandbox, ResourceLimits::default());
        assert_eq!(config.bus.queue_capacity, 100);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let path = temp_path("invalid");
        fs::write(&path, r#"{ "sandbox": { "max_memory_pages": 0, "max_fuel": 10 } }"#).unwrap();
        let err = NodeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = NodeConfig::load(temp_path("missing-never-written")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_to_sim_config() {
        let mut config = NodeConfig::default();
        config.simulation.steps = 3;
        config.bus.queue_capacity = 8;
        let sim = config.to_sim_config();
        assert_eq!(sim.num_steps, 3);
        assert_eq!(sim.queue_capacity, 8);
        assert_eq!(sim.limits, config.sandbox);
    }
}
