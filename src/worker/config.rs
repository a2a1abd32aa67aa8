use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{AgentConfig, WorkerSettings};

/// Configuration written into each sandbox during provisioning.
///
/// Paths are as seen from inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// IPC directory shared with the controller
    pub ipc_dir: PathBuf,

    /// Session data directory, the agent's working directory
    pub data_dir: PathBuf,

    /// Where agent session ids are persisted
    pub state_dir: PathBuf,

    /// Polling intervals
    #[serde(default)]
    pub timings: WorkerSettings,

    #[serde(default)]
    pub agent: AgentConfig,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read worker config: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse worker config: {}", path.display()))?;
        config.timings = config.timings.clamped();

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize worker config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = AgentConfig::default();
        agent.provider = "scripted".to_string();
        agent.scripted.reply = "four".to_string();
        let config = WorkerConfig {
            ipc_dir: PathBuf::from("/ipc"),
            data_dir: PathBuf::from("/data"),
            state_dir: PathBuf::from("/var/lib/agentbox"),
            timings: WorkerSettings::default(),
            agent,
        };
        let path = dir.path().join("worker.toml");
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = WorkerConfig::load(&path).unwrap();
        assert_eq!(loaded.ipc_dir, PathBuf::from("/ipc"));
        assert_eq!(loaded.agent.provider, "scripted");
        assert_eq!(loaded.agent.scripted.reply, "four");
        assert_eq!(loaded.timings.poll_interval_ms, 50);
    }

    #[test]
    fn test_minimal_worker_config() {
        let config: WorkerConfig =
            toml::from_str("ipc_dir = \"/ipc\"\ndata_dir = \"/data\"\nstate_dir = \"/state\"\n")
                .unwrap();
        assert_eq!(config.agent.provider, "claude");
        assert_eq!(config.timings.interrupt_poll_interval_ms, 200);
    }

    #[test]
    fn test_missing_config_file() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read worker config"));
    }
}
