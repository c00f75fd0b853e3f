// Configuration management for the ReliefMesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/reliefmesh/config.json
// - Linux: ~/.config/reliefmesh/config.json
// - Windows: %APPDATA%\reliefmesh\config.json

use anyhow::{Context, Result};
use reliefmesh_core::MeshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage path for identity, queue and sessions
    pub storage_path: Option<String>,

    /// Optional JSON file with mesh tuning (rate limits, scheduler, queue)
    pub mesh_config_path: Option<String>,

    /// Log filter used when RUST_LOG is unset
    pub log_level: String,

    /// Simulator defaults
    pub simulate: SimulateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Nodes in the simulated chain
    pub nodes: usize,

    /// Battery level reported by every simulated node
    pub battery: u8,

    /// Rounds before the simulation gives up
    pub max_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: None,
            mesh_config_path: None,
            log_level: "warn".to_string(),
            simulate: SimulateConfig::default(),
        }
    }
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            battery: 80,
            max_rounds: 40,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("reliefmesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("reliefmesh");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform location, creating the default if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the platform location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the sled database lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    /// Mesh tuning: the referenced JSON file, or defaults
    pub fn mesh_config(&self) -> Result<MeshConfig> {
        match &self.mesh_config_path {
            Some(path) => MeshConfig::load(path)
                .with_context(|| format!("Failed to load mesh config from {}", path)),
            None => Ok(MeshConfig::default()),
        }
    }

    /// Set a config value (does not save)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "mesh_config_path" => {
                self.mesh_config_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "log_level" => {
                tracing_subscriber::EnvFilter::try_new(value).context("Invalid log filter")?;
                self.log_level = value.to_string();
            }
            "simulate.nodes" => {
                let nodes: usize = value.parse().context("Invalid number")?;
                if !(2..=64).contains(&nodes) {
                    anyhow::bail!("simulate.nodes must be between 2 and 64");
                }
                self.simulate.nodes = nodes;
            }
            "simulate.battery" => {
                let battery: u8 = value.parse().context("Invalid battery percentage")?;
                if battery > 100 {
                    anyhow::bail!("simulate.battery must be at most 100");
                }
                self.simulate.battery = battery;
            }
            "simulate.max_rounds" => {
                self.simulate.max_rounds = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "storage_path" => self.storage_path.clone(),
            "mesh_config_path" => self.mesh_config_path.clone(),
            "log_level" => Some(self.log_level.clone()),
            "simulate.nodes" => Some(self.simulate.nodes.to_string()),
            "simulate.battery" => Some(self.simulate.battery.to_string()),
            "simulate.max_rounds" => Some(self.simulate.max_rounds.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "mesh_config_path".to_string(),
                self.mesh_config_path.clone().unwrap_or_else(|| "(defaults)".to_string()),
            ),
            ("log_level".to_string(), self.log_level.clone()),
            ("simulate.nodes".to_string(), self.simulate.nodes.to_string()),
            ("simulate.battery".to_string(), format!("{}%", self.simulate.battery)),
            ("simulate.max_rounds".to_string(), self.simulate.max_rounds.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.simulate.nodes, 5);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("simulate.battery", "7").unwrap();
        assert_eq!(config.get("simulate.battery").as_deref(), Some("7"));

        config.set("storage_path", "/tmp/mesh").unwrap();
        assert_eq!(config.storage_dir().unwrap(), PathBuf::from("/tmp/mesh"));
        config.set("storage_path", "").unwrap();
        assert!(config.get("storage_path").is_none());

        assert!(config.set("simulate.battery", "140").is_err());
        assert!(config.set("simulate.nodes", "1").is_err());
        assert!(config.set("listen_port", "9000").is_err());
    }

    #[test]
    fn test_load_creates_default_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        config.set("log_level", "reliefmesh_core=debug").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.log_level, "reliefmesh_core=debug");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"simulate": {"nodes": 9}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.simulate.nodes, 9);
        assert_eq!(config.simulate.battery, 80);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_mesh_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mesh_path = dir.path().join("mesh.json");
        std::fs::write(&mesh_path, r#"{"queue": {"max_entries": 50}}"#).unwrap();

        let mut config = Config::default();
        config
            .set("mesh_config_path", mesh_path.to_str().unwrap())
            .unwrap();
        assert_eq!(config.mesh_config().unwrap().queue.max_entries, 50);
    }
}
