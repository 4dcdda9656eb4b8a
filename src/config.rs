use crate::cascade::RetryLevelOptions;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration, stored as TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Primary topic the service consumes
    pub topic: String,
    /// Consumer group id
    pub group_id: String,
    /// Number of retry levels before dead-lettering
    pub retry_levels: usize,
    /// Per-level publish timeout in milliseconds, level 1 first
    pub timeout_limit_ms: Vec<u64>,
    /// Per-level batch size hint, level 1 first
    pub batch_limit: Vec<u32>,
    /// Let the in-memory broker create topics on first send
    pub auto_create_topics: bool,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            topic: "cascade".to_string(),
            group_id: "cascade-group".to_string(),
            retry_levels: 3,
            timeout_limit_ms: Vec::new(),
            batch_limit: Vec::new(),
            auto_create_topics: false,
        }
    }
}

impl CascadeConfig {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "cascade", "cascade")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file: {}", path.display()))
    }

    /// Load configuration from the default file, creating it if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        let config_file = Self::default_config_file()?;

        if config_file.exists() {
            Self::load(&config_file)
        } else {
            let config = CascadeConfig::default();
            config.save(&config_file)?;
            Ok(config)
        }
    }

    /// Per-level options built from the timeout and batch lists
    pub fn level_options(&self) -> RetryLevelOptions {
        RetryLevelOptions::new(
            self.timeout_limit_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            self.batch_limit.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = CascadeConfig {
            topic: "orders".to_string(),
            retry_levels: 2,
            timeout_limit_ms: vec![100, 250],
            ..CascadeConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(CascadeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "topic = \"payments\"\n").unwrap();
        let config = CascadeConfig::load(&path).unwrap();
        assert_eq!(config.topic, "payments");
        assert_eq!(config.retry_levels, 3);
        assert_eq!(config.group_id, "cascade-group");
    }

    #[test]
    fn test_invalid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retry_levels = \"many\"").unwrap();
        assert!(CascadeConfig::load(&path).is_err());
    }

    #[test]
    fn test_level_options() {
        let config = CascadeConfig {
            timeout_limit_ms: vec![1500],
            batch_limit: vec![20, 5],
            ..CascadeConfig::default()
        };
        let options = config.level_options();
        assert_eq!(options.for_level(1).timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.for_level(2).batch_limit, Some(5));
    }
}
