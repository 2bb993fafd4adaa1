//! Sprocket Configuration
//!
//! TOML configuration loading with defaults for every field.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_binary")]
    pub binary: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            timeout_secs: default_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

fn default_tool_binary() -> String {
    "sproc".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_output_chars() -> usize {
    3500
}

fn default_history_capacity() -> usize {
    16
}

impl Config {
    /// Load the config file, or defaults when no file exists at the
    /// resolved path.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.core.data_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => dirs::home_dir()
                .map(|home| home.join(".sprocket"))
                .ok_or_else(|| anyhow!("home directory not found")),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".sprocket").join("config.toml"))
        .ok_or_else(|| anyhow!("home directory not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.tool.binary, "sproc");
        assert_eq!(config.tool.timeout_secs, 60);
        assert_eq!(config.tool.max_output_chars, 3500);
        assert_eq!(config.history.capacity, 16);
        assert!(config.core.data_dir.is_none());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [tool]
            binary = "/opt/tools/sproc"

            [core]
            log_level = "debug"
            "#,
        )
        .expect("parse");

        assert_eq!(config.tool.binary, "/opt/tools/sproc");
        assert_eq!(config.tool.timeout_secs, 60);
        assert_eq!(config.history.capacity, 16);
        assert_eq!(config.core.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("sprocket-config-no-such-file.toml");
        let config = Config::load(Some(&path)).expect("load");
        assert_eq!(config.tool.binary, "sproc");
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config: Config = toml::from_str(
            r#"
            [core]
            data_dir = "/var/lib/sprocket"
            "#,
        )
        .expect("parse");
        assert_eq!(
            config.data_dir().expect("data dir"),
            PathBuf::from("/var/lib/sprocket")
        );
    }
}
