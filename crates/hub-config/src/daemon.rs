//! Daemon configuration (`autohub.yaml`) and engine configuration
//! (`{config_dir}/automation.json`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Directory holding `automation.json` and the table files
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Directory holding `variables.json`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub http: HttpConfig,

    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Start the engine right after init
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Bearer tokens accepted for endpoints that require auth
    #[serde(default)]
    pub api_tokens: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("./config")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            data_dir: default_data_dir(),
            http: HttpConfig::default(),
            log_level: default_log_level(),
            auto_start: true,
            api_tokens: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load from a YAML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = ?path, "Daemon config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content, path)
    }

    pub fn from_yaml_str(content: &str, path: &Path) -> ConfigResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.http.enabled && self.http.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "http.bind".to_string(),
                reason: format!("'{}' is not a socket address", self.http.bind),
            });
        }
        Ok(())
    }

    /// Path of the key/value file for persistent variables
    pub fn variables_path(&self) -> PathBuf {
        self.data_dir.join("variables.json")
    }
}

/// Engine configuration stored as `automation.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Period of the background sweep over level-triggered rules
    #[serde(default = "default_eval_interval")]
    pub eval_interval_ms: u64,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_eval_interval() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            enabled: true,
            eval_interval_ms: default_eval_interval(),
        }
    }
}

pub const ENGINE_CONFIG_FILE: &str = "automation.json";

impl EngineConfig {
    /// Load `{config_dir}/automation.json`; a missing file yields the defaults
    pub async fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = config_dir.as_ref().join(ENGINE_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::ReadFile {
                path: path.clone(),
                source,
            })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::ParseJson { path, source })
    }

    pub async fn save(&self, config_dir: impl AsRef<Path>) -> ConfigResult<()> {
        let dir = config_dir.as_ref();
        let path = dir.join(ENGINE_CONFIG_FILE);
        let write_err = |source| ConfigError::WriteFile {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
        let content = serde_json::to_string_pretty(self).map_err(|source| {
            ConfigError::ParseJson {
                path: path.clone(),
                source,
            }
        })?;
        tokio::fs::write(&path, content).await.map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let config = HubConfig::load(temp_dir.path().join("autohub.yaml")).unwrap();
        assert_eq!(config.http.bind, "0.0.0.0:8080");
        assert!(config.auto_start);
        assert_eq!(config.config_dir, PathBuf::from("./config"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
config_dir: /etc/autohub
log_level: debug
auto_start: false
http:
  bind: 127.0.0.1:9000
api_tokens:
  - secret-token
"#;
        let config = HubConfig::from_yaml_str(yaml, Path::new("autohub.yaml")).unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/etc/autohub"));
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.log_level, "debug");
        assert!(!config.auto_start);
        assert!(config.http.enabled);
        assert_eq!(config.http.bind, "127.0.0.1:9000");
        assert_eq!(config.api_tokens, vec!["secret-token".to_string()]);
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let yaml = "http:\n  bind: not-an-address\n";
        let err = HubConfig::from_yaml_str(yaml, Path::new("autohub.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_engine_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(
            EngineConfig::load(temp_dir.path()).await.unwrap(),
            EngineConfig::default()
        );

        let config = EngineConfig {
            eval_interval_ms: 250,
            ..Default::default()
        };
        config.save(temp_dir.path()).await.unwrap();
        assert_eq!(EngineConfig::load(temp_dir.path()).await.unwrap(), config);
    }
}
