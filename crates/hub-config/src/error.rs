//! Error types for configuration loading

use hub_core::HubError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading daemon and engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file
    #[error("failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Failed to parse JSON
    #[error("failed to parse JSON in {path}: {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl From<ConfigError> for HubError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::ParseYaml { .. }
            | ConfigError::ParseJson { .. }
            | ConfigError::InvalidValue { .. } => HubError::InvalidArgument(e.to_string()),
            ConfigError::ReadFile { .. } | ConfigError::WriteFile { .. } => {
                HubError::Internal(e.to_string())
            }
        }
    }
}
