//! Configuration and persistence for the automation hub
//!
//! - [`HubConfig`]: daemon settings loaded from `autohub.yaml`
//! - [`EngineConfig`]: `{config_dir}/automation.json`
//! - [`Storage`]: versioned JSON tables (`sources.json`, `rules.json`,
//!   `actions.json`, `ssh_hosts.json`, `ssh_commands.json`)
//! - [`KvStore`]: key/value backend for persistent variables

mod daemon;
mod error;
mod kv;
pub mod storage;

pub use daemon::{EngineConfig, HttpConfig, HubConfig, ENGINE_CONFIG_FILE};
pub use error::{ConfigError, ConfigResult};
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use storage::{keys, warn_unknown_fields, Storage, StorageError, StorageFile, StorageResult};
