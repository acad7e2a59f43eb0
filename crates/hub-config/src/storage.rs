//! Versioned JSON table files
//!
//! Sources, rules, action templates and SSH registries are persisted as
//! `{config_dir}/{key}.json` in the wrapper format below. Hand-written files
//! may also hold a bare JSON array.

use hub_core::HubError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage file {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },

    #[error("Version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

impl From<StorageError> for HubError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(_) => HubError::Internal(e.to_string()),
            _ => HubError::InvalidArgument(e.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "minor_version": 1,
///   "key": "rules",
///   "data": [ ... ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version - breaking changes
    pub version: u32,
    /// Minor version - additive changes
    #[serde(default)]
    pub minor_version: u32,
    /// Storage key (file identifier)
    #[serde(default)]
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Table keys used by the engine
pub mod keys {
    pub const SOURCES: &str = "sources";
    pub const RULES: &str = "rules";
    pub const ACTIONS: &str = "actions";
    pub const SSH_HOSTS: &str = "ssh_hosts";
    pub const SSH_COMMANDS: &str = "ssh_commands";
}

/// Current major version of every table file
pub const TABLE_VERSION: u32 = 1;
pub const TABLE_MINOR_VERSION: u32 = 1;

/// Storage manager for the config directory
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            debug!("Created storage directory: {:?}", self.dir);
        }
        Ok(())
    }

    /// File path for a storage key
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    /// Load the raw entries of a table
    ///
    /// A missing file is an empty table. Both the versioned wrapper and a
    /// bare array are accepted.
    pub async fn load_table(&self, key: &str) -> StorageResult<Vec<serde_json::Value>> {
        let path = self.file_path(key);
        if !path.exists() {
            debug!("Storage file not found: {}", key);
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let raw: serde_json::Value = serde_json::from_str(&content)?;

        let data = match raw {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut obj) => {
                let version = obj.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                if version > TABLE_VERSION {
                    return Err(StorageError::VersionMismatch {
                        key: key.to_string(),
                        expected: TABLE_VERSION,
                        found: version,
                    });
                }
                match obj.remove("data") {
                    Some(serde_json::Value::Array(items)) => items,
                    Some(serde_json::Value::Null) | None => Vec::new(),
                    Some(_) => {
                        return Err(StorageError::Malformed {
                            key: key.to_string(),
                            reason: "'data' is not an array".to_string(),
                        })
                    }
                }
            }
            _ => {
                return Err(StorageError::Malformed {
                    key: key.to_string(),
                    reason: "expected an object or array".to_string(),
                })
            }
        };

        debug!("Loaded storage file: {} ({} entries)", key, data.len());
        Ok(data)
    }

    /// Save a table
    ///
    /// Writes atomically by first writing to a temp file, then renaming.
    pub async fn save_table<T: Serialize>(&self, key: &str, data: &[T]) -> StorageResult<()> {
        self.ensure_dir().await?;

        let file = StorageFile::new(key, data, TABLE_VERSION, TABLE_MINOR_VERSION);
        let path = self.file_path(key);
        let temp_path = self.dir.join(format!("{}.json.tmp", key));

        let content = serde_json::to_string_pretty(&file)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!("Saved storage file: {} ({} entries)", key, data.len());
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_path(key);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!("Deleted storage file: {}", key);
        }
        Ok(())
    }
}

/// Log the top-level fields of a table entry that the loader does not know
///
/// Returns the unknown field names.
pub fn warn_unknown_fields(table: &str, entry: &serde_json::Value, known: &[&str]) -> Vec<String> {
    let Some(obj) = entry.as_object() else {
        return Vec::new();
    };
    let unknown: Vec<String> = obj
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        let id = obj.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        warn!(table, id, fields = ?unknown, "Ignoring unknown fields");
    }
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: String,
        value: i32,
    }

    #[tokio::test]
    async fn test_save_and_load_table() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());

        let rows = vec![
            Row { id: "a".into(), value: 1 },
            Row { id: "b".into(), value: 2 },
        ];
        storage.save_table(keys::RULES, &rows).await.unwrap();
        assert!(storage.exists(keys::RULES).await);

        let loaded = storage.load_table(keys::RULES).await.unwrap();
        let parsed: Vec<Row> = loaded
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(parsed, rows);

        let text = std::fs::read_to_string(storage.file_path(keys::RULES)).unwrap();
        let wrapper: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(wrapper["version"], TABLE_VERSION);
        assert_eq!(wrapper["key"], "rules");
    }

    #[tokio::test]
    async fn test_missing_table_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        assert!(storage.load_table(keys::SOURCES).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bare_array_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        std::fs::write(
            storage.file_path(keys::ACTIONS),
            r#"[{"id": "tpl1"}, {"id": "tpl2"}]"#,
        )
        .unwrap();

        let loaded = storage.load_table(keys::ACTIONS).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1]["id"], "tpl2");
    }

    #[tokio::test]
    async fn test_newer_major_version_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        std::fs::write(
            storage.file_path(keys::RULES),
            r#"{"version": 9, "minor_version": 0, "key": "rules", "data": []}"#,
        )
        .unwrap();

        let err = storage.load_table(keys::RULES).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionMismatch { found: 9, .. }));
    }

    #[tokio::test]
    async fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage.save_table::<Row>(keys::SSH_HOSTS, &[]).await.unwrap();
        storage.delete(keys::SSH_HOSTS).await.unwrap();
        assert!(!storage.exists(keys::SSH_HOSTS).await);
    }

    #[test]
    fn test_warn_unknown_fields() {
        let entry = json!({"id": "r1", "name": "x", "colour": "red"});
        let unknown = warn_unknown_fields("rules", &entry, &["id", "name"]);
        assert_eq!(unknown, vec!["colour".to_string()]);
    }
}
