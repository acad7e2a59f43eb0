//! Small key/value store for persistent variables and engine flags

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::StorageResult;

/// Durable key/value backend
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;

    async fn set(&self, key: &str, value: serde_json::Value) -> StorageResult<()>;

    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Every stored entry, ordered by key
    async fn entries(&self) -> StorageResult<Vec<(String, serde_json::Value)>>;
}

/// JSON file backend: the whole map is rewritten on every change
pub struct FileKvStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, serde_json::Value>>>,
}

impl FileKvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> StorageResult<BTreeMap<String, serde_json::Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_file(&self, map: &BTreeMap<String, serde_json::Value>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(map)?).await?;
        fs::rename(&temp_path, &self.path).await?;
        debug!(path = ?self.path, entries = map.len(), "Wrote key/value file");
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache.as_ref().and_then(|m| m.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        let mut cache = self.cache.lock().await;
        let mut map = match cache.take() {
            Some(map) => map,
            None => self.read_file().await?,
        };
        map.insert(key.to_string(), value);
        let result = self.write_file(&map).await;
        *cache = Some(map);
        result
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let mut cache = self.cache.lock().await;
        let mut map = match cache.take() {
            Some(map) => map,
            None => self.read_file().await?,
        };
        let existed = map.remove(key).is_some();
        let result = if existed {
            self.write_file(&map).await
        } else {
            Ok(())
        };
        *cache = Some(map);
        result
    }

    async fn entries(&self) -> StorageResult<Vec<(String, serde_json::Value)>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_file().await?);
        }
        Ok(cache
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// In-memory backend; writes can be made to fail for error-path tests
#[derive(Default)]
pub struct MemoryKvStore {
    map: Mutex<BTreeMap<String, serde_json::Value>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `set`/`remove` calls fail with an IO error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "write refused").into());
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        self.check_writable()?;
        self.map.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.map.lock().await.remove(key);
        Ok(())
    }

    async fn entries(&self) -> StorageResult<Vec<(String, serde_json::Value)>> {
        Ok(self
            .map
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
