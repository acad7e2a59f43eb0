//! Source table and worker lifecycle
//!
//! The manager owns every [`SourceSlot`] and the worker task running it.
//! Callers only ever see copies ([`SourceSnapshot`]) or mutate through
//! [`SourceManager::with_source_mut`], which holds the slot's config lock.

use crate::error::{SourceError, SourceResult};
use crate::slot::SourceSlot;
use crate::source::{Mapping, Source, SourceKind, SourceSnapshot, KNOWN_FIELDS, MAX_MAPPINGS};
use crate::variable::precreate_bundle;
use crate::worker::{LocalApi, SshAccess, WorkerEnv, WorkerHandle};
use crate::{rest, variable};
use hub_config::{keys, warn_unknown_fields};
use hub_variables::VariableStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Most sources the table holds
pub const MAX_SOURCES: usize = 16;

/// How long a worker gets to exit before it is aborted
pub const WORKER_STOP_GRACE: Duration = Duration::from_secs(2);

/// Aggregate counters over every source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub total: usize,
    pub enabled: usize,
    pub connected: usize,
    pub workers: usize,
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub dropped_non_json: u64,
    pub truncated_strings: u64,
}

pub struct SourceManager {
    env: Arc<WorkerEnv>,
    slots: RwLock<Vec<Arc<SourceSlot>>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    running: AtomicBool,
}

impl SourceManager {
    pub fn new(vars: Arc<VariableStore>, ssh: SshAccess) -> Self {
        Self {
            env: Arc::new(WorkerEnv::new(vars, ssh)),
            slots: RwLock::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Install (or clear) the in-process API used by local REST sources
    pub fn set_local_api(&self, api: Option<Arc<dyn LocalApi>>) {
        self.env.set_local_api(api);
    }

    /// Shared HTTP client, also used by the proxy helpers
    pub fn http_client(&self) -> &reqwest::Client {
        &self.env.http
    }

    fn slots(&self) -> RwLockReadGuard<'_, Vec<Arc<SourceSlot>>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<SourceSlot>>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: &str) -> SourceResult<Arc<SourceSlot>> {
        self.slots()
            .iter()
            .find(|s| s.config().id == id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.slots().len()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.slot(id).is_ok()
    }

    /// Add a source; its worker starts right away when the manager runs
    #[instrument(skip(self, source), fields(source = %source.id, kind = source.type_name()))]
    pub fn add(&self, source: Source) -> SourceResult<()> {
        source.validate()?;
        let slot = {
            let mut slots = self.slots_mut();
            if slots.iter().any(|s| s.config().id == source.id) {
                return Err(SourceError::AlreadyExists(source.id));
            }
            if slots.len() >= MAX_SOURCES {
                return Err(SourceError::TableFull(MAX_SOURCES));
            }
            let slot = Arc::new(SourceSlot::new(source));
            slots.push(slot.clone());
            slot
        };

        self.prepare_variables(&slot);
        info!("Source added");
        if self.is_running() && slot.config().enabled {
            self.spawn_worker(&slot);
        }
        Ok(())
    }

    /// Pre-create the variables a command source writes
    fn prepare_variables(&self, slot: &SourceSlot) {
        let config = slot.config().clone();
        if let SourceKind::Variable(params) = &config.kind {
            if params.runs_command() {
                let created = precreate_bundle(config.var_prefix(), &config.id, &self.env.vars);
                debug!(source = %config.id, created, "Bundle variables ready");
            }
        }
    }

    fn spawn_worker(&self, slot: &Arc<SourceSlot>) {
        let id = slot.id();
        let handle = WorkerHandle::spawn(slot.clone(), self.env.clone());
        if let Some(old) = self.workers().insert(id.clone(), handle) {
            warn!(source = %id, "Replacing a worker that was still registered");
            tokio::spawn(old.stop(WORKER_STOP_GRACE));
        }
    }

    async fn stop_worker(&self, id: &str) {
        let handle = self.workers().remove(id);
        if let Some(handle) = handle {
            handle.stop(WORKER_STOP_GRACE).await;
            debug!(source = %id, "Worker stopped");
        }
    }

    /// Remove a source, its worker and every variable it owns
    pub async fn remove(&self, id: &str) -> SourceResult<usize> {
        self.remove_retaining(id, &HashSet::new()).await
    }

    /// Remove a source but keep the named variables it owns
    ///
    /// Returns the number of variables dropped.
    #[instrument(skip(self, keep))]
    pub async fn remove_retaining(&self, id: &str, keep: &HashSet<String>) -> SourceResult<usize> {
        {
            let mut slots = self.slots_mut();
            let pos = slots
                .iter()
                .position(|s| s.config().id == id)
                .ok_or_else(|| SourceError::NotFound(id.to_string()))?;
            slots.remove(pos);
        }
        self.stop_worker(id).await;

        let dropped = self
            .env
            .vars
            .unregister_where(|v| v.source_id.as_deref() == Some(id) && !keep.contains(&v.name));
        info!(dropped, retained = keep.len(), "Source removed");
        Ok(dropped)
    }

    pub fn enable(&self, id: &str) -> SourceResult<()> {
        let slot = self.slot(id)?;
        let was_enabled = std::mem::replace(&mut slot.config_mut().enabled, true);
        if !was_enabled {
            info!(source = %id, "Source enabled");
        }
        if self.is_running() && !self.workers().contains_key(id) {
            self.spawn_worker(&slot);
        }
        Ok(())
    }

    pub async fn disable(&self, id: &str) -> SourceResult<()> {
        let slot = self.slot(id)?;
        slot.config_mut().enabled = false;
        self.stop_worker(id).await;
        info!(source = %id, "Source disabled");
        Ok(())
    }

    /// Copy of one source with its runtime record
    pub fn get_copy(&self, id: &str) -> SourceResult<SourceSnapshot> {
        Ok(self.slot(id)?.snapshot())
    }

    pub fn get_by_index_copy(&self, index: usize) -> Option<SourceSnapshot> {
        self.slots().get(index).map(|s| s.snapshot())
    }

    /// Every source in insertion order
    pub fn list(&self) -> Vec<SourceSnapshot> {
        self.slots().iter().map(|s| s.snapshot()).collect()
    }

    /// Configurations only, as they are saved
    pub fn configs(&self) -> Vec<Source> {
        self.slots().iter().map(|s| s.config().clone()).collect()
    }

    #[instrument(skip(self, mapping), fields(path = %mapping.json_path, var = %mapping.var_name))]
    pub fn add_mapping(&self, id: &str, mapping: Mapping) -> SourceResult<()> {
        mapping.validate()?;
        let slot = self.slot(id)?;
        let mut config = slot.config_mut();
        if config.mappings.len() >= MAX_MAPPINGS {
            return Err(SourceError::TableFull(MAX_MAPPINGS));
        }
        if let Some(m) = config
            .mappings
            .iter()
            .find(|m| m.json_path == mapping.json_path || m.var_name == mapping.var_name)
        {
            return Err(SourceError::MappingConflict(format!(
                "{} -> {}",
                m.json_path, m.var_name
            )));
        }
        config.mappings.push(mapping);
        Ok(())
    }

    /// Remove the mapping matching `key` by path or by variable name
    pub fn remove_mapping(&self, id: &str, key: &str) -> SourceResult<Mapping> {
        let slot = self.slot(id)?;
        let mut config = slot.config_mut();
        let pos = config
            .mappings
            .iter()
            .position(|m| m.json_path == key || m.var_name == key)
            .ok_or_else(|| SourceError::MappingNotFound(key.to_string()))?;
        Ok(config.mappings.remove(pos))
    }

    /// Mutate a source under its lock
    ///
    /// The edited configuration is validated; on failure the previous one is
    /// restored. A change of kind or connection parameters restarts the
    /// worker.
    pub async fn with_source_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Source) -> R,
    ) -> SourceResult<R> {
        let slot = self.slot(id)?;
        let (result, restart) = {
            let mut config = slot.config_mut();
            let before = config.clone();
            let result = f(&mut config);
            config.id = before.id.clone();
            if let Err(e) = config.validate() {
                *config = before;
                return Err(e);
            }
            let restart = config.kind != before.kind || config.enabled != before.enabled;
            (result, restart)
        };

        if restart {
            self.stop_worker(id).await;
            slot.reset_connection();
            self.prepare_variables(&slot);
            if self.is_running() && slot.config().enabled {
                self.spawn_worker(&slot);
            }
        }
        Ok(result)
    }

    /// Spawn a worker for every enabled source
    pub fn start_all(&self) -> usize {
        self.running.store(true, Ordering::SeqCst);
        let slots: Vec<_> = self.slots().clone();
        let mut started = 0;
        for slot in slots {
            let id = slot.id();
            if !slot.config().enabled || self.workers().contains_key(&id) {
                continue;
            }
            self.spawn_worker(&slot);
            started += 1;
        }
        info!(started, "Source workers started");
        started
    }

    /// Stop every worker, waiting for them concurrently
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<_> = self.workers().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        futures_util::future::join_all(handles.into_iter().map(|h| h.stop(WORKER_STOP_GRACE))).await;
        info!(count, "Source workers stopped");
    }

    /// Poll a REST or command source immediately, outside its schedule
    pub async fn poll_now(&self, id: &str) -> SourceResult<SourceSnapshot> {
        let slot = self.slot(id)?;
        let kind = slot.config().type_name();
        match kind {
            "rest" => rest::poll_once(&slot, &self.env).await?,
            "variable" => variable::poll_once(&slot, &self.env).await?,
            other => return Err(SourceError::NotPollable(other)),
        }
        Ok(slot.snapshot())
    }

    pub fn stats(&self) -> SourceStats {
        let slots = self.slots();
        let mut stats = SourceStats {
            total: slots.len(),
            workers: self.workers().values().filter(|w| !w.is_finished()).count(),
            ..Default::default()
        };
        for slot in slots.iter() {
            if slot.config().enabled {
                stats.enabled += 1;
            }
            let rt = slot.runtime();
            if rt.connected {
                stats.connected += 1;
            }
            stats.messages += rt.messages;
            stats.errors += rt.errors;
            stats.reconnects += rt.reconnects;
            stats.dropped_non_json += rt.dropped_non_json;
            stats.truncated_strings += rt.truncated_strings;
        }
        stats
    }

    /// Add sources from stored table entries
    ///
    /// Entries that fail to parse or collide are skipped with a warning.
    /// Returns how many were added.
    pub fn load(&self, entries: &[serde_json::Value]) -> usize {
        let mut loaded = 0;
        for entry in entries {
            warn_unknown_fields(keys::SOURCES, entry, KNOWN_FIELDS);
            let result = Source::from_json(entry).and_then(|s| self.add(s));
            match result {
                Ok(()) => loaded += 1,
                Err(e) => {
                    let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                    warn!(source = %id, error = %e, "Skipping stored source");
                }
            }
        }
        loaded
    }
}
