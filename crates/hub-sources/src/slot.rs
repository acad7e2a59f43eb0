//! One source's configuration and runtime record behind their locks
//!
//! Workers hold an `Arc<SourceSlot>` and only ever touch their own slot.

use crate::error::SourceError;
use crate::mapping::{apply_mappings, MappingOutcome};
use crate::source::{Source, SourceRuntime, SourceSnapshot, SourceState};
use chrono::Utc;
use hub_core::path;
use hub_variables::VariableStore;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub(crate) struct SourceSlot {
    config: RwLock<Source>,
    runtime: Mutex<SourceRuntime>,
}

impl SourceSlot {
    pub(crate) fn new(config: Source) -> Self {
        Self {
            config: RwLock::new(config),
            runtime: Mutex::new(SourceRuntime::default()),
        }
    }

    pub(crate) fn config(&self) -> RwLockReadGuard<'_, Source> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config_mut(&self) -> RwLockWriteGuard<'_, Source> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, SourceRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> String {
        self.config().id.clone()
    }

    pub(crate) fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            config: self.config().clone(),
            runtime: self.runtime().clone(),
        }
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        let mut rt = self.runtime();
        rt.state = state;
        rt.connected = state == SourceState::Connected;
    }

    pub(crate) fn mark_connected(&self) {
        let id = self.id();
        let mut rt = self.runtime();
        if !rt.connected {
            info!(source = %id, "Source connected");
        }
        rt.state = SourceState::Connected;
        rt.connected = true;
        rt.last_error = None;
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut rt = self.runtime();
        rt.state = SourceState::Disconnected;
        rt.connected = false;
    }

    pub(crate) fn mark_failed(&self, err: &SourceError) {
        let id = self.id();
        let mut rt = self.runtime();
        warn!(source = %id, error = %err, "Source error");
        rt.state = SourceState::Error;
        rt.connected = false;
        rt.errors += 1;
        if matches!(err, SourceError::NotJson(_)) {
            rt.dropped_non_json += 1;
        }
        rt.last_error = Some(err.to_string());
    }

    pub(crate) fn count_reconnect(&self) {
        self.runtime().reconnects += 1;
    }

    pub(crate) fn count_non_json(&self) {
        self.runtime().dropped_non_json += 1;
    }

    /// Store a value produced without the mapping engine
    pub(crate) fn record_value(&self, last_value: serde_json::Value) {
        let mut rt = self.runtime();
        rt.messages += 1;
        rt.last_value = Some(last_value);
        rt.last_update_ms = Utc::now().timestamp_millis();
    }

    /// Run the mapping engine over one accepted payload
    ///
    /// `last_value` is what the source reports as its latest value; it is
    /// usually the payload itself.
    pub(crate) fn ingest(
        &self,
        payload: &serde_json::Value,
        last_value: serde_json::Value,
        vars: &VariableStore,
    ) -> MappingOutcome {
        let (id, mappings, auto_discover) = {
            let c = self.config();
            (c.id.clone(), c.mappings.clone(), c.auto_discover)
        };

        let outcome = apply_mappings(&id, &mappings, payload, vars);
        trace!(source = %id, applied = outcome.applied, changed = outcome.changed, "Payload ingested");

        let mut rt = self.runtime();
        rt.messages += 1;
        rt.last_value = Some(last_value);
        rt.last_update_ms = Utc::now().timestamp_millis();
        rt.truncated_strings += outcome.truncated as u64;
        rt.errors += outcome.errors as u64;
        if auto_discover && mappings.is_empty() && rt.discovered.is_none() {
            let entries = path::enumerate(payload);
            debug!(source = %id, paths = entries.len(), "Discovered payload shape");
            rt.discovered = Some(entries);
        }
        outcome
    }

    /// Parse a text frame and ingest it, counting non-JSON frames
    pub(crate) fn ingest_text(&self, text: &str, vars: &VariableStore) -> Option<MappingOutcome> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(payload) => {
                let last = payload.clone();
                Some(self.ingest(&payload, last, vars))
            }
            Err(e) => {
                trace!(error = %e, "Dropping non-JSON frame");
                self.count_non_json();
                None
            }
        }
    }

    pub(crate) fn reset_connection(&self) {
        let mut rt = self.runtime();
        rt.state = SourceState::Idle;
        rt.connected = false;
    }
}
