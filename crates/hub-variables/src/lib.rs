//! Observable typed variable store
//!
//! The [`VariableStore`] is the single source of truth consumed by rules.
//! Sources, actions and the RPC layer write into it; every registration,
//! change and removal is announced on the event bus.
//!
//! Writers never call observers directly. A change is queued while the
//! store's write lock is held, which fixes its order relative to other
//! writes of the same variable, and a dedicated notifier task fires it on
//! the bus after the lock has been released.

mod persist;
mod variable;

pub use variable::{
    IterCursor, UpsertOutcome, Variable, VariableError, VariableFlags, VariableResult,
    VariableStoreStats,
};

use chrono::Utc;
use hub_config::KvStore;
use hub_core::events::{VariableChangedData, VariableCreatedData, VariableRemovedData};
use hub_core::{prefix_of, Context, Value, VariableName};
use hub_event_bus::EventBus;
use persist::Persister;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

enum Notification {
    Created(VariableCreatedData, Context),
    Changed(VariableChangedData, Context),
    Removed(VariableRemovedData, Context),
}

pub struct VariableStore {
    vars: RwLock<BTreeMap<String, Variable>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    persister: Arc<Persister>,
    event_bus: Arc<EventBus>,
    events_emitted: AtomicU64,
}

impl VariableStore {
    /// Create a store and spawn its notifier and persister tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(event_bus: Arc<EventBus>, kv: Arc<dyn KvStore>) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let persister = Persister::new(kv);

        tokio::spawn(run_notifier(notify_rx, event_bus.clone()));
        tokio::spawn(persister.clone().run());

        Arc::new(Self {
            vars: RwLock::new(BTreeMap::new()),
            notify_tx,
            persister,
            event_bus,
            events_emitted: AtomicU64::new(0),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Variable>> {
        self.vars.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Variable>> {
        self.vars.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, n: Notification) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        // The notifier only stops when the store is dropped
        let _ = self.notify_tx.send(n);
    }

    /// Register a new variable
    ///
    /// The owning source defaults to the dot prefix of the name. A
    /// PERSISTENT variable's initial value is queued for the key/value store.
    #[instrument(skip(self, var), fields(name = %var.name))]
    pub fn register(&self, var: Variable) -> VariableResult<()> {
        self.insert_new(var, true)
    }

    fn insert_new(&self, mut var: Variable, persist: bool) -> VariableResult<()> {
        VariableName::validate(&var.name).map_err(|source| VariableError::InvalidName {
            name: var.name.clone(),
            source,
        })?;
        if var.source_id.is_none() {
            var.source_id = prefix_of(&var.name).map(str::to_string);
        }
        var.value = normalize(var.value);

        let mut vars = self.write();
        if vars.contains_key(&var.name) {
            return Err(VariableError::AlreadyExists(var.name));
        }
        debug!(value = %var.value, source_id = ?var.source_id, "Registering variable");

        self.notify(Notification::Created(
            VariableCreatedData {
                name: var.name.clone(),
                value: var.value.clone(),
                source_id: var.source_id.clone(),
            },
            Context::new(),
        ));
        if persist && var.flags.persistent {
            self.persister.enqueue(&var.name, Some(var.value.to_json()));
        }
        vars.insert(var.name.clone(), var);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, name: &str) -> VariableResult<Variable> {
        let mut vars = self.write();
        let var = vars
            .remove(name)
            .ok_or_else(|| VariableError::NotFound(name.to_string()))?;
        self.announce_removed(&var);
        Ok(var)
    }

    /// Remove every variable owned by a source, returning how many went
    pub fn unregister_by_source(&self, source_id: &str) -> usize {
        self.unregister_where(|v| v.source_id.as_deref() == Some(source_id))
    }

    /// Remove every variable matching `pred`
    pub fn unregister_where(&self, pred: impl Fn(&Variable) -> bool) -> usize {
        let mut vars = self.write();
        let names: Vec<String> = vars
            .values()
            .filter(|v| pred(v))
            .map(|v| v.name.clone())
            .collect();
        for name in &names {
            if let Some(var) = vars.remove(name) {
                self.announce_removed(&var);
            }
        }
        if !names.is_empty() {
            info!(count = names.len(), "Unregistered variables");
        }
        names.len()
    }

    fn announce_removed(&self, var: &Variable) {
        if var.flags.persistent {
            self.persister.enqueue(&var.name, None);
        }
        self.notify(Notification::Removed(
            VariableRemovedData {
                name: var.name.clone(),
                last_value: var.value.clone(),
                source_id: var.source_id.clone(),
            },
            Context::new(),
        ));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> VariableResult<Value> {
        self.read()
            .get(name)
            .map(|v| v.value.clone())
            .ok_or_else(|| VariableError::NotFound(name.to_string()))
    }

    pub fn get_variable(&self, name: &str) -> VariableResult<Variable> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| VariableError::NotFound(name.to_string()))
    }

    /// Strict write to an existing variable
    ///
    /// Returns whether the value changed. READONLY variables only accept
    /// writes whose context names their owning source.
    #[instrument(skip(self, value, ctx), fields(source = ?ctx.source_id))]
    pub fn set(&self, name: &str, value: impl Into<Value>, ctx: Context) -> VariableResult<bool> {
        self.write_existing(name, value.into(), ctx, false, false)
    }

    /// Write that bypasses READONLY, used by engine internals
    pub fn set_internal(&self, name: &str, value: impl Into<Value>) -> VariableResult<bool> {
        self.write_existing(name, value.into(), Context::new(), true, false)
    }

    /// Write, registering the variable first when it does not exist
    ///
    /// A write that changes the variant retypes the variable instead of
    /// failing.
    #[instrument(skip(self, value, ctx), fields(source = ?ctx.source_id))]
    pub fn upsert(
        &self,
        name: &str,
        value: impl Into<Value>,
        ctx: Context,
    ) -> VariableResult<UpsertOutcome> {
        let value = value.into();
        if !self.exists(name) {
            let mut var = Variable::new(name, value.clone());
            var.source_id = ctx
                .source_id
                .clone()
                .or_else(|| prefix_of(name).map(str::to_string));
            var.last_update_ms = Utc::now().timestamp_millis();
            match self.register(var) {
                Ok(()) => {
                    return Ok(UpsertOutcome {
                        created: true,
                        changed: true,
                    })
                }
                // Lost a race with another writer; fall through to a write
                Err(VariableError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let changed = self.write_existing(name, value, ctx, false, true)?;
        Ok(UpsertOutcome {
            created: false,
            changed,
        })
    }

    fn write_existing(
        &self,
        name: &str,
        value: Value,
        ctx: Context,
        internal: bool,
        retype: bool,
    ) -> VariableResult<bool> {
        let value = normalize(value);
        let mut vars = self.write();
        let var = vars
            .get_mut(name)
            .ok_or_else(|| VariableError::NotFound(name.to_string()))?;

        if var.flags.readonly && !internal {
            let owner_ok = var
                .source_id
                .as_deref()
                .map(|s| ctx.is_source(s))
                .unwrap_or(false);
            if !owner_ok {
                return Err(VariableError::ReadOnly(name.to_string()));
            }
        }

        if !var.value.accepts(&value) {
            if !retype {
                return Err(VariableError::TypeMismatch {
                    name: name.to_string(),
                    expected: var.value.type_name(),
                    found: value.type_name(),
                });
            }
            debug!(variable = %name, from = var.value.type_name(), to = value.type_name(), "Retyping variable");
            var.default_value = value.clone();
        }

        var.last_update_ms = Utc::now().timestamp_millis();
        if var.value == value {
            trace!(variable = %name, "Value unchanged");
            return Ok(false);
        }

        let old_value = std::mem::replace(&mut var.value, value.clone());
        if var.flags.persistent {
            self.persister.enqueue(name, Some(value.to_json()));
        }
        let source_id = var.source_id.clone();
        self.notify(Notification::Changed(
            VariableChangedData {
                name: name.to_string(),
                old_value,
                new_value: value,
                source_id,
            },
            ctx,
        ));
        Ok(true)
    }

    /// Next variable after the cursor, in name order
    ///
    /// Each call takes the read lock only long enough to clone one entry.
    pub fn iterate(&self, cursor: &mut IterCursor) -> Option<Variable> {
        let next = {
            let vars = self.read();
            let mut range = match cursor.last() {
                Some(last) => vars.range::<str, _>((Bound::Excluded(last), Bound::Unbounded)),
                None => vars.range::<str, _>(..),
            };
            range.next().map(|(_, v)| v.clone())
        };
        if let Some(var) = &next {
            cursor.advance(&var.name);
        }
        next
    }

    /// Snapshot of all variables, optionally restricted to a name prefix
    pub fn list(&self, prefix: Option<&str>) -> Vec<Variable> {
        self.read()
            .values()
            .filter(|v| prefix.map(|p| v.name.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn stats(&self) -> VariableStoreStats {
        VariableStoreStats {
            count: self.count(),
            persist_errors: self.persister.errors.load(Ordering::Relaxed),
            persist_writes: self.persister.writes.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
        }
    }

    /// Wait until every queued durable write has been attempted
    pub async fn flush(&self) {
        self.persister.drain().await;
    }

    /// Rehydrate PERSISTENT variables from the key/value store
    ///
    /// Known variables take the stored value; unknown ones are registered
    /// as persistent. Returns how many values were restored.
    pub async fn load_persistent(&self) -> VariableResult<usize> {
        let entries = self
            .persister
            .kv()
            .entries()
            .await
            .map_err(|e| VariableError::Import(e.to_string()))?;

        let mut restored = 0;
        for (name, json) in entries {
            let (value, _) = Value::from_json(&json);
            if self.exists(&name) {
                let mut vars = self.write();
                if let Some(var) = vars.get_mut(&name) {
                    var.flags.persistent = true;
                    // Supersedes an initial value queued by an earlier register
                    self.persister.enqueue(&name, Some(value.to_json()));
                    var.value = value;
                    restored += 1;
                }
            } else {
                match self.insert_new(Variable::new(name.clone(), value).persistent(), false) {
                    Ok(()) => restored += 1,
                    Err(e) => warn!(variable = %name, error = %e, "Skipping stored variable"),
                }
            }
        }
        info!(count = restored, "Loaded persistent variables");
        Ok(restored)
    }

    /// All variables as a JSON array of records
    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.list(None)).unwrap_or_else(|_| serde_json::json!([]))
    }

    /// Import records produced by [`Self::export_json`]
    ///
    /// Existing variables receive the imported value; missing ones are
    /// registered with the imported flags.
    pub fn import_json(&self, json: &serde_json::Value) -> VariableResult<usize> {
        let records: Vec<Variable> = serde_json::from_value(json.clone())
            .map_err(|e| VariableError::Import(e.to_string()))?;
        let mut imported = 0;
        for record in records {
            if self.exists(&record.name) {
                self.write_existing(&record.name, record.value, Context::new(), true, true)?;
            } else {
                self.register(record)?;
            }
            imported += 1;
        }
        Ok(imported)
    }
}

impl Drop for VariableStore {
    fn drop(&mut self) {
        self.persister.close();
    }
}

fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::string(s),
        other => other,
    }
}

async fn run_notifier(mut rx: mpsc::UnboundedReceiver<Notification>, bus: Arc<EventBus>) {
    while let Some(n) = rx.recv().await {
        let _ = match n {
            Notification::Created(data, ctx) => bus.fire_typed(data, ctx),
            Notification::Changed(data, ctx) => bus.fire_typed(data, ctx),
            Notification::Removed(data, ctx) => bus.fire_typed(data, ctx),
        };
    }
    debug!("Variable notifier stopped");
}

pub type SharedVariableStore = Arc<VariableStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use hub_config::MemoryKvStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn store_with(kv: Arc<MemoryKvStore>) -> (Arc<VariableStore>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (VariableStore::new(bus.clone(), kv), bus)
    }

    fn store() -> (Arc<VariableStore>, Arc<EventBus>) {
        store_with(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let (store, _) = store();
        store.register(Variable::new("cpu.usage", 0)).unwrap();

        assert!(store.exists("cpu.usage"));
        assert_eq!(store.get("cpu.usage").unwrap(), Value::Int(0));
        assert_eq!(
            store.get_variable("cpu.usage").unwrap().source_id.as_deref(),
            Some("cpu")
        );
        assert!(matches!(
            store.register(Variable::new("cpu.usage", 1)),
            Err(VariableError::AlreadyExists(_))
        ));
        assert!(matches!(store.get("nope"), Err(VariableError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_set_absent_is_not_found() {
        let (store, _) = store();
        assert!(matches!(
            store.set("missing", 1, Context::new()),
            Err(VariableError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_registration_derives_source() {
        let (store, _) = store();
        let outcome = store.upsert("a.b", 5, Context::new()).unwrap();
        assert!(outcome.created);
        assert_eq!(store.get_variable("a.b").unwrap().source_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_changed_events_only_on_difference() {
        let (store, bus) = store();
        let mut rx = bus.subscribe_typed::<VariableChangedData>();
        store.register(Variable::new("n", Value::Null)).unwrap();

        store.set("n", 1, Context::new()).unwrap();
        store.set("n", 1, Context::new()).unwrap();
        store.set("n", 2, Context::new()).unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.data.old_value, Value::Null);
        assert_eq!(first.data.new_value, Value::Int(1));
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.data.new_value, Value::Int(2));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_notifications_keep_setter_order() {
        let (store, bus) = store();
        let mut rx = bus.subscribe_typed::<VariableChangedData>();
        store.register(Variable::new("seq", 0)).unwrap();

        for i in 1..=50 {
            store.set("seq", i, Context::new()).unwrap();
        }
        for i in 1..=50 {
            let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(event.data.new_value, Value::Int(i));
        }
    }

    #[tokio::test]
    async fn test_readonly_only_owner_writes() {
        let (store, _) = store();
        store
            .register(Variable::new("agx.temp", 40).readonly().with_source("agx"))
            .unwrap();

        assert!(matches!(
            store.set("agx.temp", 41, Context::new()),
            Err(VariableError::ReadOnly(_))
        ));
        assert!(store.set("agx.temp", 42, Context::for_source("agx")).unwrap());
        assert!(store.set_internal("agx.temp", 43).unwrap());
        assert_eq!(store.get("agx.temp").unwrap(), Value::Int(43));
    }

    #[tokio::test]
    async fn test_strict_type_rule() {
        let (store, _) = store();
        store.register(Variable::new("mode", "auto")).unwrap();
        store.register(Variable::new("level", 1)).unwrap();

        assert!(matches!(
            store.set("mode", 3, Context::new()),
            Err(VariableError::TypeMismatch { .. })
        ));
        assert!(store.set("level", 2.5, Context::new()).unwrap());
        assert!(store.set("mode", Value::Null, Context::new()).unwrap());

        // upsert retypes instead of failing
        store.upsert("level", "high", Context::new()).unwrap();
        assert_eq!(store.get("level").unwrap(), Value::string("high"));
    }

    #[tokio::test]
    async fn test_persistent_writes_are_durable() {
        let kv = Arc::new(MemoryKvStore::new());
        let (store, _) = store_with(kv.clone());
        store.register(Variable::new("boot.count", 0).persistent()).unwrap();

        for i in 1..=10 {
            store.set("boot.count", i, Context::new()).unwrap();
        }
        store.flush().await;

        assert_eq!(kv.get("boot.count").await.unwrap(), Some(serde_json::json!(10)));
        assert_eq!(store.stats().persist_errors, 0);
        assert!(store.stats().persist_writes >= 1);
    }

    #[tokio::test]
    async fn test_register_persists_initial_value() {
        let kv = Arc::new(MemoryKvStore::new());
        let (store, _) = store_with(kv.clone());
        store.register(Variable::new("fan.mode", "auto").persistent()).unwrap();
        store.register(Variable::new("fan.rpm", 1200)).unwrap();
        store.flush().await;

        assert_eq!(kv.get("fan.mode").await.unwrap(), Some(serde_json::json!("auto")));
        assert_eq!(kv.get("fan.rpm").await.unwrap(), None);
        assert_eq!(store.stats().persist_writes, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_memory_value() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set_fail_writes(true);
        let (store, _) = store_with(kv);
        store.register(Variable::new("mode", "a").persistent()).unwrap();

        store.set("mode", "b", Context::new()).unwrap();
        store.flush().await;

        assert_eq!(store.get("mode").unwrap(), Value::string("b"));
        assert_eq!(store.stats().persist_errors, 1);
    }

    #[tokio::test]
    async fn test_load_persistent() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("lamp.on", serde_json::json!(true)).await.unwrap();
        kv.set("threshold", serde_json::json!(75)).await.unwrap();

        let (store, _) = store_with(kv.clone());
        store.register(Variable::new("threshold", 50).persistent()).unwrap();

        assert_eq!(store.load_persistent().await.unwrap(), 2);
        assert_eq!(store.get("threshold").unwrap(), Value::Int(75));
        store.flush().await;
        assert_eq!(kv.get("threshold").await.unwrap(), Some(serde_json::json!(75)));
        let lamp = store.get_variable("lamp.on").unwrap();
        assert!(lamp.flags.persistent);
        assert_eq!(lamp.value, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_iterate_with_cursor() {
        let (store, _) = store();
        for name in ["c", "a", "b"] {
            store.register(Variable::new(name, 0)).unwrap();
        }

        let mut cursor = IterCursor::new();
        let mut seen = Vec::new();
        while let Some(var) = store.iterate(&mut cursor) {
            // writes between yields must not deadlock
            store.set(&var.name, 1, Context::new()).unwrap();
            seen.push(var.name);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unregister_by_source() {
        let (store, bus) = store();
        let mut rx = bus.subscribe_typed::<VariableRemovedData>();
        store.upsert("rest1.cpu", 1, Context::for_source("rest1")).unwrap();
        store.upsert("rest1.mem", 2, Context::for_source("rest1")).unwrap();
        store.upsert("other", 3, Context::new()).unwrap();

        assert_eq!(store.unregister_by_source("rest1"), 2);
        assert_eq!(store.count(), 1);
        let removed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(removed.data.source_id.as_deref(), Some("rest1"));
    }

    #[tokio::test]
    async fn test_export_import() {
        let (store, _) = store();
        store.upsert("a.x", 1, Context::new()).unwrap();
        store.register(Variable::new("b.y", "on").persistent()).unwrap();
        let exported = store.export_json();

        let (other, _) = self::store();
        other.upsert("a.x", 9, Context::new()).unwrap();
        assert_eq!(other.import_json(&exported).unwrap(), 2);
        assert_eq!(other.get("a.x").unwrap(), Value::Int(1));
        assert!(other.get_variable("b.y").unwrap().flags.persistent);
    }

    #[tokio::test]
    async fn test_long_strings_truncated() {
        let (store, _) = store();
        store.upsert("msg", "x".repeat(500), Context::new()).unwrap();
        assert_eq!(store.get("msg").unwrap().as_str().unwrap().len(), 128);
    }
}
