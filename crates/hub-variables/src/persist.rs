//! Coalescing writer for PERSISTENT variables
//!
//! Setters only record the latest value per name and wake the writer task,
//! so a burst of writes to one variable costs one durable write.

use hub_config::KvStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub(crate) struct Persister {
    /// `None` marks a removal
    pending: Mutex<BTreeMap<String, Option<serde_json::Value>>>,
    wake: Notify,
    write_lock: tokio::sync::Mutex<()>,
    kv: Arc<dyn KvStore>,
    closed: AtomicBool,
    pub(crate) errors: AtomicU64,
    pub(crate) writes: AtomicU64,
}

impl Persister {
    pub(crate) fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
            kv,
            closed: AtomicBool::new(false),
            errors: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub(crate) fn enqueue(&self, name: &str, value: Option<serde_json::Value>) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
        self.wake.notify_one();
    }

    /// Write everything queued so far
    pub(crate) async fn drain(&self) {
        let _guard = self.write_lock.lock().await;
        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "Persisting variables");

        for (name, value) in batch {
            let result = match value {
                Some(v) => self.kv.set(&name, v).await,
                None => self.kv.remove(&name).await,
            };
            match result {
                Ok(()) => {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(variable = %name, error = %e, "Failed to persist variable");
                }
            }
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub(crate) async fn run(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            self.drain().await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!("Variable persister stopped");
    }
}
