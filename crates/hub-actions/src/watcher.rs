//! Service Watcher
//!
//! Follows the log of a service started in the background until a ready or
//! fail pattern shows up, and reports progress through
//! `{prefix}.status` (`checking`, `ready`, `failed`, `timeout`) and
//! `{prefix}.ready_time`. One watcher per prefix; starting another replaces
//! it.

use crate::action::compile_pattern;
use crate::capability::SshExecutor;
use crate::error::{ActionError, ActionResult};
use crate::ssh::SshTarget;
use chrono::Utc;
use dashmap::DashMap;
use hub_core::{Context, Value};
use hub_variables::VariableStore;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const TAIL_LINES: usize = 50;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub target: SshTarget,
    pub host_ref: String,
    pub log_file: String,
    pub ready_pattern: String,
    pub fail_pattern: Option<String>,
    pub var_prefix: String,
    pub ready_timeout_sec: u64,
    pub check_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchOutcome {
    Ready,
    Failed,
    Timeout,
}

impl WatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchOutcome::Ready => "ready",
            WatchOutcome::Failed => "failed",
            WatchOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchInfo {
    pub var_prefix: String,
    pub host_ref: String,
    pub log_file: String,
    pub elapsed_ms: u64,
}

struct WatchHandle {
    generation: u64,
    host_ref: String,
    log_file: String,
    started: Instant,
    task: JoinHandle<()>,
}

pub struct ServiceWatcher {
    vars: Arc<VariableStore>,
    ssh: Option<Arc<dyn SshExecutor>>,
    watchers: Arc<DashMap<String, WatchHandle>>,
    generation: AtomicU64,
}

impl ServiceWatcher {
    pub fn new(vars: Arc<VariableStore>, ssh: Option<Arc<dyn SshExecutor>>) -> Self {
        Self {
            vars,
            ssh,
            watchers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Start watching, replacing a running watcher for the same prefix
    pub fn start(&self, config: WatchConfig) -> ActionResult<()> {
        let ready = compile_pattern(&config.ready_pattern)?;
        let fail = config
            .fail_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(compile_pattern)
            .transpose()?;
        let ssh = self
            .ssh
            .clone()
            .ok_or_else(|| ActionError::InvalidAction("no SSH executor configured".into()))?;

        if let Some((_, old)) = self.watchers.remove(&config.var_prefix) {
            debug!(prefix = %config.var_prefix, "Replacing service watcher");
            old.task.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix = config.var_prefix.clone();
        let handle_info = (config.host_ref.clone(), config.log_file.clone());

        set_status(&self.vars, &prefix, "checking");
        info!(
            prefix = %prefix,
            log_file = %config.log_file,
            timeout_sec = config.ready_timeout_sec,
            "Service watcher started"
        );

        // The loop waits until its handle is registered, so a fast finish
        // cannot leave a stale entry behind
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let vars = self.vars.clone();
        let watchers = self.watchers.clone();
        let task = tokio::spawn(async move {
            if go_rx.await.is_ok() {
                watch_loop(config, ready, fail, ssh, vars, watchers, generation).await;
            }
        });
        self.watchers.insert(
            prefix,
            WatchHandle {
                generation,
                host_ref: handle_info.0,
                log_file: handle_info.1,
                started: Instant::now(),
                task,
            },
        );
        let _ = go_tx.send(());
        Ok(())
    }

    pub fn stop(&self, var_prefix: &str) -> bool {
        match self.watchers.remove(var_prefix) {
            Some((_, handle)) => {
                handle.task.abort();
                info!(prefix = %var_prefix, "Service watcher stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let prefixes: Vec<String> = self.watchers.iter().map(|e| e.key().clone()).collect();
        for prefix in prefixes {
            self.stop(&prefix);
        }
    }

    pub fn is_running(&self, var_prefix: &str) -> bool {
        self.watchers.contains_key(var_prefix)
    }

    pub fn active_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn list(&self) -> Vec<WatchInfo> {
        let mut all: Vec<WatchInfo> = self
            .watchers
            .iter()
            .map(|e| WatchInfo {
                var_prefix: e.key().clone(),
                host_ref: e.host_ref.clone(),
                log_file: e.log_file.clone(),
                elapsed_ms: e.started.elapsed().as_millis() as u64,
            })
            .collect();
        all.sort_by(|a, b| a.var_prefix.cmp(&b.var_prefix));
        all
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        for entry in self.watchers.iter() {
            entry.task.abort();
        }
    }
}

fn set_status(vars: &VariableStore, prefix: &str, status: &str) {
    let name = format!("{prefix}.status");
    if let Err(e) = vars.upsert(&name, Value::string(status), Context::new()) {
        warn!(variable = %name, error = %e, "Failed to write watcher status");
    }
}

/// Fail pattern first, so a log containing both reports failure
fn classify(log: &str, ready: &Regex, fail: Option<&Regex>) -> Option<WatchOutcome> {
    if fail.map(|f| f.is_match(log)).unwrap_or(false) {
        return Some(WatchOutcome::Failed);
    }
    if ready.is_match(log) {
        return Some(WatchOutcome::Ready);
    }
    None
}

async fn watch_loop(
    config: WatchConfig,
    ready: Regex,
    fail: Option<Regex>,
    ssh: Arc<dyn SshExecutor>,
    vars: Arc<VariableStore>,
    watchers: Arc<DashMap<String, WatchHandle>>,
    generation: u64,
) {
    let started = Instant::now();
    let deadline = Duration::from_secs(config.ready_timeout_sec);
    let interval = Duration::from_millis(config.check_interval_ms.max(100));
    let probe = format!("tail -n {TAIL_LINES} {} 2>/dev/null", config.log_file);

    let outcome = loop {
        match ssh.exec(&config.target, &probe, PROBE_TIMEOUT).await {
            Ok(out) => {
                if let Some(outcome) = classify(&out.stdout, &ready, fail.as_ref()) {
                    break outcome;
                }
            }
            Err(e) => {
                debug!(prefix = %config.var_prefix, error = %e, "Watcher probe failed, retrying");
            }
        }
        if started.elapsed() >= deadline {
            break WatchOutcome::Timeout;
        }
        tokio::time::sleep(interval).await;
    };

    set_status(&vars, &config.var_prefix, outcome.as_str());
    if outcome == WatchOutcome::Ready {
        let name = format!("{}.ready_time", config.var_prefix);
        if let Err(e) = vars.upsert(&name, Utc::now().timestamp(), Context::new()) {
            warn!(variable = %name, error = %e, "Failed to write ready time");
        }
    }
    info!(
        prefix = %config.var_prefix,
        outcome = outcome.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Service watcher finished"
    );

    watchers.remove_if(&config.var_prefix, |_, h| h.generation == generation);
}
