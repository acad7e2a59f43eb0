//! The lifecycle supervisor

use crate::state::{AutomationStatus, EngineState, ReloadSummary};
use hub_actions::{
    ActionDispatcher, ActionExecutor, ActionTemplate, Capabilities, DispatcherConfig,
    TemplateRegistry,
};
use hub_config::{keys, EngineConfig, Storage, StorageResult, ENGINE_CONFIG_FILE};
use hub_core::{HubError, HubResult};
use hub_rules::{Rule, RuleEngine, RuleManager};
use hub_sources::{Source, SourceManager, SshAccess};
use hub_variables::VariableStore;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How long `stop` lets queued actions finish
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Lifecycle {
    state: EngineState,
    started_at: Option<Instant>,
    last_error: Option<String>,
    config: EngineConfig,
}

/// Raw entries of every config table
#[derive(Debug, Default)]
struct ConfigTables {
    ssh_hosts: Vec<serde_json::Value>,
    ssh_commands: Vec<serde_json::Value>,
    actions: Vec<serde_json::Value>,
    rules: Vec<serde_json::Value>,
    sources: Vec<serde_json::Value>,
}

impl ConfigTables {
    async fn load(storage: &Storage) -> StorageResult<Self> {
        Ok(Self {
            ssh_hosts: storage.load_table(keys::SSH_HOSTS).await?,
            ssh_commands: storage.load_table(keys::SSH_COMMANDS).await?,
            actions: storage.load_table(keys::ACTIONS).await?,
            rules: storage.load_table(keys::RULES).await?,
            sources: storage.load_table(keys::SOURCES).await?,
        })
    }
}

/// Owner of every engine component
pub struct Automation {
    config_dir: PathBuf,
    storage: Storage,
    vars: Arc<VariableStore>,
    executor: Arc<ActionExecutor>,
    dispatcher: Arc<ActionDispatcher>,
    sources: Arc<SourceManager>,
    engine: Arc<RuleEngine>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes transitions, which await worker shutdown
    transition: tokio::sync::Mutex<()>,
    config_modified: AtomicBool,
}

impl Automation {
    /// Wire the components together
    ///
    /// Must be called from within a tokio runtime. Nothing is loaded until
    /// [`Automation::init`].
    pub fn new(vars: Arc<VariableStore>, caps: Capabilities, config_dir: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_dispatcher(vars, caps, config_dir, DispatcherConfig::default())
    }

    pub fn with_dispatcher(
        vars: Arc<VariableStore>,
        caps: Capabilities,
        config_dir: impl Into<PathBuf>,
        dispatcher: DispatcherConfig,
    ) -> Arc<Self> {
        let config_dir = config_dir.into();
        let executor = Arc::new(ActionExecutor::new(vars.clone(), caps));
        let dispatcher = Arc::new(ActionDispatcher::new(executor.clone(), dispatcher));
        let sources = Arc::new(SourceManager::new(vars.clone(), SshAccess::from_executor(&executor)));
        let engine = RuleEngine::new(Arc::new(RuleManager::new()), vars.clone(), dispatcher.clone());

        Arc::new(Self {
            storage: Storage::new(&config_dir),
            config_dir,
            vars,
            executor,
            dispatcher,
            sources,
            engine,
            lifecycle: Mutex::new(Lifecycle::default()),
            transition: tokio::sync::Mutex::new(()),
            config_modified: AtomicBool::new(false),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle().state
    }

    fn set_state(&self, state: EngineState) {
        let mut lc = self.lifecycle();
        debug!(from = %lc.state, to = %state, "Automation state change");
        lc.state = state;
    }

    fn invalid_state(&self, op: &str) -> HubError {
        HubError::InvalidState(format!("cannot {} while {}", op, self.state()))
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.vars
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn sources(&self) -> &Arc<SourceManager> {
        &self.sources
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        self.executor.templates()
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(ENGINE_CONFIG_FILE)
    }

    /// Load configuration tables and persistent variables
    ///
    /// A no-op once initialized. On failure the state is `error` and `init`
    /// may be called again.
    #[instrument(skip(self), fields(config_dir = ?self.config_dir))]
    pub async fn init(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            EngineState::Uninitialized | EngineState::Error => {}
            _ => return Ok(()),
        }

        match self.load_all().await {
            Ok(()) => {
                let mut lc = self.lifecycle();
                lc.state = EngineState::Initialized;
                lc.last_error = None;
                info!(
                    sources = self.sources.count(),
                    rules = self.engine.rules().count(),
                    templates = self.templates().count(),
                    variables = self.vars.count(),
                    "Automation initialized"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Automation init failed");
                let mut lc = self.lifecycle();
                lc.state = EngineState::Error;
                lc.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn load_all(&self) -> HubResult<()> {
        let config = EngineConfig::load(&self.config_dir).await?;
        let tables = ConfigTables::load(&self.storage).await?;

        match self.vars.load_persistent().await {
            Ok(n) => debug!(restored = n, "Persistent variables restored"),
            Err(e) => warn!(error = %e, "Could not restore persistent variables"),
        }

        self.executor.ssh_hosts().load(&tables.ssh_hosts);
        self.executor.ssh_commands().load(&tables.ssh_commands);
        self.templates().load(&tables.actions);

        // A retried init starts from empty tables
        for id in self.engine.rules().ids() {
            let _ = self.engine.remove_rule(&id);
        }
        self.engine.rules().load(&tables.rules);

        for source in self.sources.configs() {
            let _ = self.sources.remove(&source.id).await;
        }
        self.sources.load(&tables.sources);

        if !config.enabled {
            warn!("automation.json has the engine disabled");
        }
        self.lifecycle().config = config;
        Ok(())
    }

    /// Start source workers and the rule engine
    ///
    /// Allowed from `initialized` and `stopped`; a no-op while running.
    #[instrument(skip(self))]
    pub async fn start(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            EngineState::Running => return Ok(()),
            EngineState::Initialized | EngineState::Stopped => {}
            _ => return Err(self.invalid_state("start")),
        }

        let sweep = Duration::from_millis(self.lifecycle().config.eval_interval_ms);
        self.dispatcher.start();
        self.engine.set_paused(false);
        // Subscribe before the first poll lands
        self.engine.start(Some(sweep));
        let workers = self.sources.start_all();

        {
            let mut lc = self.lifecycle();
            lc.state = EngineState::Running;
            lc.started_at = Some(Instant::now());
        }
        let fired = self.engine.evaluate_all();
        info!(workers, fired, "Automation running");
        Ok(())
    }

    /// Stop workers and the rule engine, draining queued actions
    #[instrument(skip(self))]
    pub async fn stop(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            EngineState::Stopped => return Ok(()),
            EngineState::Running | EngineState::Paused => {}
            _ => return Err(self.invalid_state("stop")),
        }

        self.sources.stop_all().await;
        self.engine.stop().await;
        self.dispatcher.shutdown(STOP_GRACE).await;
        self.executor.watcher().stop_all();

        {
            let mut lc = self.lifecycle();
            lc.state = EngineState::Stopped;
            lc.started_at = None;
        }
        info!("Automation stopped");
        Ok(())
    }

    /// Keep ingesting but stop firing rules
    pub async fn pause(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            EngineState::Paused => Ok(()),
            EngineState::Running => {
                self.engine.set_paused(true);
                self.set_state(EngineState::Paused);
                info!("Automation paused");
                Ok(())
            }
            _ => Err(self.invalid_state("pause")),
        }
    }

    pub async fn resume(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::Paused => {
                self.engine.set_paused(false);
                self.set_state(EngineState::Running);
                info!("Automation resumed");
                Ok(())
            }
            _ => Err(self.invalid_state("resume")),
        }
    }

    /// Re-read the configuration and apply the difference
    ///
    /// New entries are added, missing ones removed and changed ones
    /// replaced. Variables of removed sources survive when an enabled rule
    /// still reads them.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> HubResult<ReloadSummary> {
        let _guard = self.transition.lock().await;
        if self.state() == EngineState::Uninitialized {
            return Err(self.invalid_state("reload"));
        }

        let loaded = async {
            let config = EngineConfig::load(&self.config_dir).await?;
            let tables = ConfigTables::load(&self.storage).await?;
            Ok::<_, HubError>((config, tables))
        }
        .await;
        let (config, tables) = match loaded {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Reload failed, keeping current configuration");
                self.lifecycle().last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let mut summary = ReloadSummary::default();
        self.executor.ssh_hosts().load(&tables.ssh_hosts);
        self.executor.ssh_commands().load(&tables.ssh_commands);
        self.reload_templates(&tables.actions, &mut summary);
        self.reload_rules(&tables.rules, &mut summary);
        self.reload_sources(&tables.sources, &mut summary).await;

        self.lifecycle().config = config;
        self.config_modified.store(false, Ordering::SeqCst);
        if self.state() == EngineState::Running {
            self.engine.evaluate_all();
        }
        info!(?summary, "Configuration reloaded");
        Ok(summary)
    }

    fn reload_templates(&self, entries: &[serde_json::Value], summary: &mut ReloadSummary) {
        let registry = self.templates();
        let mut wanted = HashSet::new();
        for entry in entries {
            let parsed = serde_json::from_value::<ActionTemplate>(entry.clone())
                .or_else(|_| ActionTemplate::from_json(entry));
            let template = match parsed {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "Skipping stored action template");
                    continue;
                }
            };
            wanted.insert(template.id.clone());
            match registry.get(&template.id) {
                Some(current) if current.action == template.action && current.enabled == template.enabled => {}
                Some(_) => match registry.update(template) {
                    Ok(()) => summary.templates_updated += 1,
                    Err(e) => warn!(error = %e, "Template update rejected"),
                },
                None => match registry.add(template) {
                    Ok(()) => summary.templates_added += 1,
                    Err(e) => warn!(error = %e, "Template add rejected"),
                },
            }
        }
        for template in registry.list() {
            if !wanted.contains(&template.id) && registry.remove(&template.id).is_ok() {
                summary.templates_removed += 1;
            }
        }
    }

    fn reload_rules(&self, entries: &[serde_json::Value], summary: &mut ReloadSummary) {
        let mut wanted: Vec<Rule> = Vec::new();
        for entry in entries {
            match Rule::from_json(entry) {
                Ok(rule) => wanted.push(rule),
                Err(e) => warn!(error = %e, "Skipping rule entry"),
            }
        }
        let wanted_ids: HashSet<&str> = wanted.iter().map(|r| r.id.as_str()).collect();

        for id in self.engine.rules().ids() {
            if !wanted_ids.contains(id.as_str()) && self.engine.remove_rule(&id).is_ok() {
                summary.rules_removed += 1;
            }
        }
        for rule in wanted {
            match self.engine.rules().get(&rule.id) {
                Some(current) if current.same_definition(&rule) => {}
                Some(_) => match self.engine.replace_rule(rule) {
                    Ok(()) => summary.rules_replaced += 1,
                    Err(e) => warn!(error = %e, "Rule replace rejected"),
                },
                None => match self.engine.add_rule(rule) {
                    Ok(()) => summary.rules_added += 1,
                    Err(e) => warn!(error = %e, "Rule add rejected"),
                },
            }
        }
    }

    async fn reload_sources(&self, entries: &[serde_json::Value], summary: &mut ReloadSummary) {
        let mut wanted: Vec<Source> = Vec::new();
        for entry in entries {
            match Source::from_json(entry) {
                Ok(source) => wanted.push(source),
                Err(e) => warn!(error = %e, "Skipping source entry"),
            }
        }
        let current: HashMap<String, Source> = self
            .sources
            .configs()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let wanted_ids: HashSet<&str> = wanted.iter().map(|s| s.id.as_str()).collect();
        let keep = self.engine.rules().referenced_variables();

        for id in current.keys() {
            if wanted_ids.contains(id.as_str()) {
                continue;
            }
            summary.variables_retained += self.retained_count(id, &keep);
            if self.sources.remove_retaining(id, &keep).await.is_ok() {
                summary.sources_removed += 1;
            }
        }

        for source in wanted {
            match current.get(&source.id) {
                Some(existing) if *existing == source => {}
                Some(_) => {
                    summary.variables_retained += self.retained_count(&source.id, &keep);
                    if let Err(e) = self.sources.remove_retaining(&source.id, &keep).await {
                        warn!(source = %source.id, error = %e, "Could not tear down source");
                        continue;
                    }
                    match self.sources.add(source) {
                        Ok(()) => summary.sources_replaced += 1,
                        Err(e) => warn!(error = %e, "Source re-create rejected"),
                    }
                }
                None => match self.sources.add(source) {
                    Ok(()) => summary.sources_added += 1,
                    Err(e) => warn!(error = %e, "Source add rejected"),
                },
            }
        }
    }

    fn retained_count(&self, source_id: &str, keep: &HashSet<String>) -> usize {
        self.vars
            .list(None)
            .iter()
            .filter(|v| v.source_id.as_deref() == Some(source_id) && keep.contains(&v.name))
            .count()
    }

    /// Write sources, rules, templates and SSH tables back to disk
    #[instrument(skip(self))]
    pub async fn save_config(&self) -> HubResult<()> {
        let _guard = self.transition.lock().await;
        let sources: Vec<serde_json::Value> = self.sources.configs().iter().map(Source::to_json).collect();
        self.storage.save_table(keys::SOURCES, &sources).await?;
        self.storage.save_table(keys::RULES, &self.engine.rules().configs()).await?;
        self.storage.save_table(keys::ACTIONS, &self.templates().to_vec()).await?;
        self.storage
            .save_table(keys::SSH_HOSTS, &self.executor.ssh_hosts().to_vec())
            .await?;
        self.storage
            .save_table(keys::SSH_COMMANDS, &self.executor.ssh_commands().to_vec())
            .await?;
        let config = self.lifecycle().config.clone();
        config.save(&self.config_dir).await?;

        self.config_modified.store(false, Ordering::SeqCst);
        info!(
            sources = sources.len(),
            rules = self.engine.rules().count(),
            "Configuration saved"
        );
        Ok(())
    }

    /// Note an in-memory change not yet written by [`Automation::save_config`]
    pub fn mark_modified(&self) {
        self.config_modified.store(true, Ordering::SeqCst);
    }

    pub fn config_modified(&self) -> bool {
        self.config_modified.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> AutomationStatus {
        let (state, uptime_ms, last_error) = {
            let lc = self.lifecycle();
            let uptime = match (lc.state.is_active(), lc.started_at) {
                (true, Some(t)) => t.elapsed().as_millis() as u64,
                _ => 0,
            };
            (lc.state, uptime, lc.last_error.clone())
        };
        let source_stats = self.sources.stats();
        let rules = self.engine.rules().list();

        AutomationStatus {
            state,
            uptime_ms,
            sources_count: source_stats.total,
            sources_active: source_stats.connected,
            rules_count: rules.len(),
            rules_active: rules.iter().filter(|r| r.enabled).count(),
            variables_count: self.vars.count(),
            actions_executed: self.dispatcher.stats().total_executed,
            rule_triggers: self.engine.stats().total_triggers,
            config_path: self.config_path().display().to_string(),
            config_modified: self.config_modified(),
            persist_errors: self.vars.stats().persist_errors,
            exec_events_dropped: self.executor.exec_events().dropped(),
            last_error,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Stop if active and flush persistent variables
    pub async fn shutdown(&self) {
        if self.state().is_active() {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Stop during shutdown failed");
            }
        }
        self.vars.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_config::MemoryKvStore;
    use hub_event_bus::EventBus;
    use tempfile::TempDir;

    fn automation(dir: &TempDir) -> Arc<Automation> {
        let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
        Automation::new(vars, Capabilities::none(), dir.path())
    }

    #[tokio::test]
    async fn test_transitions() {
        let dir = TempDir::new().unwrap();
        let auto = automation(&dir);

        assert!(matches!(auto.start().await, Err(HubError::InvalidState(_))));
        assert!(matches!(auto.reload().await, Err(HubError::InvalidState(_))));

        auto.init().await.unwrap();
        assert_eq!(auto.state(), EngineState::Initialized);
        assert!(matches!(auto.pause().await, Err(HubError::InvalidState(_))));
        assert!(matches!(auto.stop().await, Err(HubError::InvalidState(_))));

        auto.start().await.unwrap();
        auto.start().await.unwrap();
        assert_eq!(auto.state(), EngineState::Running);
        assert!(auto.rules().is_running());

        auto.pause().await.unwrap();
        auto.pause().await.unwrap();
        assert_eq!(auto.state(), EngineState::Paused);
        assert!(auto.rules().is_paused());
        assert!(matches!(auto.start().await, Err(HubError::InvalidState(_))));

        auto.resume().await.unwrap();
        assert_eq!(auto.state(), EngineState::Running);

        auto.stop().await.unwrap();
        auto.stop().await.unwrap();
        assert_eq!(auto.state(), EngineState::Stopped);
        assert!(!auto.rules().is_running());
        assert!(matches!(auto.resume().await, Err(HubError::InvalidState(_))));

        auto.start().await.unwrap();
        assert_eq!(auto.state(), EngineState::Running);
        auto.shutdown().await;
        assert_eq!(auto.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_init_error_then_retry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("rules.json"), "{not json").unwrap();
        let auto = automation(&dir);

        assert!(auto.init().await.is_err());
        let status = auto.status();
        assert_eq!(status.state, EngineState::Error);
        assert!(status.last_error.is_some());

        std::fs::write(dir.path().join("rules.json"), "[]").unwrap();
        auto.init().await.unwrap();
        assert_eq!(auto.state(), EngineState::Initialized);
        assert!(auto.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let dir = TempDir::new().unwrap();
        let auto = automation(&dir);
        auto.init().await.unwrap();

        let status = auto.status();
        assert_eq!(status.uptime_ms, 0);
        assert_eq!(status.sources_count, 0);
        assert!(!status.config_modified);
        assert!(status.config_path.ends_with("automation.json"));
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

        auto.mark_modified();
        assert!(auto.status().config_modified);
        auto.save_config().await.unwrap();
        assert!(!auto.config_modified());
        assert!(dir.path().join("rules.json").exists());
        assert!(dir.path().join("automation.json").exists());
    }
}
