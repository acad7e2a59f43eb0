//! The rule engine task
//!
//! Listens to variable events on the bus, evaluates the rules that read the
//! changed variable and hands matching rules' actions to the dispatcher.

use crate::error::{RuleError, RuleResult};
use crate::evaluator::{ConditionEvaluator, Evaluation, Observation};
use crate::manager::{FireGate, RuleManager};
use crate::rule::Rule;
use chrono::Utc;
use hub_actions::{ActionDispatcher, Firing, FiringReport};
use hub_core::events::{VariableChangedData, VariableCreatedData};
use hub_core::{Context, Event, EventType, Value};
use hub_variables::VariableStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub total_evaluations: u64,
    pub total_triggers: u64,
    /// Actions handed to the dispatcher
    pub total_actions: u64,
    /// Actions that could not be enqueued, plus failures of manual triggers
    pub failed_actions: u64,
    pub eval_errors: u64,
    pub cooldown_drops: u64,
    /// Unix milliseconds of the last evaluation, 0 if none
    pub last_evaluation_ms: i64,
}

struct EngineTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RuleEngine {
    rules: Arc<RuleManager>,
    evaluator: ConditionEvaluator,
    vars: Arc<VariableStore>,
    dispatcher: Arc<ActionDispatcher>,
    paused: AtomicBool,
    /// Last match result per rule, so the sweep only fires on a rising edge
    latched: Mutex<HashMap<String, bool>>,
    stats: Mutex<RuleStats>,
    task: Mutex<Option<EngineTask>>,
}

impl RuleEngine {
    pub fn new(rules: Arc<RuleManager>, vars: Arc<VariableStore>, dispatcher: Arc<ActionDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            rules,
            evaluator: ConditionEvaluator::new(),
            vars,
            dispatcher,
            paused: AtomicBool::new(false),
            latched: Mutex::new(HashMap::new()),
            stats: Mutex::new(RuleStats::default()),
            task: Mutex::new(None),
        })
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    fn stats_mut(&self) -> std::sync::MutexGuard<'_, RuleStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to variable events and start reacting to them
    ///
    /// `sweep` enables the periodic [`RuleEngine::evaluate_all`]. Returns
    /// false when the task is already running.
    pub fn start(self: &Arc<Self>, sweep: Option<Duration>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return false;
        }
        self.latches().clear();
        let rx = self.vars.event_bus().subscribe_all();
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(self.clone(), rx, stop_rx, sweep));
        *task = Some(EngineTask { stop, handle });
        info!(rules = self.rules.count(), sweep_ms = ?sweep.map(|d| d.as_millis()), "Rule engine started");
        true
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Rule engine task ended abnormally");
            }
            info!("Rule engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// While paused, changes still update the previous-value table but no
    /// rule fires
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn latches(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.latched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a rule's match result; returns the previous one
    fn latch(&self, id: &str, matched: bool) -> bool {
        self.latches().insert(id.to_string(), matched).unwrap_or(false)
    }

    fn record(&self, eval: Evaluation) {
        let mut stats = self.stats_mut();
        stats.total_evaluations += 1;
        stats.eval_errors += u64::from(eval.errors);
        stats.last_evaluation_ms = Utc::now().timestamp_millis();
    }

    /// Route one bus event; returns how many rules fired
    pub fn handle_event(&self, event: &Event<serde_json::Value>) -> usize {
        match event.event_type {
            EventType::VariableChanged => {
                match serde_json::from_value::<VariableChangedData>(event.data.clone()) {
                    Ok(d) => self.on_change(&d.name, &d.new_value, Some(&d.old_value), &event.context),
                    Err(e) => {
                        debug!(error = %e, "Malformed variable_changed event");
                        0
                    }
                }
            }
            EventType::VariableCreated => {
                match serde_json::from_value::<VariableCreatedData>(event.data.clone()) {
                    Ok(d) => self.on_change(&d.name, &d.value, None, &event.context),
                    Err(e) => {
                        debug!(error = %e, "Malformed variable_created event");
                        0
                    }
                }
            }
            _ => 0,
        }
    }

    /// Evaluate the rules reading `name` against its new value
    pub fn on_change(&self, name: &str, value: &Value, old_value: Option<&Value>, ctx: &Context) -> usize {
        let candidates = self.rules.candidates(name);
        if candidates.is_empty() {
            return 0;
        }
        let observation = Observation {
            name,
            value,
            old_value,
        };
        let mut fired = 0;
        for rule in &candidates {
            let eval = self.evaluator.evaluate(rule, &self.vars, Some(&observation));
            self.record(eval);
            self.latch(&rule.id, eval.matched);
            if eval.matched && !self.is_paused() && self.fire(&rule.id, ctx.child()) {
                fired += 1;
            }
        }
        fired
    }

    /// Re-evaluate every enabled level-triggered rule against the store
    ///
    /// A rule fires here only when it did not match at its previous
    /// evaluation, so a condition that stays true fires once. Rules using
    /// `changed`/`changed_to` are skipped: without a change there is no
    /// edge to see.
    pub fn evaluate_all(&self) -> usize {
        let mut fired = 0;
        for rule in self.rules.enabled().iter().filter(|r| !r.uses_edges()) {
            let eval = self.evaluator.evaluate(rule, &self.vars, None);
            self.record(eval);
            let was_matched = self.latch(&rule.id, eval.matched);
            if eval.matched && !was_matched && !self.is_paused() && self.fire(&rule.id, Context::new()) {
                fired += 1;
            }
        }
        if fired > 0 {
            debug!(fired, "Sweep fired rules");
        }
        fired
    }

    /// Pass the cooldown gate and enqueue the rule's actions
    fn fire(&self, id: &str, ctx: Context) -> bool {
        match self.rules.try_fire(id, Instant::now()) {
            Ok(FireGate::Fire {
                actions,
                trigger_count,
            }) => {
                let n = actions.len() as u64;
                {
                    let mut stats = self.stats_mut();
                    stats.total_triggers += 1;
                    stats.total_actions += n;
                }
                info!(rule = %id, trigger_count, actions = n, "Rule fired");
                if let Err(e) = self.dispatcher.submit(Firing::for_rule(id, actions, ctx)) {
                    warn!(rule = %id, error = %e, "Rule actions not enqueued");
                    self.stats_mut().failed_actions += n;
                }
                true
            }
            Ok(FireGate::Cooldown { remaining_ms }) => {
                debug!(rule = %id, remaining_ms, "Rule in cooldown");
                self.stats_mut().cooldown_drops += 1;
                false
            }
            Err(e) => {
                debug!(rule = %id, error = %e, "Rule removed or disabled before firing");
                false
            }
        }
    }

    /// Fire a rule by hand, bypassing its conditions
    ///
    /// A disabled rule is refused and the cooldown still applies. Waits for every action's result.
    pub async fn trigger(&self, id: &str) -> RuleResult<FiringReport> {
        let actions = match self.rules.try_fire(id, Instant::now())? {
            FireGate::Fire { actions, .. } => actions,
            FireGate::Cooldown { remaining_ms } => {
                return Err(RuleError::Cooldown {
                    id: id.to_string(),
                    remaining_ms,
                })
            }
        };
        let n = actions.len() as u64;
        {
            let mut stats = self.stats_mut();
            stats.total_triggers += 1;
            stats.total_actions += n;
        }
        info!(rule = %id, actions = n, "Rule triggered manually");

        match self
            .dispatcher
            .submit_and_wait(Firing::for_rule(id, actions, Context::new()))
            .await
        {
            Ok(report) => {
                self.stats_mut().failed_actions += report.failure_count() as u64;
                Ok(report)
            }
            Err(e) => {
                self.stats_mut().failed_actions += n;
                Err(e.into())
            }
        }
    }

    pub fn add_rule(&self, rule: Rule) -> RuleResult<()> {
        self.rules.add(rule)
    }

    /// Replace a rule's definition; its edge history starts over
    pub fn replace_rule(&self, rule: Rule) -> RuleResult<()> {
        let id = rule.id.clone();
        self.rules.replace(rule)?;
        self.evaluator.forget(&id);
        self.latches().remove(&id);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> RuleResult<Rule> {
        let rule = self.rules.remove(id)?;
        self.evaluator.forget(id);
        self.latches().remove(id);
        Ok(rule)
    }

    pub fn stats(&self) -> RuleStats {
        self.stats_mut().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats_mut() = RuleStats::default();
    }
}

async fn run(
    engine: Arc<RuleEngine>,
    mut rx: broadcast::Receiver<Event<serde_json::Value>>,
    mut stop: watch::Receiver<bool>,
    sweep: Option<Duration>,
) {
    let mut ticker = sweep.filter(|d| !d.is_zero()).map(|period| {
        let start = Instant::now();
        let mut t = interval_at(start.checked_add(period).unwrap_or(start), period);
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = async {
                match ticker.as_mut() {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                engine.evaluate_all();
            }
            msg = rx.recv() => match msg {
                Ok(event) => {
                    engine.handle_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Rule engine lagged behind variable events");
                    engine.evaluate_all();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
