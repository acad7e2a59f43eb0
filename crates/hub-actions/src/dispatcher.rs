//! Action Dispatcher
//!
//! A bounded queue of firings serviced by worker tasks. A firing's actions
//! are enqueued together and run in list order by one worker; each waits
//! for its `delay_ms` measured from the enqueue time. Template references
//! are resolved when the worker reaches them.

use crate::action::{Action, ActionRef, MAX_DELAY_MS};
use crate::error::{ActionError, ActionResult};
use crate::executor::{ActionExecutor, ActionStats, ExecutionResult};
use hub_core::Context;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of actions waiting to start
    pub capacity: usize,
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// An ordered list of actions submitted as one unit
#[derive(Debug, Clone)]
pub struct Firing {
    pub rule_id: Option<String>,
    pub actions: Vec<ActionRef>,
    pub context: Context,
}

impl Firing {
    pub fn new(actions: Vec<ActionRef>) -> Self {
        Self {
            rule_id: None,
            actions,
            context: Context::new(),
        }
    }

    pub fn for_rule(rule_id: impl Into<String>, actions: Vec<ActionRef>, context: Context) -> Self {
        Self {
            rule_id: Some(rule_id.into()),
            actions,
            context,
        }
    }
}

/// Per-action results of one firing, in list order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub results: Vec<ExecutionResult>,
}

impl FiringReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub capacity: usize,
    pub high_water: usize,
    pub workers: usize,
    pub running: bool,
}

struct Batch {
    firing: Firing,
    enqueued_at: Instant,
    generation: u64,
    reply: Option<oneshot::Sender<FiringReport>>,
}

struct Running {
    tx: mpsc::UnboundedSender<Batch>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    executor: Arc<ActionExecutor>,
    /// Actions accepted but not yet started
    pending: Mutex<usize>,
    cancel_tx: watch::Sender<u64>,
}

impl Shared {
    fn started(&self, n: usize) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(n);
    }
}

pub struct ActionDispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
    running: Mutex<Option<Running>>,
}

impl ActionDispatcher {
    /// Create a dispatcher and spawn its workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(executor: Arc<ActionExecutor>, config: DispatcherConfig) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        let dispatcher = Self {
            shared: Arc::new(Shared {
                executor,
                pending: Mutex::new(0),
                cancel_tx,
            }),
            config: DispatcherConfig {
                capacity: config.capacity.max(1),
                workers: config.workers.max(1),
            },
            running: Mutex::new(None),
        };
        dispatcher.start();
        dispatcher
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.shared.executor
    }

    /// Spawn workers if they are not running
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..self.config.workers)
            .map(|id| tokio::spawn(worker_loop(id, rx.clone(), self.shared.clone())))
            .collect();
        debug!(workers = self.config.workers, capacity = self.config.capacity, "Dispatcher started");
        *running = Some(Running { tx, workers });
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn enqueue(&self, firing: Firing, reply: Option<oneshot::Sender<FiringReport>>) -> ActionResult<()> {
        let n = firing.actions.len();
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let running = running.as_ref().ok_or(ActionError::ShuttingDown)?;

        let depth = {
            let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            if *pending + n > self.config.capacity {
                warn!(
                    rule_id = ?firing.rule_id,
                    pending = *pending,
                    actions = n,
                    "Action queue full"
                );
                return Err(ActionError::QueueFull {
                    pending: *pending,
                    capacity: self.config.capacity,
                });
            }
            *pending += n;
            *pending
        };
        self.shared.executor.note_queue_depth(depth);

        let batch = Batch {
            firing,
            enqueued_at: Instant::now(),
            generation: *self.shared.cancel_tx.borrow(),
            reply,
        };
        if running.tx.send(batch).is_err() {
            self.shared.started(n);
            return Err(ActionError::ShuttingDown);
        }
        Ok(())
    }

    /// Enqueue a firing atomically; fails with `QueueFull` rather than
    /// accepting part of it
    #[instrument(skip(self, firing), fields(rule_id = ?firing.rule_id, actions = firing.actions.len()))]
    pub fn submit(&self, firing: Firing) -> ActionResult<()> {
        if firing.actions.is_empty() {
            return Ok(());
        }
        self.enqueue(firing, None)
    }

    /// Enqueue a firing and wait for all of its results
    pub async fn submit_and_wait(&self, firing: Firing) -> ActionResult<FiringReport> {
        if firing.actions.is_empty() {
            return Ok(FiringReport {
                rule_id: firing.rule_id,
                results: Vec::new(),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(firing, Some(tx))?;
        rx.await.map_err(|_| ActionError::ShuttingDown)
    }

    /// Run one action immediately, bypassing the queue and its delay
    pub async fn execute(&self, action: &Action) -> ExecutionResult {
        self.shared.executor.execute(action, &Context::new()).await
    }

    /// Run entries in order on the caller's task
    pub async fn execute_sequence(
        &self,
        entries: &[ActionRef],
        stop_on_error: bool,
    ) -> Vec<ExecutionResult> {
        let start = Instant::now();
        let ctx = Context::new();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = match self.shared.executor.resolve(entry) {
                Ok(action) => {
                    tokio::time::sleep_until(deadline(start, action.delay_ms)).await;
                    self.shared.executor.execute(&action, &ctx).await
                }
                Err(e) => unresolved(&self.shared.executor, entry, e),
            };
            let failed = !result.is_success();
            results.push(result);
            if failed && stop_on_error {
                break;
            }
        }
        results
    }

    /// Drop every action that has not started yet
    pub fn cancel_all(&self) -> usize {
        let pending = *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.shared.cancel_tx.send_modify(|g| *g += 1);
        info!(pending, "Cancelling pending actions");
        pending
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            pending: *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()),
            capacity: self.config.capacity,
            high_water: self.shared.executor.stats().queue_high_water,
            workers: self.config.workers,
            running: self.is_running(),
        }
    }

    pub fn stats(&self) -> ActionStats {
        self.shared.executor.stats()
    }

    pub fn reset_stats(&self) {
        self.shared.executor.reset_stats();
    }

    /// Stop accepting work, let queued actions finish within `grace`, then
    /// cancel what is left
    pub async fn shutdown(&self, grace: Duration) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Running { tx, workers }) = running else {
            return;
        };
        drop(tx);

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(grace, futures_join(workers)).await;
        if drained.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "Dispatcher drain timed out, cancelling");
            self.cancel_all();
            for handle in aborts {
                handle.abort();
            }
            *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        }
        self.shared.executor.watcher().stop_all();
        info!("Dispatcher stopped");
    }
}

impl Drop for ActionDispatcher {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            for worker in running.workers {
                worker.abort();
            }
        }
    }
}

async fn futures_join(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        let _ = worker.await;
    }
}

/// `from + delay_ms`, capped at [`MAX_DELAY_MS`]
fn deadline(from: Instant, delay_ms: u64) -> Instant {
    let delay = Duration::from_millis(delay_ms.min(MAX_DELAY_MS));
    from.checked_add(delay).unwrap_or(from)
}

fn unresolved(executor: &ActionExecutor, entry: &ActionRef, error: ActionError) -> ExecutionResult {
    let kind = match entry {
        ActionRef::Template { .. } => "template",
        ActionRef::Inline(a) => a.type_name(),
    };
    warn!(action = kind, error = %error, "Could not resolve action");
    let result = ExecutionResult::failed(kind, error);
    executor.record(&result);
    result
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Batch>>>,
    shared: Arc<Shared>,
) {
    let mut cancel_rx = shared.cancel_tx.subscribe();
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(batch) = batch else {
            break;
        };
        run_batch(batch, &shared, &mut cancel_rx).await;
    }
    debug!(worker = id, "Dispatcher worker stopped");
}

async fn run_batch(batch: Batch, shared: &Shared, cancel_rx: &mut watch::Receiver<u64>) {
    let Batch {
        firing,
        enqueued_at,
        generation,
        reply,
    } = batch;
    let executor = &shared.executor;
    let mut results = Vec::with_capacity(firing.actions.len());

    for entry in &firing.actions {
        // Known delays are waited out before resolving, so template edits
        // made during the wait still apply
        let delay = entry.delay_hint().unwrap_or_else(|| match entry {
            ActionRef::Template { template_id, .. } => executor
                .templates()
                .get(template_id)
                .map(|t| t.action.delay_ms)
                .unwrap_or(0),
            ActionRef::Inline(a) => a.delay_ms,
        });

        if *cancel_rx.borrow() == generation {
            let until = deadline(enqueued_at, delay);
            tokio::select! {
                _ = tokio::time::sleep_until(until) => {}
                _ = wait_cancel(cancel_rx, generation) => {}
            }
        }
        shared.started(1);

        if *cancel_rx.borrow() != generation {
            results.push(ExecutionResult::cancelled(match entry {
                ActionRef::Template { .. } => "template",
                ActionRef::Inline(a) => a.type_name(),
            }));
            continue;
        }

        let result = match executor.resolve(entry) {
            Ok(action) => executor.execute(&action, &firing.context).await,
            Err(e) => unresolved(executor, entry, e),
        };
        results.push(result);
    }

    debug!(
        rule_id = ?firing.rule_id,
        actions = results.len(),
        "Firing complete"
    );
    if let Some(reply) = reply {
        let _ = reply.send(FiringReport {
            rule_id: firing.rule_id,
            results,
        });
    }
}

async fn wait_cancel(rx: &mut watch::Receiver<u64>, generation: u64) {
    while *rx.borrow_and_update() == generation {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, LedAction};
    use crate::capability::mock::MockCapabilities;
    use crate::executor::ExecStatus;
    use crate::template::ActionTemplate;
    use hub_config::MemoryKvStore;
    use hub_event_bus::EventBus;
    use hub_variables::VariableStore;
    use serde_json::json;

    fn setup(config: DispatcherConfig) -> (ActionDispatcher, MockCapabilities) {
        let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
        let mocks = MockCapabilities::new();
        let exec = Arc::new(ActionExecutor::new(vars, mocks.capabilities()));
        (ActionDispatcher::new(exec, config), mocks)
    }

    fn gpio(pin: u32, delay_ms: u64) -> ActionRef {
        Action::from_json(&json!({"type": "gpio", "pin": pin, "level": true, "delay_ms": delay_ms}))
            .unwrap()
            .into()
    }

    fn led(color: &str) -> Action {
        Action::new(ActionKind::Led(LedAction {
            device: "board".into(),
            index: 255,
            color: Some(color.into()),
            r: None,
            g: None,
            b: None,
            effect: None,
            duration_ms: None,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_actions_start_in_list_order() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let report = d
            .submit_and_wait(Firing::new(vec![gpio(1, 0), gpio(2, 0), gpio(3, 0)]))
            .await
            .unwrap();
        assert_eq!(report.success_count(), 3);
        let pins: Vec<u32> = mocks.gpio.calls().iter().map(|c| c.0).collect();
        assert_eq!(pins, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_measured_from_enqueue() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let t0 = Instant::now();
        d.submit_and_wait(Firing::new(vec![gpio(1, 300), gpio(2, 300), gpio(3, 500)]))
            .await
            .unwrap();
        let calls = mocks.gpio.calls();
        // Not 600ms: the second delay overlaps the first
        let at = |i: usize| (calls[i].2 - t0).as_millis();
        assert!((300..310).contains(&at(0)));
        assert!((300..310).contains(&at(1)));
        assert!((500..510).contains(&at(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_resolved_at_dequeue() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let templates = d.executor().templates().clone();
        templates.add(ActionTemplate::new("tpl1", led("#00FF00"))).unwrap();

        let waiter = d.submit_and_wait(Firing::new(vec![ActionRef::template("tpl1", Some(200))]));
        let edit = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            templates.update(ActionTemplate::new("tpl1", led("red"))).unwrap();
        };
        let (report, ()) = tokio::join!(waiter, edit);

        assert!(report.unwrap().results[0].is_success());
        assert_eq!(
            mocks.led.calls()[0].color,
            Some(crate::action::Rgb::new(255, 0, 0))
        );
        assert_eq!(templates.get("tpl1").unwrap().use_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_is_capped() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let huge = Action::from_json(&json!({"type": "gpio", "pin": 9, "level": 1}))
            .unwrap()
            .with_delay(u64::MAX);

        let t0 = Instant::now();
        let report = d
            .submit_and_wait(Firing::new(vec![huge.clone().into()]))
            .await
            .unwrap();
        assert!(report.results[0].is_success());
        let waited = (mocks.gpio.calls()[0].2 - t0).as_millis();
        let max = u128::from(MAX_DELAY_MS);
        assert!((max..max + 10).contains(&waited));

        // The worker survived and still serves normal firings
        let report = d.submit_and_wait(Firing::new(vec![gpio(1, 0)])).await.unwrap();
        assert!(report.results[0].is_success());

        let results = d.execute_sequence(&[huge.into()], true).await;
        assert!(results[0].is_success());
        assert_eq!(mocks.gpio.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_whole_firing() {
        let (d, _) = setup(DispatcherConfig {
            capacity: 3,
            workers: 1,
        });
        d.submit(Firing::new(vec![gpio(1, 60_000), gpio(2, 60_000)])).unwrap();
        let err = d
            .submit(Firing::new(vec![gpio(3, 0), gpio(4, 0)]))
            .unwrap_err();
        assert!(matches!(err, ActionError::QueueFull { .. }));
        assert_eq!(hub_core::HubError::from(err).code(), hub_core::ErrorCode::Busy);

        let status = d.queue_status();
        assert_eq!(status.capacity, 3);
        assert_eq!(status.high_water, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_firing() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let report = d
            .submit_and_wait(Firing::new(vec![
                ActionRef::template("missing", None),
                gpio(7, 0),
            ]))
            .await
            .unwrap();
        assert_eq!(report.results[0].status, ExecStatus::Failure);
        assert!(report.results[1].is_success());
        assert_eq!(mocks.gpio.calls().len(), 1);
        assert_eq!(d.stats().total_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let waiter = d.submit_and_wait(Firing::new(vec![gpio(1, 10_000), gpio(2, 10_000)]));
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(d.cancel_all(), 2);
        };
        let (report, ()) = tokio::join!(waiter, cancel);
        let report = report.unwrap();
        assert!(report
            .results
            .iter()
            .all(|r| r.status == ExecStatus::Cancelled));
        assert!(mocks.gpio.calls().is_empty());
        assert_eq!(d.queue_status().pending, 0);

        // New work still runs after a cancel
        let report = d.submit_and_wait(Firing::new(vec![gpio(3, 0)])).await.unwrap();
        assert!(report.results[0].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sequence_stop_on_error() {
        let (d, mocks) = setup(DispatcherConfig::default());
        let entries = vec![gpio(1, 0), ActionRef::template("nope", None), gpio(2, 0)];

        let all = d.execute_sequence(&entries, false).await;
        assert_eq!(all.len(), 3);
        let stopped = d.execute_sequence(&entries, true).await;
        assert_eq!(stopped.len(), 2);
        assert_eq!(mocks.gpio.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_then_rejects() {
        let (d, mocks) = setup(DispatcherConfig::default());
        d.submit(Firing::new(vec![gpio(1, 100)])).unwrap();
        d.shutdown(Duration::from_secs(2)).await;
        assert_eq!(mocks.gpio.calls().len(), 1);
        assert!(matches!(
            d.submit(Firing::new(vec![gpio(2, 0)])),
            Err(ActionError::ShuttingDown)
        ));

        d.start();
        d.submit_and_wait(Firing::new(vec![gpio(3, 0)])).await.unwrap();
        assert_eq!(mocks.gpio.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_grace_expires() {
        let (d, mocks) = setup(DispatcherConfig::default());
        d.submit(Firing::new(vec![gpio(1, 60_000)])).unwrap();
        d.shutdown(Duration::from_millis(500)).await;
        assert!(mocks.gpio.calls().is_empty());
        assert_eq!(d.queue_status().pending, 0);
        assert!(!d.queue_status().running);
    }
}
