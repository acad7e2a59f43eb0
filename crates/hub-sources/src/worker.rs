//! What source workers share, and the timing helpers they use

use crate::slot::SourceSlot;
use crate::source::SourceKind;
use crate::{rest, socketio, variable, websocket};
use async_trait::async_trait;
use hub_actions::{ActionExecutor, SshCommandRegistry, SshExecutor, SshHostRegistry};
use hub_core::HubResult;
use hub_variables::VariableStore;
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// In-process RPC used by REST sources that point at this hub
#[async_trait]
pub trait LocalApi: Send + Sync {
    async fn call(&self, method: &str, params: serde_json::Value) -> HubResult<serde_json::Value>;
}

/// SSH access for `variable` sources
#[derive(Clone)]
pub struct SshAccess {
    pub executor: Option<Arc<dyn SshExecutor>>,
    pub hosts: Arc<SshHostRegistry>,
    pub commands: Arc<SshCommandRegistry>,
}

impl SshAccess {
    /// Share the registries and SSH capability of an action executor
    pub fn from_executor(executor: &ActionExecutor) -> Self {
        Self {
            executor: executor.capabilities().ssh.clone(),
            hosts: executor.ssh_hosts().clone(),
            commands: executor.ssh_commands().clone(),
        }
    }

    pub fn none() -> Self {
        Self {
            executor: None,
            hosts: Arc::new(SshHostRegistry::new()),
            commands: Arc::new(SshCommandRegistry::new()),
        }
    }
}

pub(crate) struct WorkerEnv {
    pub(crate) vars: Arc<VariableStore>,
    pub(crate) http: reqwest::Client,
    pub(crate) ssh: SshAccess,
    local_api: RwLock<Option<Arc<dyn LocalApi>>>,
}

impl WorkerEnv {
    pub(crate) fn new(vars: Arc<VariableStore>, ssh: SshAccess) -> Self {
        Self {
            vars,
            http: reqwest::Client::new(),
            ssh,
            local_api: RwLock::new(None),
        }
    }

    pub(crate) fn local_api(&self) -> Option<Arc<dyn LocalApi>> {
        self.local_api
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_local_api(&self, api: Option<Arc<dyn LocalApi>>) {
        *self.local_api.write().unwrap_or_else(|e| e.into_inner()) = api;
    }
}

/// A running worker task and its stop signal
///
/// Dropping the handle drops the sender, which the worker also treats as
/// a stop.
pub(crate) struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(slot: Arc<SourceSlot>, env: Arc<WorkerEnv>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let kind = slot.config().kind.type_name();
        debug!(source = %slot.id(), kind, "Spawning source worker");
        let task = match &slot.config().kind {
            SourceKind::Rest(_) => tokio::spawn(rest::run(slot.clone(), env, stop_rx)),
            SourceKind::WebSocket(_) => tokio::spawn(websocket::run(slot.clone(), env, stop_rx)),
            SourceKind::SocketIo(_) => tokio::spawn(socketio::run(slot.clone(), env, stop_rx)),
            SourceKind::Variable(_) => tokio::spawn(variable::run(slot.clone(), env, stop_rx)),
        };
        Self { stop, task }
    }

    /// Signal the worker and wait up to `grace` for it to exit
    pub(crate) async fn stop(self, grace: Duration) {
        let _ = self.stop.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            abort.abort();
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Reconnect delay stretched by up to 10%
pub(crate) fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.1);
    base.mul_f64(factor)
}

pub(crate) fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Resolves once a stop is requested or the manager went away
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `d`; returns true when a stop arrived first
pub(crate) async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => stop_requested(stop),
        _ = stopped(stop) => true,
    }
}
