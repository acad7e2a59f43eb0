//! Actions for the automation hub
//!
//! This crate provides:
//! - The [`Action`] model and [`ActionRef`] (inline action or template reference)
//! - [`TemplateRegistry`] of reusable, named actions
//! - [`SshHostRegistry`] and [`SshCommandRegistry`]
//! - [`ActionExecutor`], which runs one action against the [`Capabilities`]
//! - [`ActionDispatcher`], the bounded, ordered, delayed action queue
//! - [`ServiceWatcher`] for services started in the background over SSH
//! - [`ExecEventHub`] for streaming command output to a session

pub mod action;
pub mod capability;
mod dispatcher;
mod error;
mod exec_events;
pub mod expand;
mod executor;
mod ssh;
mod template;
mod watcher;

pub use action::{Action, ActionKind, ActionRef, DeviceCommand, Rgb, MAX_DELAY_MS};
pub use capability::{
    Capabilities, CliRunner, CommandOutput, DeviceController, GpioController, LedController,
    LoggingDriver, OpenSshExecutor, ProcessCliRunner, SshExecutor,
};
pub use dispatcher::{
    ActionDispatcher, DispatcherConfig, Firing, FiringReport, QueueStatus, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_WORKERS,
};
pub use error::{ActionError, ActionResult};
pub use exec_events::{ExecEvent, ExecEventHub};
pub use executor::{
    ActionExecutor, ActionStats, ExecStatus, ExecutionResult, DEFAULT_ACTION_TIMEOUT_MS,
    DEFAULT_CLI_TIMEOUT_MS, DEFAULT_SSH_TIMEOUT_MS, DEFAULT_WEBHOOK_TIMEOUT_MS,
};
pub use ssh::{
    SshCommand, SshCommandRegistry, SshHost, SshHostRegistry, SshTarget, MAX_SSH_COMMANDS,
    MAX_SSH_HOSTS,
};
pub use template::{ActionTemplate, TemplateRegistry, MAX_TEMPLATES};
pub use watcher::{ServiceWatcher, WatchConfig, WatchInfo, WatchOutcome};
