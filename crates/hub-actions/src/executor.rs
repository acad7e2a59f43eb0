//! Action executor
//!
//! Runs one action under its timeout against the configured capabilities
//! and records the outcome in [`ActionStats`].

use crate::action::{
    Action, ActionKind, ActionRef, CliAction, GpioAction, LedAction, LogAction, SetVarAction,
    SshCmdAction, SshCmdRefAction, WebhookAction,
};
use crate::capability::{Capabilities, CommandOutput};
use crate::error::{ActionError, ActionResult};
use crate::exec_events::{ExecEvent, ExecEventHub};
use crate::expand::{bound_output, expand_variables, nohup_log_file, nohup_wrap, safe_name};
use crate::ssh::{SshCommandRegistry, SshHostRegistry, SshTarget};
use crate::template::TemplateRegistry;
use crate::watcher::{ServiceWatcher, WatchConfig};
use chrono::Utc;
use hub_core::{Context, HubError, HubResult, Value};
use hub_variables::VariableStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_CLI_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SSH_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on any per-action timeout
pub const MAX_ACTION_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
/// Slack given to capabilities that enforce their own timeout
const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action_type: String,
    pub status: ExecStatus,
    pub duration_ms: u64,
    /// At most 1 KiB
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at_ms: i64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }

    pub(crate) fn failed(action_type: &str, error: impl ToString) -> Self {
        Self {
            action_type: action_type.to_string(),
            status: ExecStatus::Failure,
            duration_ms: 0,
            output: String::new(),
            exit_code: None,
            error: Some(error.to_string()),
            started_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub(crate) fn cancelled(action_type: &str) -> Self {
        Self {
            status: ExecStatus::Cancelled,
            error: None,
            ..Self::failed(action_type, "")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats {
    pub total_executed: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub queue_high_water: usize,
    pub ssh_commands: u64,
    pub cli_commands: u64,
    pub webhooks: u64,
    pub led_actions: u64,
    pub gpio_actions: u64,
    pub device_actions: u64,
    /// Unix milliseconds of the last completed action
    pub last_execution_ms: i64,
}

/// What a successful run produced; `success == false` marks a command that
/// ran but reported failure
struct Outcome {
    success: bool,
    output: String,
    exit_code: Option<i32>,
}

impl Outcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            exit_code: None,
        }
    }

    fn from_command(out: &CommandOutput) -> Self {
        let text = if out.stdout.trim().is_empty() {
            &out.stderr
        } else {
            &out.stdout
        };
        Self {
            success: out.exit_code == 0,
            output: bound_output(text),
            exit_code: Some(out.exit_code),
        }
    }
}

pub struct ActionExecutor {
    vars: Arc<VariableStore>,
    templates: Arc<TemplateRegistry>,
    ssh_hosts: Arc<SshHostRegistry>,
    ssh_commands: Arc<SshCommandRegistry>,
    caps: Capabilities,
    http: reqwest::Client,
    watcher: Arc<ServiceWatcher>,
    exec_events: Arc<ExecEventHub>,
    stats: Mutex<ActionStats>,
}

impl ActionExecutor {
    pub fn new(vars: Arc<VariableStore>, caps: Capabilities) -> Self {
        let watcher = Arc::new(ServiceWatcher::new(vars.clone(), caps.ssh.clone()));
        Self {
            vars,
            templates: Arc::new(TemplateRegistry::new()),
            ssh_hosts: Arc::new(SshHostRegistry::new()),
            ssh_commands: Arc::new(SshCommandRegistry::new()),
            caps,
            http: reqwest::Client::new(),
            watcher,
            exec_events: Arc::new(ExecEventHub::new()),
            stats: Mutex::new(ActionStats::default()),
        }
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.vars
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    pub fn ssh_hosts(&self) -> &Arc<SshHostRegistry> {
        &self.ssh_hosts
    }

    pub fn ssh_commands(&self) -> &Arc<SshCommandRegistry> {
        &self.ssh_commands
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn watcher(&self) -> &Arc<ServiceWatcher> {
        &self.watcher
    }

    pub fn exec_events(&self) -> &Arc<ExecEventHub> {
        &self.exec_events
    }

    pub fn stats(&self) -> ActionStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = ActionStats::default();
    }

    pub(crate) fn note_queue_depth(&self, depth: usize) {
        let mut stats = self.lock_stats();
        stats.queue_high_water = stats.queue_high_water.max(depth);
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ActionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turn a rule action entry into a runnable action
    pub fn resolve(&self, entry: &ActionRef) -> ActionResult<Action> {
        match entry {
            ActionRef::Inline(action) => Ok(action.clone()),
            ActionRef::Template {
                template_id,
                delay_ms,
            } => self.templates.resolve(template_id, *delay_ms),
        }
    }

    fn timeout_for(&self, action: &Action) -> Duration {
        let ms = match &action.kind {
            ActionKind::Cli(c) => c.timeout_ms,
            ActionKind::SshCmd(s) => s.timeout_ms.unwrap_or(DEFAULT_SSH_TIMEOUT_MS),
            ActionKind::SshCmdRef(r) => self
                .ssh_commands
                .get(&r.cmd_id)
                .map(|c| c.timeout_sec.saturating_mul(1000))
                .unwrap_or(DEFAULT_SSH_TIMEOUT_MS),
            ActionKind::Webhook(w) => w.timeout_ms,
            ActionKind::Gpio(g) => DEFAULT_ACTION_TIMEOUT_MS.max(g.pulse_ms.saturating_add(1000)),
            _ => DEFAULT_ACTION_TIMEOUT_MS,
        };
        Duration::from_millis(ms.clamp(1, MAX_ACTION_TIMEOUT_MS))
    }

    /// Execute one action now, ignoring its `delay_ms`
    pub async fn execute(&self, action: &Action, ctx: &Context) -> ExecutionResult {
        let action_type = action.type_name();
        let started_at_ms = Utc::now().timestamp_millis();
        let started = Instant::now();
        let limit = self.timeout_for(action);
        self.count_kind(&action.kind);

        debug!(action = action_type, timeout_ms = limit.as_millis() as u64, "Executing action");
        let run = tokio::time::timeout(limit + TIMEOUT_GRACE, self.run(action, limit, ctx)).await;

        let mut result = ExecutionResult {
            action_type: action_type.to_string(),
            status: ExecStatus::Success,
            duration_ms: started.elapsed().as_millis() as u64,
            output: String::new(),
            exit_code: None,
            error: None,
            started_at_ms,
        };
        match run {
            Ok(Ok(outcome)) => {
                result.status = if outcome.success {
                    ExecStatus::Success
                } else {
                    ExecStatus::Failure
                };
                result.output = outcome.output;
                result.exit_code = outcome.exit_code;
            }
            Ok(Err(HubError::Timeout(msg))) => {
                result.status = ExecStatus::Timeout;
                result.error = Some(msg);
            }
            Ok(Err(e)) => {
                result.status = ExecStatus::Failure;
                result.error = Some(e.public_message());
            }
            Err(_) => {
                result.status = ExecStatus::Timeout;
                result.error = Some(format!("exceeded {}ms", limit.as_millis()));
            }
        }

        match result.status {
            ExecStatus::Success => trace!(action = action_type, ms = result.duration_ms, "Action done"),
            _ => warn!(
                action = action_type,
                status = ?result.status,
                error = ?result.error,
                "Action did not succeed"
            ),
        }
        self.record(&result);
        result
    }

    fn count_kind(&self, kind: &ActionKind) {
        let mut stats = self.lock_stats();
        match kind {
            ActionKind::SshCmd(_) | ActionKind::SshCmdRef(_) => stats.ssh_commands += 1,
            ActionKind::Cli(_) => stats.cli_commands += 1,
            ActionKind::Webhook(_) => stats.webhooks += 1,
            ActionKind::Led(_) => stats.led_actions += 1,
            ActionKind::Gpio(_) => stats.gpio_actions += 1,
            ActionKind::DeviceCtrl(_) => stats.device_actions += 1,
            ActionKind::Log(_) | ActionKind::SetVar(_) => {}
        }
    }

    pub(crate) fn record(&self, result: &ExecutionResult) {
        let mut stats = self.lock_stats();
        stats.total_executed += 1;
        match result.status {
            ExecStatus::Success => stats.total_success += 1,
            ExecStatus::Timeout => stats.total_timeout += 1,
            ExecStatus::Failure | ExecStatus::Cancelled => stats.total_failed += 1,
        }
        stats.last_execution_ms = Utc::now().timestamp_millis();
    }

    async fn run(&self, action: &Action, limit: Duration, ctx: &Context) -> HubResult<Outcome> {
        match &action.kind {
            ActionKind::Led(led) => self.run_led(led).await,
            ActionKind::Gpio(gpio) => self.run_gpio(gpio).await,
            ActionKind::DeviceCtrl(dev) => {
                let ctl = self
                    .caps
                    .device
                    .as_ref()
                    .ok_or_else(|| missing("device control"))?;
                ctl.control(&dev.device, dev.action).await?;
                Ok(Outcome::ok(format!("{} {}", dev.device, dev.action.as_str())))
            }
            ActionKind::SshCmd(ssh) => self.run_ssh(ssh, limit).await,
            ActionKind::SshCmdRef(r) => self.run_ssh_ref(r, limit).await.map_err(HubError::from),
            ActionKind::Cli(cli) => self.run_cli(cli, limit).await,
            ActionKind::Webhook(hook) => self.run_webhook(hook, limit).await,
            ActionKind::Log(log) => {
                self.run_log(log);
                Ok(Outcome::ok(""))
            }
            ActionKind::SetVar(set) => self.run_set_var(set, ctx),
        }
    }

    async fn run_led(&self, led: &LedAction) -> HubResult<Outcome> {
        let ctl = self.caps.led.as_ref().ok_or_else(|| missing("LED"))?;
        let color = led
            .rgb()
            .ok_or_else(|| HubError::invalid("unparseable LED color"))?;
        let device = led.device_name();
        match &led.effect {
            Some(effect) if !effect.is_empty() => {
                ctl.run_effect(device, effect, led.color.as_ref().map(|_| color), led.duration_ms)
                    .await?;
                Ok(Outcome::ok(format!("{device} effect {effect}")))
            }
            _ => {
                ctl.set_color(device, led.index, color).await?;
                Ok(Outcome::ok(format!("{device} {color}")))
            }
        }
    }

    async fn run_gpio(&self, gpio: &GpioAction) -> HubResult<Outcome> {
        let ctl = self.caps.gpio.as_ref().ok_or_else(|| missing("GPIO"))?;
        ctl.set_level(gpio.pin, gpio.level).await?;
        if gpio.pulse_ms > 0 {
            tokio::time::sleep(Duration::from_millis(gpio.pulse_ms)).await;
            ctl.set_level(gpio.pin, !gpio.level).await?;
        }
        Ok(Outcome::ok(format!("pin {} = {}", gpio.pin, gpio.level as u8)))
    }

    async fn exec_remote(
        &self,
        target: &SshTarget,
        command: &str,
        limit: Duration,
        session_id: Option<&str>,
    ) -> HubResult<CommandOutput> {
        let ssh = self.caps.ssh.as_ref().ok_or_else(|| missing("SSH"))?;
        let publish = |event: ExecEvent| {
            if let Some(sid) = session_id {
                self.exec_events.publish(sid, event);
            }
        };

        publish(ExecEvent::ExecStart {
            command: command.to_string(),
        });
        let result = match tokio::time::timeout(limit, ssh.exec(target, command, limit)).await {
            Ok(r) => r,
            Err(_) => Err(HubError::Timeout(format!(
                "ssh command exceeded {}ms",
                limit.as_millis()
            ))),
        };
        match &result {
            Ok(out) => {
                if !out.stdout.is_empty() {
                    publish(ExecEvent::ExecOutput {
                        data: out.stdout.clone(),
                        is_stderr: false,
                    });
                }
                if !out.stderr.is_empty() {
                    publish(ExecEvent::ExecOutput {
                        data: out.stderr.clone(),
                        is_stderr: true,
                    });
                }
                publish(ExecEvent::ExecDone {
                    exit_code: out.exit_code,
                });
            }
            Err(HubError::Timeout(_)) => publish(ExecEvent::ExecCancelled),
            Err(e) => publish(ExecEvent::ExecError {
                message: e.public_message(),
            }),
        }
        result
    }

    async fn run_ssh(&self, ssh: &SshCmdAction, limit: Duration) -> HubResult<Outcome> {
        let target = self.ssh_hosts.resolve(&ssh.host_ref, &self.vars)?;
        let mut command = expand_variables(&ssh.command, &self.vars);
        let safe = safe_name(ssh.var_prefix.as_deref().unwrap_or(&ssh.command));
        if ssh.nohup {
            command = nohup_wrap(&command, &safe);
        }

        let result = self
            .exec_remote(&target, &command, limit, ssh.session_id.as_deref())
            .await;

        if let Some(prefix) = &ssh.var_prefix {
            match &result {
                Ok(out) => {
                    let outcome = Outcome::from_command(out);
                    self.write_var(&format!("{prefix}.exit_code"), Value::Int(out.exit_code as i64));
                    self.write_var(&format!("{prefix}.status"), status_value(outcome.success));
                    self.write_var(&format!("{prefix}.output"), Value::string(outcome.output));
                }
                Err(HubError::Timeout(_)) => {
                    self.write_var(&format!("{prefix}.status"), Value::string("timeout"))
                }
                Err(_) => self.write_var(&format!("{prefix}.status"), Value::string("error")),
            }
        }

        let out = result?;
        let outcome = Outcome::from_command(&out);
        if outcome.success && ssh.service_mode {
            if let Some(ready) = &ssh.ready_pattern {
                let log_file = ssh
                    .log_file
                    .clone()
                    .unwrap_or_else(|| nohup_log_file(&safe));
                self.watcher
                    .start(WatchConfig {
                        target,
                        host_ref: ssh.host_ref.clone(),
                        log_file,
                        ready_pattern: ready.clone(),
                        fail_pattern: ssh.fail_pattern.clone(),
                        var_prefix: ssh.var_prefix.clone().unwrap_or(safe),
                        ready_timeout_sec: ssh.ready_timeout_sec,
                        check_interval_ms: ssh.check_interval_ms,
                    })
                    .map_err(HubError::from)?;
            }
        }
        Ok(outcome)
    }

    async fn run_ssh_ref(&self, r: &SshCmdRefAction, limit: Duration) -> ActionResult<Outcome> {
        let cmd = self
            .ssh_commands
            .get(&r.cmd_id)
            .ok_or_else(|| ActionError::CommandNotFound(r.cmd_id.clone()))?;
        if !cmd.enabled {
            return Err(ActionError::CommandDisabled(r.cmd_id.clone()));
        }
        let target = self.ssh_hosts.resolve(&cmd.host_id, &self.vars)?;

        let safe = safe_name(&cmd.name);
        let mut command = expand_variables(&cmd.command, &self.vars);
        if cmd.nohup {
            command = nohup_wrap(&command, &safe);
        }
        info!(cmd_id = %cmd.id, host = %target.host, "Executing stored SSH command");

        let result = self.exec_remote(&target, &command, limit, None).await;
        self.ssh_commands.touch_exec_time(&cmd.id);

        let out = match result {
            Ok(out) => out,
            Err(e) => {
                if let Some(var) = &cmd.var_name {
                    let status = if matches!(e, HubError::Timeout(_)) { "timeout" } else { "error" };
                    self.write_var(&format!("{var}.status"), Value::string(status));
                }
                return Err(e.into());
            }
        };
        let outcome = Outcome::from_command(&out);

        if let Some(var) = &cmd.var_name {
            self.write_var(&format!("{var}.exit_code"), Value::Int(out.exit_code as i64));
            self.write_var(&format!("{var}.status"), status_value(outcome.success));
            self.write_var(&format!("{var}.timestamp"), Value::Int(Utc::now().timestamp()));

            if cmd.nohup && cmd.service_mode {
                if let Some(ready) = &cmd.ready_pattern {
                    self.watcher.start(WatchConfig {
                        target,
                        host_ref: cmd.host_id.clone(),
                        log_file: nohup_log_file(&safe),
                        ready_pattern: ready.clone(),
                        fail_pattern: cmd.service_fail_pattern.clone(),
                        var_prefix: var.clone(),
                        ready_timeout_sec: cmd.ready_timeout_sec,
                        check_interval_ms: cmd.ready_check_interval_ms,
                    })?;
                }
            }
        }
        Ok(outcome)
    }

    async fn run_cli(&self, cli: &CliAction, limit: Duration) -> HubResult<Outcome> {
        let runner = self.caps.cli.as_ref().ok_or_else(|| missing("CLI"))?;
        let command = expand_variables(&cli.command, &self.vars);
        let out = match tokio::time::timeout(limit, runner.run(&command, limit)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(HubError::Timeout(format!(
                    "command exceeded {}ms",
                    limit.as_millis()
                )))
            }
        };
        let outcome = Outcome::from_command(&out);
        if let Some(var) = &cli.var_name {
            self.write_var(&format!("{var}.exit_code"), Value::Int(out.exit_code as i64));
            self.write_var(&format!("{var}.status"), status_value(outcome.success));
            self.write_var(&format!("{var}.output"), Value::string(outcome.output.trim_end()));
        }
        Ok(outcome)
    }

    async fn run_webhook(&self, hook: &WebhookAction, limit: Duration) -> HubResult<Outcome> {
        let method = reqwest::Method::from_bytes(hook.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| HubError::invalid(format!("bad method {}", hook.method)))?;
        let mut req = self.http.request(method, &hook.url).timeout(limit);
        for (k, v) in &hook.headers {
            req = req.header(k, v);
        }
        if let Some(body) = &hook.body_template {
            let body = expand_variables(body, &self.vars);
            if !hook.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                req = req.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                HubError::Timeout(format!("webhook {}", hook.url))
            } else {
                HubError::Connection(format!("webhook {}: {e}", hook.url))
            }
        })?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Ok(Outcome {
            success: status.is_success(),
            output: bound_output(&text),
            exit_code: Some(status.as_u16() as i32),
        })
    }

    fn run_log(&self, log: &LogAction) {
        let message = expand_variables(&log.message, &self.vars);
        match log.level {
            1 => error!(target: "automation", "{message}"),
            2 => warn!(target: "automation", "{message}"),
            3 => info!(target: "automation", "{message}"),
            4 => debug!(target: "automation", "{message}"),
            _ => trace!(target: "automation", "{message}"),
        }
    }

    fn run_set_var(&self, set: &SetVarAction, ctx: &Context) -> HubResult<Outcome> {
        let value = match &set.value {
            Value::String(s) => Value::string(expand_variables(s, &self.vars)),
            other => other.clone(),
        };
        let rendered = value.to_string();
        self.vars
            .upsert(&set.variable, value, ctx.child())
            .map_err(HubError::from)?;
        Ok(Outcome::ok(format!("{} = {rendered}", set.variable)))
    }

    fn write_var(&self, name: &str, value: Value) {
        if let Err(e) = self.vars.upsert(name, value, Context::new()) {
            warn!(variable = %name, error = %e, "Failed to write action result variable");
        }
    }
}

fn status_value(success: bool) -> Value {
    Value::string(if success { "success" } else { "failed" })
}

fn missing(what: &str) -> HubError {
    HubError::InvalidState(format!("{what} capability not available"))
}
