//! SSH-derived variable sources
//!
//! A command source runs a remote command and writes the bundle
//! `{prefix}.status`, `.exit_code`, `.extracted`, `.expect_matched`,
//! `.fail_matched`, `.host` and `.timestamp`. Without a command the source
//! mirrors variables that already exist.

use crate::error::{SourceError, SourceResult};
use crate::slot::SourceSlot;
use crate::source::{Source, SourceKind, SourceState, VariableParams};
use crate::worker::{sleep_or_stop, stopped, WorkerEnv};
use chrono::Utc;
use hub_actions::expand::expand_variables;
use hub_actions::{ActionError, CommandOutput};
use hub_core::{Context, HubError, HubResult, Value};
use hub_variables::{Variable, VariableError, VariableStore};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Suffixes of the bundle, in write order
pub const BUNDLE_SUFFIXES: [&str; 7] = [
    "status",
    "exit_code",
    "extracted",
    "expect_matched",
    "fail_matched",
    "host",
    "timestamp",
];

/// Extra slot written by `ssh_cmd` actions and copied by prefix mirrors
const OUTPUT_SUFFIX: &str = "output";

const EXEC_GRACE: Duration = Duration::from_millis(500);

/// The seven values written after one command run
#[derive(Debug, Clone, PartialEq)]
pub struct SshBundle {
    pub status: &'static str,
    pub exit_code: i64,
    pub extracted: String,
    pub expect_matched: bool,
    pub fail_matched: bool,
    pub host: String,
    pub timestamp: i64,
}

/// Compiled `expect`/`fail`/`extract` patterns
#[derive(Debug, Default)]
pub struct BundlePatterns {
    pub expect: Option<Regex>,
    pub fail: Option<Regex>,
    pub extract: Option<Regex>,
}

impl BundlePatterns {
    pub fn compile(params: &VariableParams) -> SourceResult<Self> {
        let compile = |p: &Option<String>| -> SourceResult<Option<Regex>> {
            match p.as_deref().filter(|s| !s.is_empty()) {
                Some(p) => Regex::new(p)
                    .map(Some)
                    .map_err(|e| SourceError::InvalidConfig(format!("pattern '{}': {}", p, e))),
                None => Ok(None),
            }
        };
        Ok(Self {
            expect: compile(&params.ssh_expect_pattern)?,
            fail: compile(&params.ssh_fail_pattern)?,
            extract: compile(&params.ssh_extract_pattern)?,
        })
    }
}

impl SshBundle {
    /// Interpret a command result
    ///
    /// A fail-pattern match or a non-zero exit always means `failed`. A
    /// configured expect pattern must also match for `success`.
    pub fn evaluate(result: &HubResult<CommandOutput>, patterns: &BundlePatterns, host: &str) -> Self {
        let timestamp = Utc::now().timestamp();
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                let status = if matches!(e, HubError::Timeout(_)) {
                    "timeout"
                } else {
                    "failed"
                };
                return Self {
                    status,
                    exit_code: -1,
                    extracted: String::new(),
                    expect_matched: false,
                    fail_matched: false,
                    host: host.to_string(),
                    timestamp,
                };
            }
        };

        let stdout = out.stdout.as_str();
        let expect_matched = patterns.expect.as_ref().is_some_and(|r| r.is_match(stdout));
        let fail_matched = patterns.fail.as_ref().is_some_and(|r| r.is_match(stdout));
        let extracted = patterns
            .extract
            .as_ref()
            .and_then(|r| r.captures(stdout))
            .and_then(|c| c.get(1).or_else(|| c.get(0)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let status = if fail_matched || out.exit_code != 0 {
            "failed"
        } else if patterns.expect.is_some() && !expect_matched {
            "failed"
        } else {
            "success"
        };

        Self {
            status,
            exit_code: i64::from(out.exit_code),
            extracted,
            expect_matched,
            fail_matched,
            host: host.to_string(),
            timestamp,
        }
    }

    pub fn entries(&self) -> [(&'static str, Value); 7] {
        [
            ("status", Value::from(self.status)),
            ("exit_code", Value::Int(self.exit_code)),
            ("extracted", Value::string_truncated(self.extracted.as_str()).0),
            ("expect_matched", Value::Bool(self.expect_matched)),
            ("fail_matched", Value::Bool(self.fail_matched)),
            ("host", Value::from(self.host.as_str())),
            ("timestamp", Value::Int(self.timestamp)),
        ]
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "status": self.status,
            "exit_code": self.exit_code,
            "extracted": self.extracted,
            "expect_matched": self.expect_matched,
            "fail_matched": self.fail_matched,
            "host": self.host,
            "timestamp": self.timestamp,
        })
    }
}

/// Register the bundle with typed empty values, leaving existing ones alone
pub fn precreate_bundle(prefix: &str, source_id: &str, vars: &VariableStore) -> usize {
    let defaults: [(&str, Value); 7] = [
        ("status", Value::from("")),
        ("exit_code", Value::Int(0)),
        ("extracted", Value::from("")),
        ("expect_matched", Value::Bool(false)),
        ("fail_matched", Value::Bool(false)),
        ("host", Value::from("")),
        ("timestamp", Value::Int(0)),
    ];
    let mut created = 0;
    for (suffix, value) in defaults {
        let name = format!("{}.{}", prefix, suffix);
        if vars.exists(&name) {
            continue;
        }
        match vars.register(Variable::new(name.as_str(), value).with_source(source_id)) {
            Ok(()) => created += 1,
            Err(VariableError::AlreadyExists(_)) => {}
            Err(e) => warn!(variable = %name, error = %e, "Could not pre-create bundle variable"),
        }
    }
    created
}

/// Write one bundle value: set when present, register otherwise
fn write_bundle_value(name: &str, value: Value, source_id: &str, vars: &VariableStore) -> SourceResult<()> {
    match vars.set(name, value.clone(), Context::for_source(source_id)) {
        Ok(_) => Ok(()),
        Err(VariableError::NotFound(_)) => {
            vars.register(Variable::new(name, value).with_source(source_id))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write the bundle under `prefix`; returns how many writes failed
pub fn write_bundle(bundle: &SshBundle, prefix: &str, source_id: &str, vars: &VariableStore) -> usize {
    let mut failed = 0;
    for (suffix, value) in bundle.entries() {
        let name = format!("{}.{}", prefix, suffix);
        if let Err(e) = write_bundle_value(&name, value, source_id, vars) {
            warn!(variable = %name, error = %e, "Bundle write rejected");
            failed += 1;
        }
    }
    failed
}

async fn run_command(slot: &SourceSlot, env: &WorkerEnv, source: &Source, params: &VariableParams) -> SourceResult<()> {
    let (host_ref, command, timeout_sec) = match &params.ssh_cmd_id {
        Some(cmd_id) => {
            let cmd = env
                .ssh
                .commands
                .get(cmd_id)
                .ok_or_else(|| ActionError::CommandNotFound(cmd_id.clone()))?;
            if !cmd.enabled {
                return Err(ActionError::CommandDisabled(cmd_id.clone()).into());
            }
            env.ssh.commands.touch_exec_time(cmd_id);
            (cmd.host_id, cmd.command, cmd.timeout_sec)
        }
        None => (
            params.ssh_host_id.clone().unwrap_or_default(),
            params.ssh_command.clone().unwrap_or_default(),
            params.ssh_timeout,
        ),
    };

    let executor = env
        .ssh
        .executor
        .clone()
        .ok_or_else(|| HubError::InvalidState("no SSH executor configured".into()))?;
    let target = env.ssh.hosts.resolve(&host_ref, &env.vars)?;
    let patterns = BundlePatterns::compile(params)?;
    let command = expand_variables(&command, &env.vars);
    let limit = Duration::from_secs(timeout_sec.max(1));

    debug!(source = %source.id, host = %target.host, %command, "Running source command");
    let result = match tokio::time::timeout(limit + EXEC_GRACE, executor.exec(&target, &command, limit)).await {
        Ok(r) => r,
        Err(_) => Err(HubError::Timeout(format!("{} after {}s", command, limit.as_secs()))),
    };

    let bundle = SshBundle::evaluate(&result, &patterns, &target.host);
    let failed = write_bundle(&bundle, source.var_prefix(), &source.id, &env.vars);
    if failed > 0 {
        slot.runtime().errors += failed as u64;
    }
    slot.record_value(bundle.to_json());

    match result {
        Ok(_) | Err(HubError::Timeout(_)) => {
            slot.mark_connected();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn mirror(slot: &SourceSlot, env: &WorkerEnv, source: &Source, params: &VariableParams) -> SourceResult<()> {
    let ctx = || Context::for_source(source.id.as_str());

    if let Some(var_name) = &params.var_name {
        let value = env.vars.get(var_name)?;
        if let Some(m) = source.mappings.first() {
            env.vars.upsert(&m.var_name, value.clone(), ctx())?;
        }
        slot.record_value(value.to_json());
        return Ok(());
    }

    let prefix = source.var_prefix().trim_end_matches('.');
    let copy_into_own_namespace = prefix != source.id;

    if params.var_watch_all {
        let scope = format!("{}.", prefix);
        let found = env.vars.list(Some(&scope));
        if found.is_empty() {
            return Err(VariableError::NotFound(format!("{}*", scope)).into());
        }
        if copy_into_own_namespace {
            for var in &found {
                let suffix = &var.name[scope.len()..];
                env.vars
                    .upsert(&format!("{}.{}", source.id, suffix), var.value.clone(), ctx())?;
            }
        }
        slot.record_value(json!(found.len()));
        return Ok(());
    }

    let mut copied = 0;
    let mut status = None;
    for suffix in BUNDLE_SUFFIXES.iter().chain(std::iter::once(&OUTPUT_SUFFIX)) {
        let Ok(value) = env.vars.get(&format!("{}.{}", prefix, suffix)) else {
            continue;
        };
        if copy_into_own_namespace {
            env.vars
                .upsert(&format!("{}.{}", source.id, suffix), value.clone(), ctx())?;
        }
        if *suffix == "status" {
            status = Some(value);
        }
        copied += 1;
    }
    if copied == 0 {
        return Err(VariableError::NotFound(format!("{}.status", prefix)).into());
    }
    slot.record_value(status.map(|v| v.to_json()).unwrap_or_else(|| json!(copied)));
    Ok(())
}

/// Run the command (or mirror) once
pub(crate) async fn poll_once(slot: &SourceSlot, env: &WorkerEnv) -> SourceResult<()> {
    let source = slot.config().clone();
    let SourceKind::Variable(params) = &source.kind else {
        return Err(SourceError::NotPollable(source.type_name()));
    };

    let result = if params.runs_command() {
        if !slot.runtime().connected {
            slot.set_state(SourceState::Connecting);
        }
        run_command(slot, env, &source, params).await
    } else {
        mirror(slot, env, &source, params).map(|()| slot.mark_connected())
    };
    if let Err(e) = &result {
        slot.mark_failed(e);
    }
    result
}

pub(crate) async fn run(slot: Arc<SourceSlot>, env: Arc<WorkerEnv>, mut stop: watch::Receiver<bool>) {
    loop {
        if let Err(e) = poll_once(&slot, &env).await {
            debug!(source = %slot.id(), error = %e, "Variable source poll failed");
        }
        let period = slot.config().poll_interval();
        match period {
            Some(period) => {
                if sleep_or_stop(&mut stop, period).await {
                    break;
                }
            }
            None => {
                stopped(&mut stop).await;
                break;
            }
        }
    }
    slot.reset_connection();
}
