//! SSH host and stored command registries

use crate::error::{ActionError, ActionResult};
use chrono::Utc;
use dashmap::DashMap;
use hub_core::Value;
use hub_variables::VariableStore;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const MAX_SSH_HOSTS: usize = 8;
pub const MAX_SSH_COMMANDS: usize = 32;

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_timeout_sec() -> u64 {
    30
}

fn default_ready_timeout_sec() -> u64 {
    60
}

fn default_check_interval_ms() -> u64 {
    3_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHost {
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Reference into the external key store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Connection parameters handed to an [`crate::SshExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_id: Option<String>,
}

impl From<&SshHost> for SshTarget {
    fn from(h: &SshHost) -> Self {
        Self {
            host: h.host.clone(),
            port: h.port,
            username: h.username.clone(),
            password: h.password.clone(),
            key_id: h.key_id.clone(),
        }
    }
}

#[derive(Default)]
pub struct SshHostRegistry {
    hosts: DashMap<String, SshHost>,
    insert_lock: Mutex<()>,
}

impl SshHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, host), fields(id = %host.id))]
    pub fn add(&self, host: SshHost) -> ActionResult<()> {
        if host.id.is_empty() || host.host.is_empty() || host.username.is_empty() {
            return Err(ActionError::InvalidAction(
                "ssh host requires id, host and username".into(),
            ));
        }
        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.hosts.contains_key(&host.id) {
            return Err(ActionError::HostExists(host.id));
        }
        if self.hosts.len() >= MAX_SSH_HOSTS {
            return Err(ActionError::RegistryFull("ssh host"));
        }
        info!(host = %host.host, port = host.port, "Adding SSH host");
        self.hosts.insert(host.id.clone(), host);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> ActionResult<SshHost> {
        self.hosts
            .remove(id)
            .map(|(_, h)| h)
            .ok_or_else(|| ActionError::HostNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<SshHost> {
        self.hosts.get(id).map(|h| h.clone())
    }

    pub fn list(&self) -> Vec<SshHost> {
        let mut all: Vec<SshHost> = self.hosts.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn count(&self) -> usize {
        self.hosts.len()
    }

    /// Resolve a host reference
    ///
    /// Registered hosts win; otherwise the variables `hosts.<ref>.ip`,
    /// `.port`, `.username` and `.password` describe the host.
    pub fn resolve(&self, host_ref: &str, vars: &VariableStore) -> ActionResult<SshTarget> {
        if let Some(host) = self.hosts.get(host_ref) {
            return Ok(SshTarget::from(&*host));
        }

        let var = |field: &str| vars.get(&format!("hosts.{host_ref}.{field}")).ok();
        let text = |v: Value| match v {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        };

        let host = var("ip")
            .and_then(text)
            .ok_or_else(|| ActionError::HostNotFound(host_ref.to_string()))?;
        let port = var("port")
            .and_then(|v| v.as_i64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(22);
        let username = var("username")
            .and_then(text)
            .unwrap_or_else(|| "root".to_string());
        let password = var("password").and_then(text);

        debug!(host_ref, %host, "Resolved SSH host from variables");
        Ok(SshTarget {
            host,
            port,
            username,
            password,
            key_id: None,
        })
    }

    pub fn load(&self, entries: &[serde_json::Value]) -> usize {
        self.hosts.clear();
        let mut loaded = 0;
        for entry in entries {
            let parsed = serde_json::from_value::<SshHost>(entry.clone())
                .map_err(|e| ActionError::InvalidAction(e.to_string()));
            match parsed.and_then(|h| self.add(h)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(error = %e, "Skipping stored SSH host"),
            }
        }
        loaded
    }

    pub fn to_vec(&self) -> Vec<SshHost> {
        self.list()
    }
}

/// A stored remote command, referenced by `ssh_cmd_ref` actions and
/// `variable` sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCommand {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Prefix for the `.exit_code`, `.status` and `.timestamp` variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub nohup: bool,
    #[serde(default)]
    pub service_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_fail_pattern: Option<String>,
    #[serde(default = "default_ready_timeout_sec")]
    pub ready_timeout_sec: u64,
    #[serde(default = "default_check_interval_ms")]
    pub ready_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unix seconds of the last execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exec_time: Option<i64>,
}

#[derive(Default)]
pub struct SshCommandRegistry {
    commands: DashMap<String, SshCommand>,
    insert_lock: Mutex<()>,
}

impl SshCommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, cmd), fields(id = %cmd.id))]
    pub fn add(&self, mut cmd: SshCommand) -> ActionResult<()> {
        if cmd.id.is_empty() || cmd.host_id.is_empty() || cmd.command.is_empty() {
            return Err(ActionError::InvalidAction(
                "ssh command requires id, host_id and command".into(),
            ));
        }
        for pattern in [&cmd.ready_pattern, &cmd.service_fail_pattern]
            .into_iter()
            .flatten()
        {
            crate::action::compile_pattern(pattern)?;
        }
        if cmd.name.is_empty() {
            cmd.name = cmd.id.clone();
        }
        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.commands.contains_key(&cmd.id) {
            return Err(ActionError::CommandExists(cmd.id));
        }
        if self.commands.len() >= MAX_SSH_COMMANDS {
            return Err(ActionError::RegistryFull("ssh command"));
        }
        info!(host_id = %cmd.host_id, "Adding SSH command");
        self.commands.insert(cmd.id.clone(), cmd);
        Ok(())
    }

    pub fn update(&self, cmd: SshCommand) -> ActionResult<()> {
        let mut entry = self
            .commands
            .get_mut(&cmd.id)
            .ok_or_else(|| ActionError::CommandNotFound(cmd.id.clone()))?;
        let last = entry.last_exec_time;
        *entry = cmd;
        entry.last_exec_time = last;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> ActionResult<SshCommand> {
        self.commands
            .remove(id)
            .map(|(_, c)| c)
            .ok_or_else(|| ActionError::CommandNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<SshCommand> {
        self.commands.get(id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<SshCommand> {
        let mut all: Vec<SshCommand> = self.commands.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn count(&self) -> usize {
        self.commands.len()
    }

    pub fn touch_exec_time(&self, id: &str) {
        if let Some(mut cmd) = self.commands.get_mut(id) {
            cmd.last_exec_time = Some(Utc::now().timestamp());
        }
    }

    pub fn load(&self, entries: &[serde_json::Value]) -> usize {
        self.commands.clear();
        let mut loaded = 0;
        for entry in entries {
            let parsed = serde_json::from_value::<SshCommand>(entry.clone())
                .map_err(|e| ActionError::InvalidAction(e.to_string()));
            match parsed.and_then(|c| self.add(c)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(error = %e, "Skipping stored SSH command"),
            }
        }
        loaded
    }

    pub fn to_vec(&self) -> Vec<SshCommand> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_config::MemoryKvStore;
    use hub_core::Context;
    use hub_event_bus::EventBus;
    use serde_json::json;
    use std::sync::Arc;

    fn host(id: &str) -> SshHost {
        SshHost {
            id: id.into(),
            host: "10.0.0.2".into(),
            port: 22,
            username: "nvidia".into(),
            password: None,
            key_id: Some("default".into()),
        }
    }

    #[tokio::test]
    async fn test_resolve_registered_host() {
        let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
        let reg = SshHostRegistry::new();
        reg.add(host("agx")).unwrap();

        let target = reg.resolve("agx", &vars).unwrap();
        assert_eq!(target.host, "10.0.0.2");
        assert_eq!(target.key_id.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_variables() {
        let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
        vars.upsert("hosts.lab.ip", "192.168.1.9", Context::new()).unwrap();
        vars.upsert("hosts.lab.port", 2222, Context::new()).unwrap();
        vars.upsert("hosts.lab.username", "pi", Context::new()).unwrap();

        let reg = SshHostRegistry::new();
        let target = reg.resolve("lab", &vars).unwrap();
        assert_eq!(target.host, "192.168.1.9");
        assert_eq!(target.port, 2222);
        assert_eq!(target.username, "pi");
        assert!(target.password.is_none());

        assert!(matches!(
            reg.resolve("nowhere", &vars),
            Err(ActionError::HostNotFound(_))
        ));
    }

    #[test]
    fn test_host_capacity() {
        let reg = SshHostRegistry::new();
        for i in 0..MAX_SSH_HOSTS {
            reg.add(host(&format!("h{i}"))).unwrap();
        }
        assert!(matches!(reg.add(host("extra")), Err(ActionError::RegistryFull(_))));
    }

    #[test]
    fn test_command_registry() {
        let reg = SshCommandRegistry::new();
        let cmd: SshCommand = serde_json::from_value(json!({
            "id": "start_llm",
            "host_id": "agx",
            "command": "./run.sh",
            "nohup": true,
            "service_mode": true,
            "ready_pattern": "listening on"
        }))
        .unwrap();
        assert_eq!(cmd.timeout_sec, 30);
        assert!(cmd.enabled);
        reg.add(cmd).unwrap();

        assert_eq!(reg.get("start_llm").unwrap().name, "start_llm");
        assert!(reg.get("start_llm").unwrap().last_exec_time.is_none());
        reg.touch_exec_time("start_llm");
        assert!(reg.get("start_llm").unwrap().last_exec_time.is_some());
        reg.remove("start_llm").unwrap();
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn test_command_rejects_bad_pattern() {
        let reg = SshCommandRegistry::new();
        let cmd: SshCommand = serde_json::from_value(json!({
            "id": "c", "host_id": "h", "command": "x", "ready_pattern": "[unclosed"
        }))
        .unwrap();
        assert!(matches!(reg.add(cmd), Err(ActionError::Pattern { .. })));
    }
}
