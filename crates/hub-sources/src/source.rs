//! Source configuration model
//!
//! A source is stored as a flat JSON object: the common fields, a `type`
//! tag and the fields of its kind.
//!
//! ```json
//! {"id": "srv", "type": "rest", "url": "http://h/m", "poll_interval_ms": 1000,
//!  "mappings": [{"json_path": "cpu.usage", "var_name": "cpu_usage"}]}
//! ```

use crate::error::{SourceError, SourceResult};
use hub_core::path::{self, PathEntry};
use hub_core::{Transform, VariableName};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Maximum number of mappings per source
pub const MAX_MAPPINGS: usize = 16;

pub const DEFAULT_REST_POLL_MS: u64 = 5_000;
pub const DEFAULT_VARIABLE_POLL_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MS: u64 = 5_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SSH_TIMEOUT_SEC: u64 = 30;

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn default_reconnect() -> u64 {
    DEFAULT_RECONNECT_MS
}

fn default_ssh_timeout() -> u64 {
    DEFAULT_SSH_TIMEOUT_SEC
}

/// Where to extract a value and where to store it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub json_path: String,
    pub var_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl Mapping {
    pub fn new(json_path: impl Into<String>, var_name: impl Into<String>) -> Self {
        Self {
            json_path: json_path.into(),
            var_name: var_name.into(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, expr: impl Into<String>) -> Self {
        self.transform = Some(expr.into());
        self
    }

    pub fn validate(&self) -> SourceResult<()> {
        path::validate(&self.json_path)
            .map_err(|e| SourceError::InvalidConfig(format!("json_path '{}': {}", self.json_path, e)))?;
        VariableName::validate(&self.var_name)
            .map_err(|e| SourceError::InvalidConfig(format!("var_name '{}': {}", self.var_name, e)))?;
        self.parsed_transform()?;
        Ok(())
    }

    /// The transform expression, parsed
    pub fn parsed_transform(&self) -> SourceResult<Option<Transform>> {
        match self.transform.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(expr) => expr.parse().map(Some).map_err(|source| SourceError::Transform {
                expr: expr.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestParams {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketParams {
    #[serde(alias = "url")]
    pub uri: String,
    #[serde(default = "default_reconnect")]
    pub reconnect_ms: u64,
    /// Text frame sent once after every connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketIoParams {
    #[serde(alias = "uri")]
    pub url: String,
    pub event: String,
    #[serde(default = "default_reconnect")]
    pub reconnect_ms: u64,
}

/// SSH-derived source, or a mirror of existing variables when no command
/// is configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_cmd_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_expect_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_fail_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_extract_pattern: Option<String>,
    /// Seconds
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(default)]
    pub var_watch_all: bool,
}

impl VariableParams {
    /// Whether this source runs a remote command rather than mirroring
    pub fn runs_command(&self) -> bool {
        self.ssh_cmd_id.is_some() || (self.ssh_host_id.is_some() && self.ssh_command.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    Rest(RestParams),
    #[serde(alias = "ws")]
    WebSocket(WebSocketParams),
    #[serde(rename = "socketio", alias = "socket.io")]
    SocketIo(SocketIoParams),
    Variable(VariableParams),
}

impl SourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceKind::Rest(_) => "rest",
            SourceKind::WebSocket(_) => "websocket",
            SourceKind::SocketIo(_) => "socketio",
            SourceKind::Variable(_) => "variable",
        }
    }
}

/// Fields every stored source object may carry
pub(crate) const KNOWN_FIELDS: &[&str] = &[
    "id",
    "label",
    "type",
    "enabled",
    "auto_discover",
    "poll_interval_ms",
    "mappings",
    "json_path",
    "url",
    "uri",
    "method",
    "auth_header",
    "headers",
    "timeout_ms",
    "reconnect_ms",
    "subscribe",
    "event",
    "ssh_host_id",
    "ssh_command",
    "ssh_cmd_id",
    "var_prefix",
    "ssh_expect_pattern",
    "ssh_fail_pattern",
    "ssh_extract_pattern",
    "ssh_timeout",
    "var_name",
    "var_watch_all",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_discover: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

impl Source {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            enabled: true,
            auto_discover: true,
            poll_interval_ms: None,
            mappings: Vec::new(),
            kind,
        }
    }

    pub fn rest(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            id,
            SourceKind::Rest(RestParams {
                url: url.into(),
                method: default_method(),
                auth_header: None,
                headers: BTreeMap::new(),
                timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            }),
        )
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Parse and validate a stored or RPC-supplied source object
    ///
    /// A bare `json_path` with no `mappings` becomes a single mapping into
    /// `{id}.{path}` (brackets replaced by underscores).
    pub fn from_json(json: &serde_json::Value) -> SourceResult<Self> {
        let mut source: Source = serde_json::from_value(json.clone())
            .map_err(|e| SourceError::InvalidConfig(e.to_string()))?;

        if source.mappings.is_empty() {
            if let Some(p) = json.get("json_path").and_then(|v| v.as_str()) {
                let p = p.trim();
                if !p.is_empty() {
                    source
                        .mappings
                        .push(Mapping::new(p, path::auto_var_name(&source.id, p)));
                }
            }
        }
        if source.label.is_empty() {
            source.label = source.id.clone();
        }

        source.validate()?;
        Ok(source)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Poll period, `None` for event-driven sources and a zero interval
    pub fn poll_interval(&self) -> Option<Duration> {
        let default = match &self.kind {
            SourceKind::Rest(_) => DEFAULT_REST_POLL_MS,
            SourceKind::Variable(_) => DEFAULT_VARIABLE_POLL_MS,
            SourceKind::WebSocket(_) | SourceKind::SocketIo(_) => return None,
        };
        match self.poll_interval_ms.unwrap_or(default) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Prefix of the SSH variable bundle
    pub fn var_prefix(&self) -> &str {
        match &self.kind {
            SourceKind::Variable(v) => v.var_prefix.as_deref().unwrap_or(&self.id),
            _ => &self.id,
        }
    }

    pub fn validate(&self) -> SourceResult<()> {
        VariableName::validate(&self.id)
            .map_err(|e| SourceError::InvalidConfig(format!("id '{}': {}", self.id, e)))?;

        if self.mappings.len() > MAX_MAPPINGS {
            return Err(SourceError::InvalidConfig(format!(
                "{} mappings (max {})",
                self.mappings.len(),
                MAX_MAPPINGS
            )));
        }
        let mut paths = HashSet::new();
        let mut names = HashSet::new();
        for m in &self.mappings {
            m.validate()?;
            if !paths.insert(m.json_path.as_str()) {
                return Err(SourceError::MappingConflict(m.json_path.clone()));
            }
            if !names.insert(m.var_name.as_str()) {
                return Err(SourceError::MappingConflict(m.var_name.clone()));
            }
        }

        match &self.kind {
            SourceKind::Rest(r) => {
                require_scheme(&r.url, &["http://", "https://"])?;
                if !matches!(r.method.to_ascii_uppercase().as_str(), "GET" | "POST" | "PUT") {
                    return Err(SourceError::InvalidConfig(format!(
                        "unsupported method {}",
                        r.method
                    )));
                }
            }
            SourceKind::WebSocket(w) => require_scheme(&w.uri, &["ws://", "wss://"])?,
            SourceKind::SocketIo(s) => {
                require_scheme(&s.url, &["http://", "https://", "ws://", "wss://"])?;
                if s.event.is_empty() {
                    return Err(SourceError::InvalidConfig("socketio event is required".into()));
                }
            }
            SourceKind::Variable(v) => {
                if !v.runs_command() && v.var_name.is_none() && v.var_prefix.is_none() {
                    return Err(SourceError::InvalidConfig(
                        "variable source needs ssh_cmd_id, ssh_host_id + ssh_command, var_name or var_prefix"
                            .into(),
                    ));
                }
                if let Some(prefix) = &v.var_prefix {
                    VariableName::validate(prefix.trim_end_matches('.')).map_err(|e| {
                        SourceError::InvalidConfig(format!("var_prefix '{}': {}", prefix, e))
                    })?;
                }
                for p in [
                    &v.ssh_expect_pattern,
                    &v.ssh_fail_pattern,
                    &v.ssh_extract_pattern,
                ]
                .into_iter()
                .flatten()
                {
                    Regex::new(p).map_err(|e| {
                        SourceError::InvalidConfig(format!("pattern '{}': {}", p, e))
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn require_scheme(url: &str, schemes: &[&str]) -> SourceResult<()> {
    if schemes.iter().any(|s| url.starts_with(s)) && url.len() > 8 {
        Ok(())
    } else {
        Err(SourceError::InvalidConfig(format!(
            "url '{}' must start with {}",
            url,
            schemes.join(" or ")
        )))
    }
}

/// Connection state of a source worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Runtime record kept next to each source's configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRuntime {
    pub state: SourceState,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_value: Option<serde_json::Value>,
    pub last_update_ms: i64,
    pub messages: u64,
    pub dropped_non_json: u64,
    pub truncated_strings: u64,
    pub errors: u64,
    pub reconnects: u64,
    /// Shape of the first payload, when auto-discovery ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered: Option<Vec<PathEntry>>,
}

/// Configuration and runtime record of one source, as handed out by the
/// manager's copy API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSnapshot {
    #[serde(flatten)]
    pub config: Source,
    #[serde(flatten)]
    pub runtime: SourceRuntime,
}
