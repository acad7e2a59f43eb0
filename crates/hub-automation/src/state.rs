//! Lifecycle state and the status snapshot

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
            EngineState::Error => "error",
        }
    }

    /// Running or paused: workers and the rule task are alive
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Paused)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `automation.status`
#[derive(Debug, Clone, Serialize)]
pub struct AutomationStatus {
    pub state: EngineState,
    /// Milliseconds since the last start, 0 when not running
    pub uptime_ms: u64,
    pub sources_count: usize,
    pub sources_active: usize,
    pub rules_count: usize,
    pub rules_active: usize,
    pub variables_count: usize,
    pub actions_executed: u64,
    pub rule_triggers: u64,
    pub config_path: String,
    pub config_modified: bool,
    pub persist_errors: u64,
    pub exec_events_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: &'static str,
}

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub sources_added: usize,
    pub sources_removed: usize,
    pub sources_replaced: usize,
    pub rules_added: usize,
    pub rules_removed: usize,
    pub rules_replaced: usize,
    pub templates_added: usize,
    pub templates_removed: usize,
    pub templates_updated: usize,
    /// Variables kept alive because a rule still reads them
    pub variables_retained: usize,
}
