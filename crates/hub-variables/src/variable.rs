//! Variable record and store errors

use hub_core::{HubError, NameError, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable not found: {0}")]
    NotFound(String),

    #[error("variable already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid variable name '{name}': {source}")]
    InvalidName {
        name: String,
        #[source]
        source: NameError,
    },

    #[error("variable {0} is read-only")]
    ReadOnly(String),

    #[error("type mismatch for {name}: holds {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("import failed: {0}")]
    Import(String),
}

impl From<VariableError> for HubError {
    fn from(e: VariableError) -> Self {
        match e {
            VariableError::NotFound(_) => HubError::NotFound(e.to_string()),
            VariableError::AlreadyExists(_) => HubError::AlreadyExists(e.to_string()),
            VariableError::ReadOnly(_) => HubError::InvalidState(e.to_string()),
            VariableError::InvalidName { .. }
            | VariableError::TypeMismatch { .. }
            | VariableError::Import(_) => HubError::InvalidArgument(e.to_string()),
        }
    }
}

pub type VariableResult<T> = Result<T, VariableError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableFlags {
    /// Written to durable storage and rehydrated on init
    #[serde(default)]
    pub persistent: bool,
    /// Writable only by the owning source
    #[serde(default)]
    pub readonly: bool,
}

/// A named, typed slot in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default)]
    pub flags: VariableFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Unix milliseconds of the last write, 0 if never written
    #[serde(default)]
    pub last_update_ms: i64,
}

impl Variable {
    /// A variable whose default is its initial value
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            default_value: value.clone(),
            value,
            flags: VariableFlags::default(),
            source_id: None,
            last_update_ms: 0,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.flags.persistent = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.flags.readonly = true;
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }
}

/// Position of an in-progress [`crate::VariableStore::iterate`] walk
#[derive(Debug, Clone, Default)]
pub struct IterCursor {
    last: Option<String>,
}

impl IterCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub(crate) fn advance(&mut self, name: &str) {
        self.last = Some(name.to_string());
    }
}

/// Result of an auto-registering write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableStoreStats {
    pub count: usize,
    pub persist_errors: u64,
    pub persist_writes: u64,
    pub events_emitted: u64,
}
