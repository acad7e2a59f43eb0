//! Rule errors

use hub_actions::ActionError;
use hub_core::HubError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    InvalidConfig(String),

    #[error("rule not found: {0}")]
    NotFound(String),

    #[error("rule already exists: {0}")]
    AlreadyExists(String),

    #[error("rule table is full ({0} rules)")]
    TableFull(usize),

    #[error("rule is disabled: {0}")]
    Disabled(String),

    #[error("rule {id} is cooling down ({remaining_ms} ms left)")]
    Cooldown { id: String, remaining_ms: u64 },

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl From<RuleError> for HubError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::InvalidConfig(_) => HubError::InvalidArgument(e.to_string()),
            RuleError::NotFound(_) => HubError::NotFound(e.to_string()),
            RuleError::AlreadyExists(_) => HubError::AlreadyExists(e.to_string()),
            RuleError::TableFull(_) => HubError::OutOfMemory(e.to_string()),
            RuleError::Disabled(_) => HubError::InvalidState(e.to_string()),
            RuleError::Cooldown { .. } => HubError::Busy(e.to_string()),
            RuleError::Action(a) => a.into(),
        }
    }
}

pub type RuleResult<T> = Result<T, RuleError>;
