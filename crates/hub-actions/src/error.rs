//! Error types for actions, templates and the dispatcher

use hub_core::HubError;
use hub_variables::VariableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template already exists: {0}")]
    TemplateExists(String),

    #[error("template {0} is disabled")]
    TemplateDisabled(String),

    #[error("{0} registry is full")]
    RegistryFull(&'static str),

    #[error("SSH host not found: {0}")]
    HostNotFound(String),

    #[error("SSH host already exists: {0}")]
    HostExists(String),

    #[error("SSH command not found: {0}")]
    CommandNotFound(String),

    #[error("SSH command already exists: {0}")]
    CommandExists(String),

    #[error("SSH command {0} is disabled")]
    CommandDisabled(String),

    #[error("action queue full ({pending}/{capacity})")]
    QueueFull { pending: usize, capacity: usize },

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl From<ActionError> for HubError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::InvalidAction(_) | ActionError::Pattern { .. } => {
                HubError::InvalidArgument(e.to_string())
            }
            ActionError::TemplateNotFound(_)
            | ActionError::HostNotFound(_)
            | ActionError::CommandNotFound(_) => HubError::NotFound(e.to_string()),
            ActionError::TemplateExists(_)
            | ActionError::HostExists(_)
            | ActionError::CommandExists(_) => HubError::AlreadyExists(e.to_string()),
            ActionError::TemplateDisabled(_)
            | ActionError::CommandDisabled(_)
            | ActionError::ShuttingDown => HubError::InvalidState(e.to_string()),
            ActionError::RegistryFull(_) => HubError::OutOfMemory(e.to_string()),
            ActionError::QueueFull { .. } => HubError::Busy(e.to_string()),
            ActionError::Variable(v) => v.into(),
            ActionError::Hub(h) => h,
        }
    }
}

pub type ActionResult<T> = Result<T, ActionError>;
