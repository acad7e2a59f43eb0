//! Error types for the source manager and its workers

use hub_actions::ActionError;
use hub_core::{HubError, TransformError};
use hub_variables::VariableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid source config: {0}")]
    InvalidConfig(String),

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source already exists: {0}")]
    AlreadyExists(String),

    #[error("source table is full ({0} entries)")]
    TableFull(usize),

    #[error("mapping not found: {0}")]
    MappingNotFound(String),

    #[error("mapping conflicts with an existing one: {0}")]
    MappingConflict(String),

    #[error("invalid transform '{expr}': {source}")]
    Transform {
        expr: String,
        #[source]
        source: TransformError,
    },

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("payload is not JSON: {0}")]
    NotJson(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("{0} sources are event-driven and cannot be polled")]
    NotPollable(&'static str),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl SourceError {
    /// Classify an HTTP client error raised under a `timeout_ms` budget
    pub fn from_http(e: reqwest::Error, timeout_ms: u64) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(timeout_ms)
        } else {
            SourceError::Connection(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SourceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SourceError::Connection(e.to_string())
    }
}

impl From<SourceError> for HubError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::InvalidConfig(_)
            | SourceError::Transform { .. }
            | SourceError::MappingConflict(_)
            | SourceError::NotJson(_)
            | SourceError::NotPollable(_) => HubError::InvalidArgument(e.to_string()),
            SourceError::NotFound(_) | SourceError::MappingNotFound(_) => {
                HubError::NotFound(e.to_string())
            }
            SourceError::AlreadyExists(_) => HubError::AlreadyExists(e.to_string()),
            SourceError::TableFull(_) | SourceError::BodyTooLarge { .. } => {
                HubError::OutOfMemory(e.to_string())
            }
            SourceError::Status(_) | SourceError::Connection(_) | SourceError::Handshake(_) => {
                HubError::Connection(e.to_string())
            }
            SourceError::Timeout(_) => HubError::Timeout(e.to_string()),
            SourceError::Variable(v) => v.into(),
            SourceError::Action(a) => a.into(),
            SourceError::Hub(h) => h,
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;
