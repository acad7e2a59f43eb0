//! Uniform error taxonomy shared by every hub component

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable numeric error codes reported over RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    NotFound = 2,
    AlreadyExists = 3,
    InvalidState = 4,
    Timeout = 5,
    Busy = 6,
    OutOfMemory = 7,
    Connection = 8,
    HostKeyNew = 9,
    HostKeyMismatch = 10,
    Unauthorized = 11,
    Internal = 99,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Error kinds every crate-level error converts into
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("unknown host key: {0}")]
    HostKeyNew(String),

    #[error("host key mismatch: {0}")]
    HostKeyMismatch(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stable error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            HubError::NotFound(_) => ErrorCode::NotFound,
            HubError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            HubError::InvalidState(_) => ErrorCode::InvalidState,
            HubError::Timeout(_) => ErrorCode::Timeout,
            HubError::Busy(_) => ErrorCode::Busy,
            HubError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            HubError::Connection(_) => ErrorCode::Connection,
            HubError::HostKeyNew(_) => ErrorCode::HostKeyNew,
            HubError::HostKeyMismatch(_) => ErrorCode::HostKeyMismatch,
            HubError::Unauthorized => ErrorCode::Unauthorized,
            HubError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to hand to a remote caller
    ///
    /// Security-adjacent errors never carry the inner text.
    pub fn public_message(&self) -> String {
        match self {
            HubError::Unauthorized => "Authentication required".to_string(),
            HubError::HostKeyNew(_) => "Host key not trusted".to_string(),
            HubError::HostKeyMismatch(_) => "Host key verification failed".to_string(),
            HubError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::InvalidArgument(e.to_string())
    }
}

/// Result alias for hub operations
pub type HubResult<T> = Result<T, HubError>;
