//! RPC layer errors

use hub_core::HubError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("authentication required for {0}")]
    Unauthorized(String),
}

impl From<RpcError> for HubError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::UnknownMethod(_) => HubError::NotFound(e.to_string()),
            RpcError::InvalidParams(msg) => HubError::InvalidArgument(msg),
            RpcError::Unauthorized(_) => HubError::Unauthorized,
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
