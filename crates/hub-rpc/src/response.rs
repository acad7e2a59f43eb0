//! Wire shapes of a call and its answer

use hub_core::{ErrorCode, HubError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Body of `POST /api/v1/rpc`
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
}

impl RpcResponse {
    /// Success; a `null` payload is omitted
    pub fn ok(data: Json) -> Self {
        Self {
            code: ErrorCode::Ok.as_i32(),
            message: None,
            data: (!data.is_null()).then_some(data),
        }
    }

    /// Failure, with the caller-safe rendering of the error
    pub fn error(err: &HubError) -> Self {
        Self {
            code: err.code().as_i32(),
            message: Some(err.public_message()),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok.as_i32()
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

impl From<Result<Json, HubError>> for RpcResponse {
    fn from(result: Result<Json, HubError>) -> Self {
        match result {
            Ok(data) => RpcResponse::ok(data),
            Err(e) => RpcResponse::error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_omits_empty_fields() {
        assert_eq!(RpcResponse::ok(Json::Null).to_json(), json!({"code": 0}));
        assert_eq!(
            RpcResponse::ok(json!({"n": 1})).to_json(),
            json!({"code": 0, "data": {"n": 1}})
        );
    }

    #[test]
    fn test_error_hides_internal_detail() {
        let resp = RpcResponse::error(&HubError::internal("lock poisoned in worker.rs"));
        assert_eq!(resp.code, 99);
        assert_eq!(resp.message.as_deref(), Some("Internal error"));

        let resp = RpcResponse::error(&HubError::not_found("rule r9"));
        assert_eq!(resp.code, 2);
        assert!(resp.message.unwrap().contains("r9"));
    }

    #[test]
    fn test_request_params_default_to_null() {
        let req: RpcRequest = serde_json::from_value(json!({"method": "automation.status"})).unwrap();
        assert_eq!(req.method, "automation.status");
        assert!(req.params.is_null());
    }
}
