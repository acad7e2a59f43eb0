//! The endpoint table

use crate::error::RpcError;
use crate::response::RpcResponse;
use crate::session::SessionValidator;
use dashmap::DashMap;
use hub_core::{HubError, HubResult};
use serde_json::Value as Json;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument, warn};

/// Future type for async endpoint handlers
pub type RpcFuture = Pin<Box<dyn Future<Output = HubResult<Json>> + Send>>;

/// Endpoint handler function type
pub type RpcHandler = Arc<dyn Fn(Json) -> RpcFuture + Send + Sync>;

/// Who is calling: a remote client with its bearer token, or the process itself
#[derive(Debug, Clone, Copy)]
enum Caller<'a> {
    Remote(Option<&'a str>),
    Local,
}

struct Endpoint {
    handler: RpcHandler,
    requires_auth: bool,
}

/// Named endpoints, called by `automation.rules.list` style names
///
/// Without a [`SessionValidator`] the `requires_auth` flags are not
/// enforced.
#[derive(Default)]
pub struct RpcRegistry {
    endpoints: DashMap<String, Endpoint>,
    validator: RwLock<Option<Arc<dyn SessionValidator>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_validator(&self, validator: Option<Arc<dyn SessionValidator>>) {
        *self.validator.write().unwrap_or_else(|e| e.into_inner()) = validator;
    }

    pub fn auth_enforced(&self) -> bool {
        self.validator.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Register an endpoint, replacing any previous one with the same name
    pub fn register<F, Fut>(&self, name: impl Into<String>, requires_auth: bool, handler: F)
    where
        F: Fn(Json) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HubResult<Json>> + Send + 'static,
    {
        let name = name.into();
        debug!(method = %name, requires_auth, "Registering RPC endpoint");
        let handler: RpcHandler = Arc::new(move |params| Box::pin(handler(params)) as RpcFuture);
        self.endpoints.insert(
            name,
            Endpoint {
                handler,
                requires_auth,
            },
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.endpoints.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    pub fn requires_auth(&self, name: &str) -> Option<bool> {
        self.endpoints.get(name).map(|e| e.requires_auth)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    fn authorize(&self, name: &str, token: Option<&str>) -> Result<(), RpcError> {
        let validator = self.validator.read().unwrap_or_else(|e| e.into_inner()).clone();
        match validator {
            None => Ok(()),
            Some(v) if token.is_some_and(|t| v.validate(t)) => Ok(()),
            Some(_) => Err(RpcError::Unauthorized(name.to_string())),
        }
    }

    async fn dispatch(&self, name: &str, params: Json, caller: Caller<'_>) -> HubResult<Json> {
        let (handler, requires_auth) = {
            let endpoint = self
                .endpoints
                .get(name)
                .ok_or_else(|| RpcError::UnknownMethod(name.to_string()))?;
            (endpoint.handler.clone(), endpoint.requires_auth)
        };

        if let (true, Caller::Remote(token)) = (requires_auth, caller) {
            self.authorize(name, token)?;
        }

        let params = match params {
            Json::Null => Json::Object(Default::default()),
            p @ Json::Object(_) => p,
            _ => return Err(RpcError::InvalidParams("params must be an object".into()).into()),
        };

        handler(params).await
    }

    /// Call an endpoint by name
    #[instrument(skip(self, params, token))]
    pub async fn call(&self, name: &str, params: Json, token: Option<&str>) -> RpcResponse {
        match self.dispatch(name, params, Caller::Remote(token)).await {
            Ok(data) => RpcResponse::ok(data),
            Err(e) => {
                match &e {
                    HubError::Internal(detail) => warn!(method = %name, %detail, "RPC handler failed"),
                    other => debug!(method = %name, error = %other, "RPC call rejected"),
                }
                RpcResponse::error(&e)
            }
        }
    }

    /// Call from inside the process, skipping authentication
    pub async fn call_local(&self, name: &str, params: Json) -> HubResult<Json> {
        self.dispatch(name, params, Caller::Local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticTokenValidator;
    use serde_json::json;

    fn registry() -> RpcRegistry {
        let reg = RpcRegistry::new();
        reg.register("test.echo", false, |params: Json| async move { Ok(params) });
        reg.register("test.secret", true, |_| async { Ok(json!("hidden")) });
        reg.register("test.fail", false, |_| async {
            Err(HubError::InvalidState("engine stopped".into()))
        });
        reg
    }

    #[tokio::test]
    async fn test_call_and_errors() {
        let reg = registry();

        let resp = reg.call("test.echo", json!({"a": 1}), None).await;
        assert!(resp.is_ok());
        assert_eq!(resp.data, Some(json!({"a": 1})));

        // Null params become an empty object
        let resp = reg.call("test.echo", Json::Null, None).await;
        assert_eq!(resp.data, Some(json!({})));

        let resp = reg.call("test.echo", json!([1, 2]), None).await;
        assert_eq!(resp.code, 1);

        let resp = reg.call("test.nope", json!({}), None).await;
        assert_eq!(resp.code, 2);

        let resp = reg.call("test.fail", json!({}), None).await;
        assert_eq!(resp.code, 4);
        assert!(resp.message.unwrap().contains("engine stopped"));
    }

    #[tokio::test]
    async fn test_auth_enforced_with_validator() {
        let reg = registry();
        assert!(!reg.auth_enforced());
        assert!(reg.call("test.secret", json!({}), None).await.is_ok());

        reg.set_validator(Some(Arc::new(StaticTokenValidator::new(["tok"]))));
        let resp = reg.call("test.secret", json!({}), None).await;
        assert_eq!(resp.code, 11);
        assert_eq!(resp.message.as_deref(), Some("Authentication required"));
        assert_eq!(reg.call("test.secret", json!({}), Some("bad")).await.code, 11);
        assert!(reg.call("test.secret", json!({}), Some("tok")).await.is_ok());
        // Read-only endpoints stay open
        assert!(reg.call("test.echo", json!({}), None).await.is_ok());
        assert_eq!(reg.call_local("test.secret", json!({})).await, Ok(json!("hidden")));
    }

    #[test]
    fn test_names_sorted() {
        let reg = registry();
        assert_eq!(reg.names(), vec!["test.echo", "test.fail", "test.secret"]);
        assert_eq!(reg.requires_auth("test.secret"), Some(true));
        assert!(reg.unregister("test.fail"));
        let resp = tokio_test::block_on(reg.call("test.fail", json!({}), None));
        assert_eq!(resp.code, 2);
        assert!(!reg.has("test.fail"));
        assert_eq!(reg.count(), 2);
    }
}
