//! In-process calls from REST sources

use async_trait::async_trait;
use hub_core::{HubError, HubResult};
use hub_rpc::RpcRegistry;
use hub_sources::LocalApi;
use std::sync::{Arc, Weak};

/// [`LocalApi`] backed by the registry
///
/// Holds a weak reference: the registry's handlers own the engine, which
/// owns the source manager holding this adapter.
pub struct RegistryLocalApi {
    registry: Weak<RpcRegistry>,
}

impl RegistryLocalApi {
    pub fn new(registry: &Arc<RpcRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

#[async_trait]
impl LocalApi for RegistryLocalApi {
    async fn call(&self, method: &str, params: serde_json::Value) -> HubResult<serde_json::Value> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| HubError::InvalidState("API registry is gone".into()))?;
        registry.call_local(method, params).await
    }
}
