//! RPC endpoints and HTTP API of the automation hub
//!
//! [`register_endpoints`] puts every `automation.*` endpoint on an
//! [`RpcRegistry`]; [`create_router`] exposes the registry over HTTP:
//!
//! - `POST /api/v1/rpc` with `{"method": "...", "params": {...}}`
//! - `POST /api/v1/automation/rules/list` with the params as body
//! - `GET /api/health`

mod handlers;
mod http;
mod local;

pub use handlers::register_endpoints;
pub use http::{create_router, start_server, AppState};
pub use local::RegistryLocalApi;

use hub_automation::Automation;
use hub_rpc::RpcRegistry;
use std::sync::Arc;

/// Build a registry holding every endpoint and let REST sources pointed at
/// this hub call it in-process
pub fn build_registry(automation: &Arc<Automation>) -> Arc<RpcRegistry> {
    let registry = Arc::new(RpcRegistry::new());
    register_endpoints(&registry, automation);
    automation
        .sources()
        .set_local_api(Some(Arc::new(RegistryLocalApi::new(&registry))));
    registry
}
