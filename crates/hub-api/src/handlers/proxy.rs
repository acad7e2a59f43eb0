//! Outbound test helpers used by the configuration UI

use hub_automation::Automation;
use hub_core::HubResult;
use hub_rpc::params;
use hub_sources::{proxy, FetchRequest, SocketIoTestRequest, WebSocketTestRequest};
use serde_json::Value as Json;
use std::sync::Arc;

pub async fn fetch(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let req: FetchRequest = params::parse(&params)?;
    let resp = proxy::fetch(automation.sources().http_client(), req).await?;
    Ok(serde_json::to_value(resp)?)
}

pub async fn websocket_test(_automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let req: WebSocketTestRequest = params::parse(&params)?;
    let resp = proxy::websocket_test(req).await?;
    Ok(serde_json::to_value(resp)?)
}

pub async fn socketio_test(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let req: SocketIoTestRequest = params::parse(&params)?;
    let resp = proxy::socketio_test(automation.sources().http_client(), req).await?;
    Ok(serde_json::to_value(resp)?)
}
