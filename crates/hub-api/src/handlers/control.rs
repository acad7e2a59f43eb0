//! Engine lifecycle endpoints

use hub_automation::Automation;
use hub_core::HubResult;
use serde_json::{json, Value as Json};
use std::sync::Arc;

fn state_reply(automation: &Automation) -> Json {
    json!({"state": automation.state()})
}

pub async fn status(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    Ok(serde_json::to_value(automation.status())?)
}

pub async fn start(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.start().await?;
    Ok(state_reply(&automation))
}

pub async fn stop(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.stop().await?;
    Ok(state_reply(&automation))
}

pub async fn pause(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.pause().await?;
    Ok(state_reply(&automation))
}

pub async fn resume(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.resume().await?;
    Ok(state_reply(&automation))
}

pub async fn reload(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    let summary = automation.reload().await?;
    Ok(serde_json::to_value(summary)?)
}

pub async fn save(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.save_config().await?;
    Ok(json!({"saved": true, "config_dir": automation.config_dir().display().to_string()}))
}
