//! Action template, statistics and hardware test endpoints

use super::persist;
use hub_actions::{Action, ActionRef, ActionTemplate, ExecutionResult};
use hub_automation::Automation;
use hub_core::{HubError, HubResult};
use hub_rpc::params;
use serde_json::{json, Map, Value as Json};
use std::sync::Arc;

const DEFAULT_SSH_TEST_TIMEOUT_MS: u64 = 30_000;

pub async fn list(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    let actions = automation.templates().list();
    Ok(json!({"count": actions.len(), "actions": actions}))
}

pub async fn get(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let template = automation
        .templates()
        .get(id)
        .ok_or_else(|| HubError::not_found(format!("action template {}", id)))?;
    Ok(serde_json::to_value(template)?)
}

/// Add or overwrite a template; the action may be nested or flat
pub async fn add(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let template = ActionTemplate::from_json(&params)?;
    let id = template.id.clone();
    automation.templates().upsert(template)?;
    persist(&automation).await;
    Ok(json!({"id": id}))
}

pub async fn delete(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.templates().remove(id)?;
    persist(&automation).await;
    Ok(json!({"id": id, "deleted": true}))
}

/// Run a template now on the caller's task
pub async fn execute(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    if automation.templates().get(id).is_none() {
        return Err(HubError::not_found(format!("action template {}", id)));
    }
    let results = automation
        .dispatcher()
        .execute_sequence(&[ActionRef::template(id, None)], true)
        .await;
    let result = results
        .into_iter()
        .next()
        .ok_or_else(|| HubError::internal("no execution result"))?;
    Ok(serde_json::to_value(result)?)
}

pub async fn stats(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    let dispatcher = automation.dispatcher();
    Ok(json!({
        "stats": dispatcher.stats(),
        "queue": dispatcher.queue_status(),
    }))
}

pub async fn reset_stats(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    automation.dispatcher().reset_stats();
    Ok(json!({"reset": true}))
}

/// Build an action of `kind` from the listed params and run it directly
///
/// The reply is always code 0 with the execution result; a failed run
/// shows up in its `status`.
async fn run_test(automation: &Automation, kind: &str, fields: Map<String, Json>) -> HubResult<Json> {
    let mut obj = fields;
    obj.insert("type".into(), json!(kind));
    let action = Action::from_json(&Json::Object(obj))?;
    let result: ExecutionResult = automation.dispatcher().execute(&action).await;
    Ok(serde_json::to_value(result)?)
}

fn copy_fields(params: &Json, keys: &[&str]) -> Map<String, Json> {
    keys.iter()
        .filter_map(|k| params.get(*k).filter(|v| !v.is_null()).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// Params: `device`, optional `index`, and either `color` or `r`/`g`/`b`
pub async fn test_led(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    params::required_str(&params, "device")?;
    let fields = copy_fields(&params, &["device", "index", "color", "r", "g", "b", "effect", "duration_ms"]);
    run_test(&automation, "led", fields).await
}

/// Params: `pin`, `level`, optional `pulse_ms`
pub async fn test_gpio(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    params::optional_u64(&params, "pin")?.ok_or_else(|| HubError::invalid("missing 'pin'"))?;
    if params.get("level").is_none() {
        return Err(HubError::invalid("missing 'level'"));
    }
    let fields = copy_fields(&params, &["pin", "level", "pulse_ms"]);
    run_test(&automation, "gpio", fields).await
}

/// Params: `device`, `action` (power_on, power_off, force_off, reset, recovery)
pub async fn test_device(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    params::required_str(&params, "device")?;
    params::required_str(&params, "action")?;
    let fields = copy_fields(&params, &["device", "action"]);
    run_test(&automation, "device_ctrl", fields).await
}

/// Params: `host_id`, `command`, optional `timeout_ms`
pub async fn test_ssh(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let host = params::required_str_any(&params, &["host_id", "host_ref"])?;
    let command = params::required_str(&params, "command")?;
    let timeout_ms = params::optional_u64(&params, "timeout_ms")?.unwrap_or(DEFAULT_SSH_TEST_TIMEOUT_MS);
    let mut fields = Map::new();
    fields.insert("host_ref".into(), json!(host));
    fields.insert("command".into(), json!(command));
    fields.insert("timeout_ms".into(), json!(timeout_ms));
    run_test(&automation, "ssh_cmd", fields).await
}
