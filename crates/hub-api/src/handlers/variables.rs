//! Variable endpoints

use hub_automation::Automation;
use hub_core::{Context, HubError, HubResult, Value};
use hub_rpc::params;
use hub_variables::Variable;
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tracing::debug;

fn describe(var: &Variable) -> Json {
    let mut obj = json!({
        "name": var.name,
        "value": var.value.to_json(),
        "type": var.type_name(),
        "persistent": var.flags.persistent,
        "readonly": var.flags.readonly,
        "last_update_ms": var.last_update_ms,
    });
    if let (Some(source), Some(map)) = (&var.source_id, obj.as_object_mut()) {
        map.insert("source_id".into(), json!(source));
    }
    obj
}

/// Params: optional `prefix`
pub async fn list(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let vars = automation.variables().list(params::optional_str(&params, "prefix"));
    let items: Vec<Json> = vars.iter().map(describe).collect();
    Ok(json!({"count": items.len(), "variables": items}))
}

pub async fn get(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let name = params::required_str(&params, "name")?;
    let var = automation.variables().get_variable(name)?;
    Ok(describe(&var))
}

/// Params: `name`, `value`, optional `create_only`
///
/// An unknown name is created. With `create_only` an existing variable is
/// left untouched and its current value returned.
pub async fn set(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let name = params::required_str(&params, "name")?;
    let raw = params
        .get("value")
        .ok_or_else(|| HubError::invalid("missing 'value'"))?;
    if raw.is_object() || raw.is_array() {
        return Err(HubError::invalid("'value' must be a scalar"));
    }
    let create_only = params::optional_bool(&params, "create_only")?.unwrap_or(false);
    let (value, truncated) = Value::from_json(raw);
    if truncated {
        debug!(variable = %name, "String value truncated");
    }

    let vars = automation.variables();
    if vars.exists(name) {
        if create_only {
            let current = vars.get(name)?;
            return Ok(json!({"name": name, "value": current.to_json(), "created": false}));
        }
        let changed = vars.set(name, value.clone(), Context::new())?;
        return Ok(json!({"name": name, "value": value.to_json(), "created": false, "changed": changed}));
    }

    let outcome = vars.upsert(name, value.clone(), Context::new())?;
    Ok(json!({"name": name, "value": value.to_json(), "created": outcome.created, "changed": outcome.changed}))
}
