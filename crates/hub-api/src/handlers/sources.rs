//! Source endpoints

use super::persist;
use hub_automation::Automation;
use hub_core::{HubError, HubResult};
use hub_rpc::params;
use hub_sources::{Mapping, Source};
use serde_json::{json, Value as Json};
use std::sync::Arc;

pub async fn list(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    let sources = automation.sources().list();
    Ok(json!({"count": sources.len(), "sources": sources}))
}

/// Params: the source object, flat with its `type`
pub async fn add(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let source = Source::from_json(&params)?;
    let id = source.id.clone();
    automation.sources().add(source)?;
    persist(&automation).await;
    Ok(json!({"id": id}))
}

/// Variables the source owns are dropped unless an enabled rule reads them
pub async fn delete(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let keep = automation.rules().rules().referenced_variables();
    let dropped = automation.sources().remove_retaining(id, &keep).await?;
    persist(&automation).await;
    Ok(json!({"id": id, "deleted": true, "variables_removed": dropped}))
}

pub async fn enable(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.sources().enable(id)?;
    persist(&automation).await;
    Ok(json!({"id": id, "enabled": true}))
}

pub async fn disable(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.sources().disable(id).await?;
    persist(&automation).await;
    Ok(json!({"id": id, "enabled": false}))
}

/// Params: `id`, `json_path`, `var_name`, optional `transform`
pub async fn add_mapping(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let mut mapping = Mapping::new(
        params::required_str(&params, "json_path")?,
        params::required_str(&params, "var_name")?,
    );
    mapping.transform = params::optional_str(&params, "transform")
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    automation.sources().add_mapping(id, mapping.clone())?;
    persist(&automation).await;
    Ok(json!({"id": id, "mapping": mapping}))
}

/// Params: `id` and the mapping's `json_path` or `var_name`
pub async fn remove_mapping(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let key = params::required_str_any(&params, &["var_name", "json_path"])
        .map_err(|_| HubError::invalid("missing 'var_name' or 'json_path'"))?;
    let removed = automation.sources().remove_mapping(id, key)?;
    persist(&automation).await;
    Ok(json!({"id": id, "removed": removed}))
}
