//! Rule endpoints

use super::persist;
use hub_automation::Automation;
use hub_core::HubResult;
use hub_rpc::params;
use hub_rules::Rule;
use serde_json::{json, Value as Json};
use std::sync::Arc;

fn summary(rule: &Rule) -> Json {
    json!({
        "id": rule.id,
        "name": rule.name,
        "enabled": rule.enabled,
        "trigger_count": rule.trigger_count,
        "last_trigger_ms": rule.last_trigger_ms,
        "cooldown_ms": rule.cooldown_ms,
        "conditions_count": rule.conditions.len(),
        "actions_count": rule.actions.len(),
    })
}

pub async fn list(automation: Arc<Automation>, _params: Json) -> HubResult<Json> {
    let rules: Vec<Json> = automation.rules().rules().list().iter().map(summary).collect();
    Ok(json!({"count": rules.len(), "rules": rules}))
}

pub async fn get(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let rule = automation
        .rules()
        .rules()
        .get(id)
        .ok_or_else(|| hub_core::HubError::not_found(format!("rule {}", id)))?;
    Ok(rule.to_json())
}

/// Params: the rule object; `replace: true` overwrites an existing rule
pub async fn add(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let replace = params::optional_bool(&params, "replace")?.unwrap_or(false);
    let rule = Rule::from_json(&params)?;
    let id = rule.id.clone();
    if replace {
        automation.rules().replace_rule(rule)?;
    } else {
        automation.rules().add_rule(rule)?;
    }
    persist(&automation).await;
    Ok(json!({"id": id}))
}

pub async fn enable(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.rules().rules().enable(id)?;
    persist(&automation).await;
    Ok(json!({"id": id, "enabled": true}))
}

pub async fn disable(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.rules().rules().disable(id)?;
    persist(&automation).await;
    Ok(json!({"id": id, "enabled": false}))
}

pub async fn delete(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    automation.rules().remove_rule(id)?;
    persist(&automation).await;
    Ok(json!({"id": id, "deleted": true}))
}

/// Fire a rule now, ignoring its conditions; waits for the action results
pub async fn trigger(automation: Arc<Automation>, params: Json) -> HubResult<Json> {
    let id = params::required_str(&params, "id")?;
    let report = automation.rules().trigger(id).await?;
    Ok(json!({
        "id": id,
        "success_count": report.success_count(),
        "failure_count": report.failure_count(),
        "results": report.results,
    }))
}
