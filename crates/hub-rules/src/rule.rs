//! Rule definition and its JSON forms

use crate::condition::{Condition, Logic};
use crate::error::{RuleError, RuleResult};
use hub_actions::ActionRef;
use hub_core::MAX_NAME_LEN;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Instant;

/// Fields understood by [`Rule::from_json`]
pub const KNOWN_FIELDS: &[&str] = &[
    "id",
    "name",
    "enabled",
    "cooldown_ms",
    "logic",
    "conditions",
    "actions",
    "trigger_count",
    "last_trigger_ms",
];

/// `conditions` is either a plain list or the nested `{logic, items}` group
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConditionsField {
    List(Vec<Condition>),
    Group {
        #[serde(default)]
        logic: Option<Logic>,
        #[serde(default)]
        items: Vec<Condition>,
    },
}

#[derive(Debug, Deserialize)]
struct RuleConfig {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    cooldown_ms: u64,
    #[serde(default)]
    logic: Option<Logic>,
    #[serde(default)]
    conditions: Option<ConditionsField>,
    #[serde(default)]
    actions: Vec<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub cooldown_ms: u64,
    pub logic: Logic,
    pub conditions: Vec<Condition>,
    pub actions: Vec<ActionRef>,
    pub trigger_count: u64,
    /// Wall-clock time of the last firing in unix milliseconds, 0 if never
    pub last_trigger_ms: i64,
    /// Monotonic time of the last firing, used by the cooldown gate
    #[serde(skip)]
    pub(crate) last_fire: Option<Instant>,
}

impl Rule {
    pub fn new(id: impl Into<String>, logic: Logic, conditions: Vec<Condition>, actions: Vec<ActionRef>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            cooldown_ms: 0,
            logic,
            conditions,
            actions,
            trigger_count: 0,
            last_trigger_ms: 0,
            last_fire: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Parse a rule from its stored or RPC form
    ///
    /// Both the flat form (`logic` next to a `conditions` list) and the nested
    /// form (`conditions: {logic, items}`) are accepted. Counters in the input
    /// are ignored.
    pub fn from_json(json: &serde_json::Value) -> RuleResult<Self> {
        let cfg: RuleConfig = serde_json::from_value(json.clone())
            .map_err(|e| RuleError::InvalidConfig(e.to_string()))?;

        let (logic, conditions) = match cfg.conditions {
            None => (cfg.logic.unwrap_or_default(), Vec::new()),
            Some(ConditionsField::List(items)) => (cfg.logic.unwrap_or_default(), items),
            Some(ConditionsField::Group { logic, items }) => {
                (logic.or(cfg.logic).unwrap_or_default(), items)
            }
        };

        let actions = cfg
            .actions
            .iter()
            .map(ActionRef::from_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RuleError::InvalidConfig(format!("rule {}: {}", cfg.id, e)))?;

        let rule = Self {
            name: cfg.name.filter(|n| !n.is_empty()).unwrap_or_else(|| cfg.id.clone()),
            id: cfg.id,
            enabled: cfg.enabled,
            cooldown_ms: cfg.cooldown_ms,
            logic,
            conditions,
            actions,
            trigger_count: 0,
            last_trigger_ms: 0,
            last_fire: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> RuleResult<()> {
        if self.id.is_empty() || self.id.len() > MAX_NAME_LEN {
            return Err(RuleError::InvalidConfig(format!(
                "rule id must be 1..={} bytes",
                MAX_NAME_LEN
            )));
        }
        if let Some(c) = self.conditions.iter().find(|c| c.variable.is_empty()) {
            return Err(RuleError::InvalidConfig(format!(
                "rule {}: condition '{}' has no variable",
                self.id, c.operator
            )));
        }
        Ok(())
    }

    /// Serialized form including counters, as returned over RPC
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Serialized form for the config table, without runtime counters
    pub fn to_config_json(&self) -> serde_json::Value {
        let mut json = self.to_json();
        if let Some(obj) = json.as_object_mut() {
            obj.remove("trigger_count");
            obj.remove("last_trigger_ms");
        }
        json
    }

    /// Variable names this rule's conditions read
    pub fn referenced_variables(&self) -> BTreeSet<&str> {
        self.conditions.iter().map(|c| c.variable.as_str()).collect()
    }

    /// Whether any condition depends on the previous-value table
    pub fn uses_edges(&self) -> bool {
        self.conditions.iter().any(|c| c.operator.is_edge())
    }

    /// Definition equality, ignoring counters
    pub fn same_definition(&self, other: &Rule) -> bool {
        self.to_config_json() == other.to_config_json()
    }
}
