//! Action Template Registry
//!
//! Named, reusable action definitions. Rules reference templates by id and
//! the dispatcher resolves the reference when it dequeues the entry, so an
//! edit made while a firing is pending is what executes.

use crate::action::Action;
use crate::error::{ActionError, ActionResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const MAX_TEMPLATES: usize = 64;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub action: Action,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ActionTemplate {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            enabled: true,
            action,
            use_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Build from an RPC parameter object
    ///
    /// The action may be given under `action` or flattened into the
    /// template object itself (`{"id": "t", "type": "led", ...}`).
    pub fn from_json(json: &serde_json::Value) -> ActionResult<Self> {
        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ActionError::InvalidAction("missing 'id'".into()))?;

        let action = match json.get("action") {
            Some(a) if a.is_object() => Action::from_json(a)?,
            _ => {
                let mut flat = json.clone();
                if let Some(obj) = flat.as_object_mut() {
                    for key in ["id", "name", "description", "enabled"] {
                        obj.remove(key);
                    }
                }
                Action::from_json(&flat)?
            }
        };

        let mut tpl = ActionTemplate::new(id, action);
        if let Some(name) = json.get("name").and_then(|v| v.as_str()) {
            tpl.name = name.to_string();
        }
        if let Some(desc) = json.get("description").and_then(|v| v.as_str()) {
            tpl.description = desc.to_string();
        }
        if let Some(enabled) = json.get("enabled").and_then(|v| v.as_bool()) {
            tpl.enabled = enabled;
        }
        Ok(tpl)
    }
}

#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, ActionTemplate>,
    insert_lock: Mutex<()>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, template), fields(id = %template.id))]
    pub fn add(&self, template: ActionTemplate) -> ActionResult<()> {
        template.action.validate()?;
        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.templates.contains_key(&template.id) {
            return Err(ActionError::TemplateExists(template.id));
        }
        if self.templates.len() >= MAX_TEMPLATES {
            return Err(ActionError::RegistryFull("action template"));
        }
        info!(action = template.action.type_name(), "Adding action template");
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    /// Replace the definition of an existing template, keeping its counters
    #[instrument(skip(self, template), fields(id = %template.id))]
    pub fn update(&self, mut template: ActionTemplate) -> ActionResult<()> {
        template.action.validate()?;
        let mut entry = self
            .templates
            .get_mut(&template.id)
            .ok_or_else(|| ActionError::TemplateNotFound(template.id.clone()))?;
        template.use_count = entry.use_count;
        template.created_at = entry.created_at;
        template.last_used_at = entry.last_used_at;
        debug!("Updating action template");
        *entry = template;
        Ok(())
    }

    /// Add, or update when the id is already present
    pub fn upsert(&self, template: ActionTemplate) -> ActionResult<()> {
        if self.templates.contains_key(&template.id) {
            self.update(template)
        } else {
            self.add(template)
        }
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> ActionResult<ActionTemplate> {
        self.templates
            .remove(id)
            .map(|(_, t)| t)
            .ok_or_else(|| ActionError::TemplateNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<ActionTemplate> {
        self.templates.get(id).map(|t| t.clone())
    }

    /// All templates ordered by id
    pub fn list(&self) -> Vec<ActionTemplate> {
        let mut all: Vec<ActionTemplate> =
            self.templates.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn count(&self) -> usize {
        self.templates.len()
    }

    pub fn clear(&self) {
        self.templates.clear();
    }

    pub fn record_use(&self, id: &str) {
        if let Some(mut tpl) = self.templates.get_mut(id) {
            tpl.use_count += 1;
            tpl.last_used_at = Some(Utc::now());
        }
    }

    /// Current action of a template with an optional delay override
    ///
    /// Counts as a use.
    pub fn resolve(&self, id: &str, delay_override: Option<u64>) -> ActionResult<Action> {
        let mut action = {
            let mut tpl = self
                .templates
                .get_mut(id)
                .ok_or_else(|| ActionError::TemplateNotFound(id.to_string()))?;
            if !tpl.enabled {
                return Err(ActionError::TemplateDisabled(id.to_string()));
            }
            tpl.use_count += 1;
            tpl.last_used_at = Some(Utc::now());
            tpl.action.clone()
        };
        if let Some(delay) = delay_override {
            action.delay_ms = delay;
        }
        Ok(action)
    }

    /// Replace the contents with entries loaded from storage
    ///
    /// Invalid entries are skipped with a warning. Returns the number loaded.
    pub fn load(&self, entries: &[serde_json::Value]) -> usize {
        self.templates.clear();
        let mut loaded = 0;
        for entry in entries {
            let parsed = serde_json::from_value::<ActionTemplate>(entry.clone())
                .map_err(|e| ActionError::InvalidAction(e.to_string()))
                .or_else(|_| ActionTemplate::from_json(entry));
            match parsed.and_then(|t| self.add(t)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(error = %e, "Skipping stored action template"),
            }
        }
        loaded
    }

    pub fn to_vec(&self) -> Vec<ActionTemplate> {
        self.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, LogAction};
    use serde_json::json;

    fn log_action(msg: &str) -> Action {
        Action::new(ActionKind::Log(LogAction {
            message: msg.into(),
            level: 3,
        }))
    }

    #[test]
    fn test_add_get_remove() {
        let reg = TemplateRegistry::new();
        reg.add(ActionTemplate::new("t1", log_action("a"))).unwrap();
        assert!(matches!(
            reg.add(ActionTemplate::new("t1", log_action("b"))),
            Err(ActionError::TemplateExists(_))
        ));
        assert_eq!(reg.get("t1").unwrap().name, "t1");
        assert_eq!(reg.count(), 1);
        reg.remove("t1").unwrap();
        assert!(matches!(reg.remove("t1"), Err(ActionError::TemplateNotFound(_))));
    }

    #[test]
    fn test_capacity() {
        let reg = TemplateRegistry::new();
        for i in 0..MAX_TEMPLATES {
            reg.add(ActionTemplate::new(format!("t{i}"), log_action("x")))
                .unwrap();
        }
        assert!(matches!(
            reg.add(ActionTemplate::new("overflow", log_action("x"))),
            Err(ActionError::RegistryFull(_))
        ));
    }

    #[test]
    fn test_resolve_counts_use_and_overrides_delay() {
        let reg = TemplateRegistry::new();
        reg.add(ActionTemplate::new("t", log_action("x").with_delay(50)))
            .unwrap();

        assert_eq!(reg.resolve("t", None).unwrap().delay_ms, 50);
        assert_eq!(reg.resolve("t", Some(200)).unwrap().delay_ms, 200);

        let tpl = reg.get("t").unwrap();
        assert_eq!(tpl.use_count, 2);
        assert!(tpl.last_used_at.is_some());
    }

    #[test]
    fn test_update_keeps_counters() {
        let reg = TemplateRegistry::new();
        reg.add(ActionTemplate::new("t", log_action("old"))).unwrap();
        reg.record_use("t");
        reg.update(ActionTemplate::new("t", log_action("new"))).unwrap();

        let tpl = reg.get("t").unwrap();
        assert_eq!(tpl.use_count, 1);
        assert_eq!(tpl.action, log_action("new"));
    }

    #[test]
    fn test_disabled_template_does_not_resolve() {
        let reg = TemplateRegistry::new();
        let mut tpl = ActionTemplate::new("t", log_action("x"));
        tpl.enabled = false;
        reg.add(tpl).unwrap();
        assert!(matches!(
            reg.resolve("t", None),
            Err(ActionError::TemplateDisabled(_))
        ));
    }

    #[test]
    fn test_from_json_flat_and_nested() {
        let flat = ActionTemplate::from_json(&json!({
            "id": "tpl1",
            "name": "Green",
            "type": "led",
            "led": {"device": "board", "color": "#00FF00"}
        }))
        .unwrap();
        assert_eq!(flat.name, "Green");
        assert_eq!(flat.action.type_name(), "led");

        let nested = ActionTemplate::from_json(&json!({
            "id": "tpl2",
            "action": {"type": "log", "message": "m"}
        }))
        .unwrap();
        assert_eq!(nested.name, "tpl2");
        assert!(ActionTemplate::from_json(&json!({"type": "log", "message": "m"})).is_err());
    }

    #[test]
    fn test_load_skips_invalid() {
        let reg = TemplateRegistry::new();
        let stored = serde_json::to_value(ActionTemplate::new("ok", log_action("x"))).unwrap();
        let n = reg.load(&[stored, json!({"id": "bad", "type": "nope"})]);
        assert_eq!(n, 1);
        assert!(reg.get("ok").is_some());
    }
}
