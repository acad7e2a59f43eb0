//! The rule table

use crate::error::{RuleError, RuleResult};
use crate::rule::{Rule, KNOWN_FIELDS};
use chrono::Utc;
use hub_actions::ActionRef;
use hub_config::{keys, warn_unknown_fields};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum number of rules
pub const MAX_RULES: usize = 32;

/// Result of asking to fire a rule
#[derive(Debug, Clone, PartialEq)]
pub enum FireGate {
    /// Counters were bumped; dispatch these actions
    Fire {
        actions: Vec<ActionRef>,
        trigger_count: u64,
    },
    /// Still inside the cooldown window
    Cooldown { remaining_ms: u64 },
}

#[derive(Default)]
struct Table {
    rules: Vec<Rule>,
    /// variable name -> ids of rules whose conditions read it
    by_variable: HashMap<String, Vec<String>>,
}

impl Table {
    fn position(&self, id: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    fn reindex(&mut self) {
        self.by_variable.clear();
        for rule in &self.rules {
            for var in rule.referenced_variables() {
                self.by_variable
                    .entry(var.to_string())
                    .or_default()
                    .push(rule.id.clone());
            }
        }
    }
}

/// Rule table with a variable-name index
///
/// Rules keep insertion order, which is the order candidates are evaluated in.
#[derive(Default)]
pub struct RuleManager {
    table: Mutex<Table>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, rule: Rule) -> RuleResult<()> {
        rule.validate()?;
        let mut table = self.lock();
        if table.position(&rule.id).is_some() {
            return Err(RuleError::AlreadyExists(rule.id));
        }
        if table.rules.len() >= MAX_RULES {
            return Err(RuleError::TableFull(MAX_RULES));
        }
        info!(rule = %rule.id, conditions = rule.conditions.len(), actions = rule.actions.len(), "Added rule");
        table.rules.push(rule);
        table.reindex();
        Ok(())
    }

    /// Replace the definition of an existing rule, or add it
    ///
    /// A replaced rule keeps its position and its counters.
    pub fn replace(&self, mut rule: Rule) -> RuleResult<()> {
        rule.validate()?;
        let mut table = self.lock();
        match table.position(&rule.id) {
            Some(i) => {
                let old = &table.rules[i];
                rule.trigger_count = old.trigger_count;
                rule.last_trigger_ms = old.last_trigger_ms;
                rule.last_fire = old.last_fire;
                debug!(rule = %rule.id, "Replaced rule");
                table.rules[i] = rule;
            }
            None => {
                if table.rules.len() >= MAX_RULES {
                    return Err(RuleError::TableFull(MAX_RULES));
                }
                info!(rule = %rule.id, "Added rule");
                table.rules.push(rule);
            }
        }
        table.reindex();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> RuleResult<Rule> {
        let mut table = self.lock();
        let i = table
            .position(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        let rule = table.rules.remove(i);
        table.reindex();
        info!(rule = %id, "Removed rule");
        Ok(rule)
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        let table = self.lock();
        table.position(id).map(|i| table.rules[i].clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().position(id).is_some()
    }

    pub fn list(&self) -> Vec<Rule> {
        self.lock().rules.clone()
    }

    pub fn count(&self) -> usize {
        self.lock().rules.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().rules.iter().map(|r| r.id.clone()).collect()
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> RuleResult<()> {
        let mut table = self.lock();
        let i = table
            .position(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        table.rules[i].enabled = enabled;
        info!(rule = %id, enabled, "Rule toggled");
        Ok(())
    }

    pub fn enable(&self, id: &str) -> RuleResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> RuleResult<()> {
        self.set_enabled(id, false)
    }

    /// Enabled rules whose conditions read `variable`, in table order
    pub fn candidates(&self, variable: &str) -> Vec<Rule> {
        let table = self.lock();
        let Some(ids) = table.by_variable.get(variable) else {
            return Vec::new();
        };
        table
            .rules
            .iter()
            .filter(|r| r.enabled && ids.contains(&r.id))
            .cloned()
            .collect()
    }

    /// Enabled rules with at least one condition
    pub fn enabled(&self) -> Vec<Rule> {
        self.lock()
            .rules
            .iter()
            .filter(|r| r.enabled && !r.conditions.is_empty())
            .cloned()
            .collect()
    }

    /// Every variable read by some enabled rule
    pub fn referenced_variables(&self) -> HashSet<String> {
        self.lock()
            .rules
            .iter()
            .filter(|r| r.enabled)
            .flat_map(|r| r.referenced_variables().into_iter().map(str::to_string))
            .collect()
    }

    /// Check the rule is enabled and its cooldown open, then record the firing
    ///
    /// Counters are bumped under the table lock, so of two racing callers
    /// only one passes a closed-by-the-other gate.
    pub fn try_fire(&self, id: &str, now: Instant) -> RuleResult<FireGate> {
        let mut table = self.lock();
        let i = table
            .position(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        let rule = &mut table.rules[i];
        if !rule.enabled {
            return Err(RuleError::Disabled(id.to_string()));
        }

        if let Some(last) = rule.last_fire {
            let cooldown = Duration::from_millis(rule.cooldown_ms);
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                let remaining_ms = (cooldown - elapsed).as_millis() as u64;
                return Ok(FireGate::Cooldown { remaining_ms });
            }
        }

        rule.trigger_count += 1;
        rule.last_trigger_ms = Utc::now().timestamp_millis();
        rule.last_fire = Some(now);
        Ok(FireGate::Fire {
            actions: rule.actions.clone(),
            trigger_count: rule.trigger_count,
        })
    }

    /// Zero every rule's trigger counters
    pub fn reset_counters(&self) {
        for rule in self.lock().rules.iter_mut() {
            rule.trigger_count = 0;
            rule.last_trigger_ms = 0;
        }
    }

    /// Load the rules table, skipping invalid entries
    pub fn load(&self, entries: &[serde_json::Value]) -> usize {
        let mut loaded = 0;
        for entry in entries {
            warn_unknown_fields(keys::RULES, entry, KNOWN_FIELDS);
            match Rule::from_json(entry).and_then(|rule| self.add(rule)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(error = %e, "Skipping rule entry"),
            }
        }
        loaded
    }

    /// Serialized rules for the config table
    pub fn configs(&self) -> Vec<serde_json::Value> {
        self.lock().rules.iter().map(Rule::to_config_json).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, Logic, Operator};
    use serde_json::json;

    fn rule(id: &str, var: &str) -> Rule {
        Rule::new(id, Logic::And, vec![Condition::new(var, Operator::Gt, 80i64)], Vec::new())
    }

    #[test]
    fn test_add_get_remove() {
        let m = RuleManager::new();
        m.add(rule("r1", "cpu")).unwrap();
        assert!(matches!(m.add(rule("r1", "cpu")), Err(RuleError::AlreadyExists(_))));
        assert_eq!(m.count(), 1);
        assert_eq!(m.get("r1").unwrap().conditions[0].variable, "cpu");

        m.remove("r1").unwrap();
        assert!(m.get("r1").is_none());
        assert!(matches!(m.remove("r1"), Err(RuleError::NotFound(_))));
    }

    #[test]
    fn test_table_full() {
        let m = RuleManager::new();
        for i in 0..MAX_RULES {
            m.add(rule(&format!("r{i}"), "cpu")).unwrap();
        }
        assert!(matches!(m.add(rule("extra", "cpu")), Err(RuleError::TableFull(_))));
    }

    #[test]
    fn test_candidates_follow_index_and_enabled() {
        let m = RuleManager::new();
        m.add(rule("a", "cpu")).unwrap();
        m.add(rule("b", "mem")).unwrap();
        m.add(rule("c", "cpu")).unwrap();

        let ids: Vec<String> = m.candidates("cpu").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        m.disable("a").unwrap();
        let ids: Vec<String> = m.candidates("cpu").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c"]);
        assert!(m.candidates("disk").is_empty());

        m.remove("c").unwrap();
        assert!(m.candidates("cpu").is_empty());
    }

    #[test]
    fn test_replace_keeps_counters() {
        let m = RuleManager::new();
        m.add(rule("r1", "cpu")).unwrap();
        m.try_fire("r1", Instant::now()).unwrap();

        m.replace(rule("r1", "mem")).unwrap();
        let r = m.get("r1").unwrap();
        assert_eq!(r.trigger_count, 1);
        assert_eq!(r.conditions[0].variable, "mem");
        assert!(m.candidates("cpu").is_empty());
        assert_eq!(m.candidates("mem").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_gate() {
        let m = RuleManager::new();
        m.add(rule("r1", "cpu").with_cooldown(1000)).unwrap();

        let t0 = Instant::now();
        assert!(matches!(m.try_fire("r1", t0).unwrap(), FireGate::Fire { trigger_count: 1, .. }));
        assert_eq!(
            m.try_fire("r1", t0 + Duration::from_millis(400)).unwrap(),
            FireGate::Cooldown { remaining_ms: 600 }
        );
        assert!(matches!(
            m.try_fire("r1", t0 + Duration::from_millis(1000)).unwrap(),
            FireGate::Fire { trigger_count: 2, .. }
        ));
        let r = m.get("r1").unwrap();
        assert_eq!(r.trigger_count, 2);
        assert!(r.last_trigger_ms > 0);
    }

    #[test]
    fn test_load_skips_invalid() {
        let m = RuleManager::new();
        let loaded = m.load(&[
            json!({"id": "ok", "conditions": [{"variable": "x", "operator": "eq", "value": 1}]}),
            json!({"id": "bad", "conditions": [{"variable": "x", "operator": "??"}]}),
            json!({"id": "ok2", "color_scheme": "dark"}),
        ]);
        assert_eq!(loaded, 2);
        assert_eq!(m.ids(), vec!["ok", "ok2"]);
        assert_eq!(m.configs().len(), 2);
    }

    #[test]
    fn test_referenced_variables() {
        let m = RuleManager::new();
        m.add(rule("a", "cpu")).unwrap();
        m.add(rule("b", "mem")).unwrap();
        m.disable("b").unwrap();
        let vars = m.referenced_variables();
        assert!(vars.contains("cpu"));
        assert!(!vars.contains("mem"));
    }
}
