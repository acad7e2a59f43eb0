//! Condition evaluation
//!
//! `changed` and `changed_to` compare against the value this rule last saw
//! for the variable. That table is keyed by (rule id, variable name) so two
//! rules watching the same variable each see every edge.

use crate::condition::{compare, Comparison, Logic, Operator};
use crate::rule::Rule;
use hub_core::Value;
use hub_variables::VariableStore;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// The change that caused an evaluation
///
/// The triggering variable is read from here instead of the store, so a
/// burst of writes is evaluated one value at a time.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub name: &'a str,
    pub value: &'a Value,
    /// Value before the change; `None` when the variable was just created
    pub old_value: Option<&'a Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub matched: bool,
    /// Conditions that compared incompatible types
    pub errors: u32,
}

#[derive(Default)]
pub struct ConditionEvaluator {
    previous: Mutex<HashMap<(String, String), Value>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(vars: &VariableStore, name: &str, trigger: Option<&Observation<'_>>) -> Option<Value> {
        match trigger {
            Some(t) if t.name == name => Some(t.value.clone()),
            _ => vars.get(name).ok(),
        }
    }

    /// Evaluate a rule's conditions in order, short-circuiting
    ///
    /// An empty condition list never matches. A missing variable makes its
    /// condition false. Every edge condition of the rule records the current
    /// value, whether or not short-circuiting reached it.
    pub fn evaluate(&self, rule: &Rule, vars: &VariableStore, trigger: Option<&Observation<'_>>) -> Evaluation {
        let mut eval = Evaluation::default();
        if rule.conditions.is_empty() {
            return eval;
        }

        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen: HashMap<&str, Option<Value>> = HashMap::new();
        let mut decided: Option<bool> = None;

        for cond in &rule.conditions {
            let current = seen
                .entry(cond.variable.as_str())
                .or_insert_with(|| Self::current(vars, &cond.variable, trigger))
                .clone();

            if decided.is_some() {
                continue;
            }

            let result = match (&current, cond.operator) {
                (None, _) => false,
                (Some(cur), Operator::Changed | Operator::ChangedTo) => {
                    let key = (rule.id.clone(), cond.variable.clone());
                    let prev = previous.get(&key).cloned().or_else(|| {
                        trigger
                            .filter(|t| t.name == cond.variable)
                            .and_then(|t| t.old_value.cloned())
                    });
                    let changed = prev.is_some_and(|p| !p.loose_eq(cur));
                    changed && (cond.operator == Operator::Changed || cur.loose_eq(&cond.value))
                }
                (Some(cur), op) => match compare(op, cur, &cond.value) {
                    Comparison::Match => true,
                    Comparison::NoMatch => false,
                    Comparison::Incompatible => {
                        trace!(rule = %rule.id, variable = %cond.variable, %op, "Incompatible comparison");
                        eval.errors += 1;
                        false
                    }
                },
            };

            match rule.logic {
                Logic::And if !result => decided = Some(false),
                Logic::Or if result => decided = Some(true),
                _ => {}
            }
        }

        for cond in rule.conditions.iter().filter(|c| c.operator.is_edge()) {
            if let Some(Some(cur)) = seen.get(cond.variable.as_str()) {
                previous.insert((rule.id.clone(), cond.variable.clone()), cur.clone());
            }
        }

        eval.matched = decided.unwrap_or(rule.logic == Logic::And);
        eval
    }

    /// Drop a rule's previous-value entries
    pub fn forget(&self, rule_id: &str) {
        self.previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(rule, _), _| rule != rule_id);
    }

    pub fn clear(&self) {
        self.previous.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
