//! Rule engine for the automation hub
//!
//! A rule is a list of conditions over variables, combined with AND or OR,
//! plus an ordered action list and a cooldown.
//!
//! # Key Types
//!
//! - [`Rule`] - Condition set, actions and trigger bookkeeping
//! - [`Condition`] - One `variable operator value` test
//! - [`RuleManager`] - The rule table, indexed by referenced variable
//! - [`ConditionEvaluator`] - Evaluates conditions and owns the previous-value table
//! - [`RuleEngine`] - Reacts to variable changes and hands firings to the dispatcher

pub mod condition;
mod engine;
mod error;
pub mod evaluator;
mod manager;
pub mod rule;

pub use condition::{Condition, Logic, Operator};
pub use engine::{RuleEngine, RuleStats};
pub use error::{RuleError, RuleResult};
pub use evaluator::{ConditionEvaluator, Evaluation, Observation};
pub use manager::{FireGate, RuleManager, MAX_RULES};
pub use rule::Rule;
