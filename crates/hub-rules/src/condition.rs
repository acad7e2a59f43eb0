//! Conditions: `variable operator value`

use hub_core::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    Changed,
    ChangedTo,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Ge => "ge",
            Operator::Lt => "lt",
            Operator::Le => "le",
            Operator::Contains => "contains",
            Operator::Changed => "changed",
            Operator::ChangedTo => "changed_to",
        }
    }

    /// Whether the operator reads the previous-value table
    pub fn is_edge(&self) -> bool {
        matches!(self, Operator::Changed | Operator::ChangedTo)
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "==" => Operator::Eq,
            "ne" | "!=" => Operator::Ne,
            "gt" | ">" => Operator::Gt,
            "ge" | "gte" | ">=" => Operator::Ge,
            "lt" | "<" => Operator::Lt,
            "le" | "lte" | "<=" => Operator::Le,
            "contains" => Operator::Contains,
            "changed" => Operator::Changed,
            "changed_to" => Operator::ChangedTo,
            other => return Err(format!("unknown operator '{}'", other)),
        })
    }
}

impl TryFrom<String> for Operator {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule combines its conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(alias = "variable_name", alias = "var")]
    pub variable: String,
    #[serde(alias = "op")]
    pub operator: Operator,
    /// Comparison operand; ignored by `changed`
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(variable: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            variable: variable.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Outcome of a non-edge comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Match,
    NoMatch,
    /// Operand types cannot be compared with this operator
    Incompatible,
}

impl From<bool> for Comparison {
    fn from(b: bool) -> Self {
        if b {
            Comparison::Match
        } else {
            Comparison::NoMatch
        }
    }
}

/// Compare a current value against a condition operand
///
/// A string never equals a non-string, so `ne` matches across types while
/// ordering operators report the pair as incompatible.
pub fn compare(op: Operator, current: &Value, operand: &Value) -> Comparison {
    use std::cmp::Ordering::*;

    match op {
        Operator::Eq => current.loose_eq(operand).into(),
        Operator::Ne => (!current.loose_eq(operand)).into(),
        Operator::Contains => match (current.as_str(), operand.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle).into(),
            _ => Comparison::Incompatible,
        },
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            let Some(ord) = current.compare(operand) else {
                return Comparison::Incompatible;
            };
            match op {
                Operator::Gt => ord == Greater,
                Operator::Ge => ord != Less,
                Operator::Lt => ord == Less,
                _ => ord != Greater,
            }
            .into()
        }
        Operator::Changed | Operator::ChangedTo => Comparison::Incompatible,
    }
}
