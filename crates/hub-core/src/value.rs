//! The typed value held by every variable

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::MAX_STRING_LEN;

/// Tolerance used when comparing numeric values for equality
pub const FLOAT_EPSILON: f64 = 0.0001;

/// A typed variable value
///
/// Serializes to the plain JSON scalar (`null`, `true`, `42`, `1.5`, `"on"`).
/// Structural equality (`PartialEq`) drives change detection; comparisons
/// used by rule conditions go through [`Value::compare`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Build a string value, truncating at 128 bytes
    pub fn string(s: impl Into<String>) -> Self {
        Self::string_truncated(s).0
    }

    /// Build a string value and report whether it had to be truncated
    pub fn string_truncated(s: impl Into<String>) -> (Self, bool) {
        let mut s = s.into();
        let truncated = truncate_str(&mut s, MAX_STRING_LEN);
        (Value::String(s), truncated)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Numeric view of the value; bools count as 1/0, numeric strings parse
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Value::Bool(b) => Some(*b as i64),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Some(true),
                "false" | "off" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether a strict write of `new` over `self` keeps the variable's type
    ///
    /// Null on either side is always accepted, as is Int over Float and the
    /// reverse.
    pub fn accepts(&self, new: &Value) -> bool {
        self.is_null()
            || new.is_null()
            || std::mem::discriminant(self) == std::mem::discriminant(new)
            || (self.is_numeric() && new.is_numeric())
    }

    /// Ordering between compatible values
    ///
    /// Int, Float and Bool compare numerically (bool as 1/0), with equality
    /// inside [`FLOAT_EPSILON`]. Strings compare with strings only. Anything
    /// else is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::String(_), _) | (_, Value::String(_)) => None,
            (Value::Null, _) | (_, Value::Null) => None,
            (a, b) => {
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                if (x - y).abs() < FLOAT_EPSILON {
                    Some(Ordering::Equal)
                } else {
                    x.partial_cmp(&y)
                }
            }
        }
    }

    /// Equality with numeric promotion; a string never equals a non-string
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Coerce a JSON node into a typed value at the ingestion boundary
    ///
    /// Integer-valued numbers become `Int`, other numbers `Float`. Objects and
    /// arrays are stored as their compact JSON text. The flag reports whether
    /// a string had to be truncated.
    pub fn from_json(json: &serde_json::Value) -> (Value, bool) {
        match json {
            serde_json::Value::Null => (Value::Null, false),
            serde_json::Value::Bool(b) => (Value::Bool(*b), false),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    (Value::Int(i), false)
                } else {
                    let f = n.as_f64().unwrap_or(0.0);
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                        (Value::Int(f as i64), false)
                    } else {
                        (Value::Float(f), false)
                    }
                }
            }
            serde_json::Value::String(s) => Value::string_truncated(s.as_str()),
            other => Value::string_truncated(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Truncate `s` to at most `max` bytes on a char boundary
pub(crate) fn truncate_str(s: &mut String, max: usize) -> bool {
    if s.len() <= max {
        return false;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    true
}

/// Render a float with up to six decimals, trailing zeros trimmed
pub(crate) fn format_float(f: f64) -> String {
    if !f.is_finite() {
        return f.to_string();
    }
    let s = format!("{:.6}", f);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(Value::from_json(&json!(95)).0, Value::Int(95));
        assert_eq!(Value::from_json(&json!(95.0)).0, Value::Int(95));
        assert_eq!(Value::from_json(&json!(95.5)).0, Value::Float(95.5));
        assert_eq!(Value::from_json(&json!(true)).0, Value::Bool(true));
        assert_eq!(Value::from_json(&json!(null)).0, Value::Null);
    }

    #[test]
    fn test_from_json_truncates_long_strings() {
        let long = "é".repeat(100);
        let (value, truncated) = Value::from_json(&json!(long));
        assert!(truncated);
        let s = value.as_str().unwrap();
        assert!(s.len() <= MAX_STRING_LEN);
        assert_eq!(s.len() % 2, 0);
    }

    #[test]
    fn test_from_json_object_becomes_text() {
        let (value, truncated) = Value::from_json(&json!({"a": 1}));
        assert!(!truncated);
        assert_eq!(value, Value::String("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_compare_promotes_numbers() {
        assert_eq!(Value::Int(3).compare(&Value::Float(3.00001)), Some(Ordering::Equal));
        assert_eq!(Value::Int(3).compare(&Value::Float(3.5)), Some(Ordering::Less));
        assert_eq!(Value::Bool(true).compare(&Value::Int(1)), Some(Ordering::Equal));
        assert!(Value::Int(80).compare(&Value::Int(95)).unwrap().is_lt());
    }

    #[test]
    fn test_string_never_equals_non_string() {
        assert!(!Value::string("1").loose_eq(&Value::Int(1)));
        assert_eq!(Value::string("1").compare(&Value::Int(1)), None);
        assert!(Value::string("ready").loose_eq(&Value::string("ready")));
    }

    #[test]
    fn test_accepts() {
        assert!(Value::Int(1).accepts(&Value::Float(2.5)));
        assert!(Value::Null.accepts(&Value::string("x")));
        assert!(Value::string("x").accepts(&Value::Null));
        assert!(!Value::string("x").accepts(&Value::Int(1)));
        assert!(!Value::Bool(true).accepts(&Value::Int(1)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(95.5).to_string(), "95.5");
        assert_eq!(Value::Float(0.1234567).to_string(), "0.123457");
        assert_eq!(Value::Float(2.0).to_string(), "2");
        assert_eq!(Value::Int(-4).to_string(), "-4");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_serde_is_plain_json() {
        assert_eq!(serde_json::to_value(Value::Int(5)).unwrap(), json!(5));
        assert_eq!(serde_json::from_value::<Value>(json!(5)).unwrap(), Value::Int(5));
        assert_eq!(
            serde_json::from_value::<Value>(json!(2.5)).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            serde_json::from_value::<Value>(json!("on")).unwrap(),
            Value::String("on".into())
        );
    }
}
