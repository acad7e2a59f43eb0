//! Mapping transforms applied to extracted values before they are stored
//!
//! Accepted forms: a single arithmetic step against a number (`* 0.001`,
//! `/1024`, `+ 10`, `- 273.15`) optionally followed by `round(n)`, a lone
//! `round(n)`, or one of the keywords `int`, `float`, `string`, `bool`,
//! `percent`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("unrecognized transform: {0}")]
    Syntax(String),

    #[error("transform needs a numeric input, got {0}")]
    NotNumeric(&'static str),

    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn symbol(self) -> char {
        match self {
            ArithOp::Add => '+',
            ArithOp::Sub => '-',
            ArithOp::Mul => '*',
            ArithOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Arith {
        op: ArithOp,
        operand: f64,
        round: Option<u32>,
    },
    Round(u32),
    Int,
    Float,
    String,
    Bool,
    Percent,
}

fn parse_round(s: &str) -> Option<u32> {
    let inner = s.trim().strip_prefix("round(")?.strip_suffix(')')?;
    inner.trim().parse::<u32>().ok().filter(|n| *n <= 9)
}

fn round_to(x: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (x * factor).round() / factor
}

impl FromStr for Transform {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let syntax = || TransformError::Syntax(raw.to_string());

        match raw.to_ascii_lowercase().as_str() {
            "int" => return Ok(Transform::Int),
            "float" => return Ok(Transform::Float),
            "string" => return Ok(Transform::String),
            "bool" => return Ok(Transform::Bool),
            "percent" => return Ok(Transform::Percent),
            _ => {}
        }
        if let Some(n) = parse_round(raw) {
            return Ok(Transform::Round(n));
        }

        let mut chars = raw.chars();
        let op = match chars.next() {
            Some('+') => ArithOp::Add,
            Some('-') => ArithOp::Sub,
            Some('*') => ArithOp::Mul,
            Some('/') => ArithOp::Div,
            _ => return Err(syntax()),
        };
        let rest = chars.as_str().trim();

        // Split "0.001 round(2)" / "0.001|round(2)" into operand and suffix
        let (num, round) = match rest.find(|c: char| c == '|' || c == ';' || c.is_whitespace()) {
            Some(pos) => {
                let suffix = rest[pos..].trim_start_matches(|c: char| c == '|' || c == ';' || c.is_whitespace());
                (&rest[..pos], Some(parse_round(suffix).ok_or_else(syntax)?))
            }
            None => (rest, None),
        };
        let operand = num.trim().parse::<f64>().map_err(|_| syntax())?;
        if !operand.is_finite() {
            return Err(syntax());
        }
        if op == ArithOp::Div && operand == 0.0 {
            return Err(TransformError::DivisionByZero);
        }
        Ok(Transform::Arith { op, operand, round })
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Arith { op, operand, round } => {
                write!(f, "{} {}", op.symbol(), operand)?;
                if let Some(n) = round {
                    write!(f, " round({})", n)?;
                }
                Ok(())
            }
            Transform::Round(n) => write!(f, "round({})", n),
            Transform::Int => f.write_str("int"),
            Transform::Float => f.write_str("float"),
            Transform::String => f.write_str("string"),
            Transform::Bool => f.write_str("bool"),
            Transform::Percent => f.write_str("percent"),
        }
    }
}

impl Transform {
    pub fn apply(&self, input: &Value) -> Result<Value, TransformError> {
        let numeric = || input.as_f64().ok_or(TransformError::NotNumeric(input.type_name()));

        match self {
            Transform::Arith { op, operand, round } => {
                if let (Value::Int(i), None) = (input, round) {
                    if operand.fract() == 0.0 && *op != ArithOp::Div {
                        let n = *operand as i64;
                        let exact = match op {
                            ArithOp::Add => i.checked_add(n),
                            ArithOp::Sub => i.checked_sub(n),
                            ArithOp::Mul => i.checked_mul(n),
                            ArithOp::Div => None,
                        };
                        if let Some(v) = exact {
                            return Ok(Value::Int(v));
                        }
                    }
                }
                let x = numeric()?;
                let y = match op {
                    ArithOp::Add => x + operand,
                    ArithOp::Sub => x - operand,
                    ArithOp::Mul => x * operand,
                    ArithOp::Div => x / operand,
                };
                Ok(match round {
                    Some(0) => Value::Int(y.round() as i64),
                    Some(n) => Value::Float(round_to(y, *n)),
                    None => Value::Float(y),
                })
            }
            Transform::Round(0) => Ok(Value::Int(numeric()?.round() as i64)),
            Transform::Round(n) => Ok(Value::Float(round_to(numeric()?, *n))),
            Transform::Int => input
                .as_i64()
                .map(Value::Int)
                .ok_or(TransformError::NotNumeric(input.type_name())),
            Transform::Float => Ok(Value::Float(numeric()?)),
            Transform::String => Ok(Value::string(input.to_string())),
            Transform::Bool => Ok(Value::Bool(input.as_bool().unwrap_or(false))),
            Transform::Percent => Ok(Value::Float(numeric()? * 100.0)),
        }
    }
}
