//! Variable name type: a dotted identifier such as `cpu.usage`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::MAX_NAME_LEN;

/// Error type for invalid variable names
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("variable name cannot be empty")]
    Empty,

    #[error("variable name exceeds {MAX_NAME_LEN} characters")]
    TooLong,

    #[error("variable name contains an empty segment")]
    EmptySegment,

    #[error("variable name contains invalid characters (allowed: alphanumeric, '_', '-', '.')")]
    InvalidChars,
}

/// A validated variable name
///
/// The part before the first `.` is the owning source prefix, so
/// `cpu.usage` belongs to source `cpu` unless an explicit source id is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableName(String);

impl VariableName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Check a name without allocating
    pub fn validate(name: &str) -> Result<(), NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        if name.split('.').any(|seg| seg.is_empty()) {
            return Err(NameError::EmptySegment);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(NameError::InvalidChars);
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The dot prefix of the name, if it has one
    pub fn prefix(&self) -> Option<&str> {
        prefix_of(&self.0)
    }
}

/// The dot prefix of a raw name (`"a.b.c"` → `"a"`)
pub fn prefix_of(name: &str) -> Option<&str> {
    name.split_once('.').map(|(p, _)| p).filter(|p| !p.is_empty())
}

impl FromStr for VariableName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VariableName {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<VariableName> for String {
    fn from(name: VariableName) -> Self {
        name.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VariableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
