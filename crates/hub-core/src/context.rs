//! Write origin carried by store writes and events

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Who performed a write, and which write caused it
///
/// A READONLY variable accepts writes only when `source_id` names its
/// owning source. Rule firings and `set_var` actions chain their writes to
/// the triggering one through `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// ULID
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Context of the write that caused this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// A write from the API or the engine itself
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            source_id: None,
            parent_id: None,
        }
    }

    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            source_id: Some(source_id.into()),
            parent_id: None,
        }
    }

    /// Context for a write caused by this one; keeps the source
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            source_id: self.source_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }

    pub fn is_source(&self, source_id: &str) -> bool {
        self.source_id.as_deref() == Some(source_id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_source() {
        let parent = Context::for_source("rest1");
        let child = parent.child();

        assert!(child.is_source("rest1"));
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_ne!(child.id, parent.id);
    }
}
