//! Core types for the automation hub
//!
//! This crate provides the fundamental types shared by every other crate:
//! the typed [`Value`], JSON path extraction and enumeration, variable names,
//! events and their [`Context`], and the uniform error taxonomy.

mod context;
mod error;
mod event;
mod name;
pub mod path;
mod transform;
mod value;

pub use context::Context;
pub use error::{ErrorCode, HubError, HubResult};
pub use event::{Event, EventData, EventType};
pub use name::{prefix_of, NameError, VariableName};
pub use path::{PathEntry, PathError, PathSegment};
pub use transform::{ArithOp, Transform, TransformError};
pub use value::{Value, FLOAT_EPSILON};

/// Maximum length in bytes of a string value
pub const MAX_STRING_LEN: usize = 128;

/// Maximum length of a variable name
pub const MAX_NAME_LEN: usize = 64;

/// Maximum depth walked by the path enumerator
pub const MAX_ENUM_DEPTH: usize = 5;

/// Maximum length of an enumerator sample
pub const MAX_SAMPLE_LEN: usize = 50;

/// Payloads of the variable lifecycle events
pub mod events {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct VariableCreatedData {
        pub name: String,
        pub value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub source_id: Option<String>,
    }

    impl EventData for VariableCreatedData {
        fn kind() -> EventType {
            EventType::VariableCreated
        }
    }

    /// Fired only when the stored value actually differs
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct VariableChangedData {
        pub name: String,
        pub old_value: Value,
        pub new_value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub source_id: Option<String>,
    }

    impl EventData for VariableChangedData {
        fn kind() -> EventType {
            EventType::VariableChanged
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct VariableRemovedData {
        pub name: String,
        pub last_value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub source_id: Option<String>,
    }

    impl EventData for VariableRemovedData {
        fn kind() -> EventType {
            EventType::VariableRemoved
        }
    }
}
