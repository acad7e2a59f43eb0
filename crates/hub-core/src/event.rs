//! Events published by the variable store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Context;

/// Payload types that know which event kind carries them
pub trait EventData: Clone + Send + Sync + 'static {
    fn kind() -> EventType;
}

/// Kind of an event; unknown names are kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    VariableCreated,
    VariableChanged,
    VariableRemoved,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::VariableCreated => "variable_created",
            EventType::VariableChanged => "variable_changed",
            EventType::VariableRemoved => "variable_removed",
            EventType::Other(name) => name,
        }
    }

    /// One of the three variable lifecycle kinds
    pub fn is_variable(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "variable_created" => EventType::VariableCreated,
            "variable_changed" => EventType::VariableChanged,
            "variable_removed" => EventType::VariableRemoved,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        EventType::from(s.as_str())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bus event
///
/// `seq` is assigned by the bus when the event is fired and increases by
/// one per event, so subscribers can detect gaps after lagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,
    pub data: T,
    #[serde(default)]
    pub seq: u64,
    pub fired_at: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            seq: 0,
            fired_at: Utc::now(),
            context,
        }
    }

    /// Same event with its payload converted
    pub fn map_data<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Event<U>, E> {
        Ok(Event {
            event_type: self.event_type,
            data: f(self.data)?,
            seq: self.seq,
            fired_at: self.fired_at,
            context: self.context,
        })
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::kind(), data, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(EventType::from("variable_changed"), EventType::VariableChanged);
        assert_eq!(EventType::from("exec_done"), EventType::Other("exec_done".into()));
        assert_eq!(String::from(EventType::VariableRemoved), "variable_removed");
        assert!(!EventType::from("custom").is_variable());
    }

    #[test]
    fn test_serializes_as_name() {
        let event = Event::new(EventType::VariableCreated, 1, Context::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "variable_created");
        let back: Event<i32> = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type, EventType::VariableCreated);
    }
}
