//! Parameter extraction for handlers
//!
//! Missing or mistyped fields become `InvalidArgument`.

use hub_core::{HubError, HubResult};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

pub fn required_str<'a>(params: &'a Json, key: &str) -> HubResult<&'a str> {
    params
        .get(key)
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HubError::invalid(format!("missing '{}'", key)))
}

/// The first of several accepted spellings of a string field
pub fn required_str_any<'a>(params: &'a Json, keys: &[&str]) -> HubResult<&'a str> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(Json::as_str).filter(|s| !s.is_empty()))
        .ok_or_else(|| HubError::invalid(format!("missing '{}'", keys.first().copied().unwrap_or(""))))
}

pub fn optional_str<'a>(params: &'a Json, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Json::as_str)
}

pub fn optional_bool(params: &Json, key: &str) -> HubResult<Option<bool>> {
    match params.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HubError::invalid(format!("'{}' must be a boolean", key))),
    }
}

pub fn optional_u64(params: &Json, key: &str) -> HubResult<Option<u64>> {
    match params.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| HubError::invalid(format!("'{}' must be a non-negative integer", key))),
    }
}

pub fn required<'a>(params: &'a Json, key: &str) -> HubResult<&'a Json> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| HubError::invalid(format!("missing '{}'", key)))
}

/// Deserialize the whole parameter object
pub fn parse<T: DeserializeOwned>(params: &Json) -> HubResult<T> {
    serde_json::from_value(params.clone()).map_err(|e| HubError::invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extractors() {
        let p = json!({"id": "r1", "enabled": true, "n": 5, "neg": -1, "empty": ""});
        assert_eq!(required_str(&p, "id").unwrap(), "r1");
        assert!(matches!(required_str(&p, "empty"), Err(HubError::InvalidArgument(_))));
        assert_eq!(required_str_any(&p, &["name", "id"]).unwrap(), "r1");
        assert_eq!(optional_bool(&p, "enabled").unwrap(), Some(true));
        assert!(optional_bool(&p, "id").is_err());
        assert_eq!(optional_u64(&p, "n").unwrap(), Some(5));
        assert_eq!(optional_u64(&p, "missing").unwrap(), None);
        assert!(optional_u64(&p, "neg").is_err());
        assert!(required(&p, "nothing").is_err());
    }
}
