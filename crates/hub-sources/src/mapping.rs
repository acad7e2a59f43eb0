//! Mapping engine: JSON payload to variable store

use crate::source::Mapping;
use hub_core::{path, Context, Value};
use hub_variables::VariableStore;
use tracing::{trace, warn};

/// What one pass of the mapping engine did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingOutcome {
    /// Mappings whose path resolved and whose value was stored
    pub applied: usize,
    /// Stored values that changed
    pub changed: usize,
    /// Strings cut to the maximum value length
    pub truncated: usize,
    /// Transform or store failures
    pub errors: usize,
}

/// Coerce the JSON node at `mapping.json_path` and store it
///
/// Paths that do not resolve are skipped without touching the variable.
pub fn apply_mapping(
    source_id: &str,
    mapping: &Mapping,
    payload: &serde_json::Value,
    vars: &VariableStore,
    outcome: &mut MappingOutcome,
) {
    let Some(node) = path::extract(payload, &mapping.json_path) else {
        trace!(source = source_id, path = %mapping.json_path, "Path absent in payload");
        return;
    };

    let (mut value, truncated) = Value::from_json(node);
    if truncated {
        outcome.truncated += 1;
    }

    match mapping.parsed_transform() {
        Ok(Some(t)) => match t.apply(&value) {
            Ok(v) => value = v,
            Err(e) => {
                warn!(source = source_id, var = %mapping.var_name, error = %e, "Transform failed");
                outcome.errors += 1;
                return;
            }
        },
        Ok(None) => {}
        Err(e) => {
            warn!(source = source_id, var = %mapping.var_name, error = %e, "Bad transform");
            outcome.errors += 1;
            return;
        }
    }

    match vars.upsert(&mapping.var_name, value, Context::for_source(source_id)) {
        Ok(res) => {
            outcome.applied += 1;
            if res.changed {
                outcome.changed += 1;
            }
        }
        Err(e) => {
            warn!(source = source_id, var = %mapping.var_name, error = %e, "Store write failed");
            outcome.errors += 1;
        }
    }
}

/// Run every mapping of a source against one payload
pub fn apply_mappings(
    source_id: &str,
    mappings: &[Mapping],
    payload: &serde_json::Value,
    vars: &VariableStore,
) -> MappingOutcome {
    let mut outcome = MappingOutcome::default();
    for m in mappings {
        apply_mapping(source_id, m, payload, vars, &mut outcome);
    }
    outcome
}
