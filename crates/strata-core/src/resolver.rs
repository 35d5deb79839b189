//! Read-only access to upstream layer outputs.

use crate::workspace::WorkspaceHandle;
use crate::CoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use strata_schema::Layer;

/// Outputs published by `layer` in the handle's environment.
///
/// A missing record or one whose last status is not `succeeded` is a hard
/// error; outputs are never defaulted.
pub fn resolve(ws: &WorkspaceHandle, layer: &str) -> Result<BTreeMap<String, Value>, CoreError> {
    match ws.get(layer)? {
        Some(state) if state.is_succeeded() => Ok(state.outputs),
        _ => Err(CoreError::UpstreamNotApplied {
            layer: layer.to_owned(),
            environment: ws.name().to_string(),
        }),
    }
}

/// Values for every input `layer` declares, keyed by input key.
pub fn resolve_inputs(
    ws: &WorkspaceHandle,
    layer: &Layer,
) -> Result<BTreeMap<String, Value>, CoreError> {
    let mut cache: BTreeMap<&str, BTreeMap<String, Value>> = BTreeMap::new();
    let mut values = BTreeMap::new();
    for input in &layer.inputs {
        let from = input.from.as_str();
        if !cache.contains_key(from) {
            cache.insert(from, resolve(ws, from)?);
        }
        let value = cache
            .get(from)
            .and_then(|outputs| outputs.get(&input.key))
            .ok_or_else(|| CoreError::OutputKeyMissing {
                layer: from.to_owned(),
                environment: ws.name().to_string(),
                key: input.key.clone(),
            })?;
        values.insert(input.key.clone(), value.clone());
    }
    Ok(values)
}
