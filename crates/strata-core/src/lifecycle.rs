use crate::CoreError;
use strata_store::LayerStatus;

/// Check a layer status change. `None` is a layer with no record.
///
/// A `destroyed` tombstone marks an interrupted destroy: it can only move to
/// `failed` or be destroyed again, never straight back to `succeeded`.
pub fn validate_transition(from: Option<LayerStatus>, to: LayerStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            None | Some(LayerStatus::Succeeded | LayerStatus::Failed),
            LayerStatus::Succeeded | LayerStatus::Failed
        ) | (
            Some(LayerStatus::Succeeded | LayerStatus::Failed | LayerStatus::Destroyed),
            LayerStatus::Destroyed
        ) | (Some(LayerStatus::Destroyed), LayerStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.map_or_else(|| "absent".to_owned(), |s| s.to_string()),
            to: to.to_string(),
        })
    }
}
