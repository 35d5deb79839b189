use crate::workspace::WorkspaceHandle;
use crate::CoreError;
use strata_schema::{compute_fingerprint, Artifact, Fingerprint, Layer};
use strata_store::LayerState;

/// Why a layer's provisioning does or does not need to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    NoPriorState,
    NotSucceeded,
    InputsChanged,
    Unchanged,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::NoPriorState => write!(f, "no prior state"),
            TriggerReason::NotSucceeded => write!(f, "last apply did not succeed"),
            TriggerReason::InputsChanged => write!(f, "inputs changed"),
            TriggerReason::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub run: bool,
    pub new_fingerprint: Fingerprint,
    pub previous: Option<Fingerprint>,
    pub reason: TriggerReason,
}

/// Compare the fingerprint of `artifacts` with what `previous` recorded.
pub fn decide(previous: Option<&LayerState>, artifacts: &[Artifact]) -> TriggerDecision {
    let new_fingerprint = compute_fingerprint(artifacts);
    let recorded = previous.and_then(|s| s.last_applied_fingerprint.clone());
    let reason = match previous {
        None => TriggerReason::NoPriorState,
        Some(state) if !state.is_succeeded() => TriggerReason::NotSucceeded,
        Some(_) if recorded.as_ref() != Some(&new_fingerprint) => TriggerReason::InputsChanged,
        Some(_) => TriggerReason::Unchanged,
    };
    TriggerDecision {
        run: reason != TriggerReason::Unchanged,
        new_fingerprint,
        previous: recorded,
        reason,
    }
}

/// Read the layer's record in the handle's environment and decide.
pub fn should_run(
    ws: &WorkspaceHandle,
    layer: &Layer,
    artifacts: &[Artifact],
) -> Result<TriggerDecision, CoreError> {
    let previous = ws.get(&layer.name)?;
    Ok(decide(previous.as_ref(), artifacts))
}
