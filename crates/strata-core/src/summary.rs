use crate::orchestrator::RunMode;
use crate::FailureKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Resources reconciled and provisioning ran.
    Applied,
    /// Fingerprint matched the last successful apply; nothing ran.
    Unchanged,
    /// Plan: the layer would be applied.
    WouldApply,
    /// Plan: an upstream layer changes first, so inputs are known only after apply.
    Pending,
    Destroyed,
    /// Destroy: there was no record to destroy.
    Absent,
    Failed,
    /// Not started because cancellation was requested.
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Applied => "applied",
            OutcomeStatus::Unchanged => "unchanged",
            OutcomeStatus::WouldApply => "would_apply",
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Destroyed => "destroyed",
            OutcomeStatus::Absent => "absent",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeStatus::Failed | OutcomeStatus::Cancelled)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerOutcome {
    pub layer: String,
    pub status: OutcomeStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<LayerFailure>,
}

impl LayerOutcome {
    pub fn new(layer: impl Into<String>, status: OutcomeStatus) -> Self {
        Self {
            layer: layer.into(),
            status,
            duration_ms: 0,
            detail: None,
            fingerprint: None,
            warnings: Vec::new(),
            failure: None,
        }
    }
}

/// Result of one orchestrator invocation. Reported, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub environment: String,
    pub mode: RunMode,
    pub layers: Vec<LayerOutcome>,
    pub overall_succeeded: bool,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, environment: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: run_id.into(),
            environment: environment.into(),
            mode,
            layers: Vec::new(),
            overall_succeeded: true,
        }
    }

    pub fn push(&mut self, outcome: LayerOutcome) {
        if outcome.status.is_failure() {
            self.overall_succeeded = false;
        }
        self.layers.push(outcome);
    }

    /// The first layer that failed or was cancelled; the run stopped there.
    pub fn first_failure(&self) -> Option<&LayerOutcome> {
        self.layers.iter().find(|o| o.status.is_failure())
    }

    pub fn outcome(&self, layer: &str) -> Option<&LayerOutcome> {
        self.layers.iter().find(|o| o.layer == layer)
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.layers.iter().filter(|o| o.status == status).count()
    }

    pub fn warnings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.layers
            .iter()
            .flat_map(|o| o.warnings.iter().map(move |w| (o.layer.as_str(), w.as_str())))
    }
}
