//! Layer orchestration engine for Strata.
//!
//! This crate ties the pipeline schema, the state store and the runtime backends
//! together: `WorkspaceManager` binds a run to one environment partition, the
//! resolver reads upstream outputs, the change trigger decides whether a layer's
//! provisioning must re-run, and the `Orchestrator` drives plan, apply and
//! destroy across the ordered layers, producing a `RunSummary`.

pub mod concurrency;
pub mod drift;
pub mod inputs;
pub mod lifecycle;
pub mod orchestrator;
pub mod resolver;
pub mod summary;
pub mod trigger;
pub mod workspace;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use drift::verify_resources;
pub use inputs::{gather, pipeline_redactor, LayerInputs, ProcessEnv, RenderedResource, SecretSource};
pub use lifecycle::validate_transition;
pub use orchestrator::{load_pipeline, Orchestrator, RunMode, RunOptions, RunPhase};
pub use resolver::{resolve, resolve_inputs};
pub use summary::{LayerFailure, LayerOutcome, OutcomeStatus, RunSummary};
pub use trigger::{decide, should_run, TriggerDecision, TriggerReason};
pub use workspace::{WorkspaceHandle, WorkspaceManager};

use serde::{Deserialize, Serialize};
use strata_runtime::RuntimeError;
use strata_schema::PipelineError;
use strata_store::StoreError;
use thiserror::Error;

fn holder_suffix(holder: &Option<String>) -> String {
    holder.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("environment '{environment}' is unavailable: {reason}")]
    EnvironmentUnavailable { environment: String, reason: String },
    #[error("layer '{layer}' depends on '{dependency}', which is {status} in environment '{environment}'")]
    DependencyNotSatisfied {
        layer: String,
        dependency: String,
        environment: String,
        status: String,
    },
    #[error("layer '{layer}' has not been applied successfully in environment '{environment}'")]
    UpstreamNotApplied { layer: String, environment: String },
    #[error("layer '{layer}' in environment '{environment}' does not publish output '{key}'")]
    OutputKeyMissing {
        layer: String,
        environment: String,
        key: String,
    },
    #[error("layer '{layer}' in environment '{environment}' is locked by another run{}", holder_suffix(.holder))]
    LockContention {
        layer: String,
        environment: String,
        holder: Option<String>,
    },
    #[error("remote execution failed for layer '{layer}' in environment '{environment}': {message}")]
    RemoteExecutionFailed {
        layer: String,
        environment: String,
        message: String,
    },
    #[error("service '{service}' of layer '{layer}' in environment '{environment}' not healthy after {attempts} attempt(s)\n{diagnostics}")]
    HealthCheckExhausted {
        layer: String,
        environment: String,
        service: String,
        attempts: u32,
        diagnostics: String,
    },
    #[error("cannot destroy '{layer}' in environment '{environment}': '{dependent}' is still applied and uses its outputs")]
    DependentStillApplied {
        layer: String,
        dependent: String,
        environment: String,
    },
    #[error("invalid layer status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("variable '{name}' required by layer '{layer}' is not set")]
    MissingSecret { layer: String, name: String },
    #[error("cannot read {path} for layer '{layer}': {message}")]
    Payload {
        layer: String,
        path: String,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockContention {
                layer,
                environment,
                holder,
            } => CoreError::LockContention {
                layer,
                environment,
                holder,
            },
            other => CoreError::Store(other),
        }
    }
}

/// Error class recorded in run summaries and run logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DependencyNotSatisfied,
    UpstreamNotApplied,
    OutputKeyMissing,
    LockContention,
    RemoteExecutionFailed,
    HealthCheckExhausted,
    EnvironmentUnavailable,
    DependentStillApplied,
    InvalidTransition,
    Configuration,
    Provider,
    Store,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::DependencyNotSatisfied => "dependency_not_satisfied",
            FailureKind::UpstreamNotApplied => "upstream_not_applied",
            FailureKind::OutputKeyMissing => "output_key_missing",
            FailureKind::LockContention => "lock_contention",
            FailureKind::RemoteExecutionFailed => "remote_execution_failed",
            FailureKind::HealthCheckExhausted => "health_check_exhausted",
            FailureKind::EnvironmentUnavailable => "environment_unavailable",
            FailureKind::DependentStillApplied => "dependent_still_applied",
            FailureKind::InvalidTransition => "invalid_transition",
            FailureKind::Configuration => "configuration",
            FailureKind::Provider => "provider",
            FailureKind::Store => "store",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CoreError::DependencyNotSatisfied { .. } => FailureKind::DependencyNotSatisfied,
            CoreError::UpstreamNotApplied { .. } => FailureKind::UpstreamNotApplied,
            CoreError::OutputKeyMissing { .. } => FailureKind::OutputKeyMissing,
            CoreError::LockContention { .. } => FailureKind::LockContention,
            CoreError::RemoteExecutionFailed { .. } => FailureKind::RemoteExecutionFailed,
            CoreError::HealthCheckExhausted { .. } => FailureKind::HealthCheckExhausted,
            CoreError::EnvironmentUnavailable { .. } => FailureKind::EnvironmentUnavailable,
            CoreError::DependentStillApplied { .. } => FailureKind::DependentStillApplied,
            CoreError::InvalidTransition { .. } => FailureKind::InvalidTransition,
            CoreError::Pipeline(_) | CoreError::MissingSecret { .. } | CoreError::Payload { .. } => {
                FailureKind::Configuration
            }
            CoreError::Runtime(_) => FailureKind::Provider,
            CoreError::Store(_) | CoreError::Io(_) | CoreError::Serialization(_) => {
                FailureKind::Store
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_lock_contention_becomes_first_class() {
        let e: CoreError = StoreError::LockContention {
            layer: "03-database".to_owned(),
            environment: "dev".to_owned(),
            holder: Some("token r1 pid 7".to_owned()),
        }
        .into();
        assert_eq!(e.kind(), FailureKind::LockContention);
        let msg = e.to_string();
        assert!(msg.contains("03-database"));
        assert!(msg.contains("dev"));
        assert!(msg.ends_with("(token r1 pid 7)"));
    }

    #[test]
    fn other_store_errors_stay_wrapped() {
        let e: CoreError = StoreError::EnvNotFound("qa".to_owned()).into();
        assert!(matches!(e, CoreError::Store(_)));
        assert_eq!(e.kind(), FailureKind::Store);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::DependencyNotSatisfied).unwrap();
        assert_eq!(json, "\"dependency_not_satisfied\"");
        assert_eq!(FailureKind::LockContention.to_string(), "lock_contention");
    }
}
