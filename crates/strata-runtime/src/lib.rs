//! Capability backends and idempotent provisioning steps for Strata layers.
//!
//! This crate implements the execution layer: the `ResourceProvider` trait with
//! `local` (on-disk ledger) and `mock` backends, the `RemoteExecutor` trait with
//! `ssh` and `mock` backends, and the converging provisioning steps driven over a
//! remote session: marker-delimited managed blocks, firewall rules keyed by
//! `(source, port, protocol)`, and bounded service restart/verify.

pub mod firewall;
pub mod local;
pub mod managed;
pub mod mock;
pub mod provider;
pub mod redact;
pub mod remote;
pub mod retry;
pub mod service;
pub mod ssh;
pub mod steps;

pub use firewall::FirewallRule;
pub use managed::ManagedBlock;
pub use provider::{select_provider, Attributes, ResourceProvider, ResourceSpec};
pub use redact::Redactor;
pub use remote::{select_executor, CommandOutput, Credentials, RemoteExecutor, RemoteSession};
pub use retry::RetryPolicy;
pub use service::ServiceCheck;
pub use steps::{BlockEdit, ProvisionPlan, ProvisionReport, ScriptStep, Upload};

use thiserror::Error;

/// Exit status reported for a command killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot reach {address}: {message}")]
    Connect { address: String, message: String },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("`{command}` timed out after {secs}s (exit 124)")]
    Timeout { command: String, secs: u64 },
    #[error("service '{service}' not healthy after {attempts} attempt(s)\n{diagnostics}")]
    HealthCheckExhausted {
        service: String,
        attempts: u32,
        diagnostics: String,
    },
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("managed block '{marker}' in {path} is not properly delimited")]
    CorruptManagedBlock { path: String, marker: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Network-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Connect { .. } | RuntimeError::Transient(_)
        )
    }
}
