//! Persistent state for Strata: one checksummed record per `(layer, environment)`.
//!
//! This crate provides the storage layer: `StoreLayout` for the on-disk directory
//! structure, `EnvironmentStore` for isolated per-environment partitions,
//! `StateStore` for versioned layer state records, `LayerLock` for fail-fast
//! per-layer exclusive locks, and `RunLog` for the append-only per-invocation log.

pub mod environment;
pub mod layout;
pub mod lock;
pub mod runlog;
pub mod state;

pub use environment::{isolation_key, validate_env_name, Environment, EnvironmentStore};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::{LayerLock, LockHolder};
pub use runlog::{list_runs, read_run, RunEvent, RunLog};
pub use state::{LayerState, LayerStatus, ResourceRecord, StateStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `bytes` to `dest` via a temp file in the same directory, then rename.
///
/// Readers observe either the old content or the new content, never a mix.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder.as_deref().map(|h| format!(" ({h})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{record}': expected {expected}, got {actual}")]
    IntegrityFailure {
        record: String,
        expected: String,
        actual: String,
    },
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("layer '{layer}' in environment '{environment}' is locked by another run{}", holder_suffix(.holder))]
    LockContention {
        layer: String,
        environment: String,
        holder: Option<String>,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid environment name: {0}")]
    InvalidName(String),
    #[error("environment '{environment}' still holds {records} layer record(s)")]
    PartitionNotEmpty { environment: String, records: usize },
}
