use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use strata_schema::{EnvName, Fingerprint, LayerName, ResourceHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LayerStatus {
    Succeeded,
    Failed,
    Destroyed,
}

impl std::fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerStatus::Succeeded => write!(f, "succeeded"),
            LayerStatus::Failed => write!(f, "failed"),
            LayerStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A provider resource owned by a layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub kind: String,
    pub handle: ResourceHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Materialized state of one layer in one environment.
///
/// Once `last_status` is `Succeeded`, `outputs` holds every output key the
/// layer declares. A set `lock_token` marks a run that is mutating the layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerState {
    pub layer: LayerName,
    pub environment: EnvName,
    /// Incremented on every write.
    pub serial: u64,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub resource_handles: Vec<ResourceRecord>,
    pub last_applied_fingerprint: Option<Fingerprint>,
    pub last_status: LayerStatus,
    #[serde(default)]
    pub lock_token: Option<String>,
    pub updated_at: String,
    /// blake3 checksum over the record with this field omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl LayerState {
    pub fn new(layer: LayerName, environment: EnvName, status: LayerStatus) -> Self {
        Self {
            layer,
            environment,
            serial: 0,
            outputs: BTreeMap::new(),
            resource_handles: Vec::new(),
            last_applied_fingerprint: None,
            last_status: status,
            lock_token: None,
            updated_at: String::new(),
            checksum: None,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.last_status == LayerStatus::Succeeded
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// State records of a single environment partition.
///
/// A `StateStore` is bound to one environment at construction and has no way
/// to address another partition.
pub struct StateStore {
    layout: StoreLayout,
    environment: EnvName,
}

impl StateStore {
    pub fn new(layout: StoreLayout, environment: EnvName) -> Self {
        Self {
            layout,
            environment,
        }
    }

    pub fn environment(&self) -> &EnvName {
        &self.environment
    }

    pub fn exists(&self, layer: &str) -> bool {
        self.layout.layer_file(&self.environment, layer).exists()
    }

    /// Read and verify a layer record. `None` when the layer has never been applied
    /// or was destroyed.
    pub fn get(&self, layer: &str) -> Result<Option<LayerState>, StoreError> {
        let path = self.layout.layer_file(&self.environment, layer);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state: LayerState = serde_json::from_str(&content)?;

        let record = format!("{}/{layer}", self.environment);
        if let Some(ref expected) = state.checksum {
            let actual = state.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    record,
                    expected: expected.clone(),
                    actual,
                });
            }
        } else {
            return Err(StoreError::IntegrityFailure {
                record,
                expected: "checksum".to_owned(),
                actual: "none".to_owned(),
            });
        }
        if state.layer != layer || state.environment != self.environment {
            return Err(StoreError::IntegrityFailure {
                record,
                expected: format!("{}/{layer}", self.environment),
                actual: format!("{}/{}", state.environment, state.layer),
            });
        }

        Ok(Some(state))
    }

    /// Replace the layer's record with `state`, stamping serial, time and checksum.
    ///
    /// The old record is fully replaced, never merged.
    pub fn put(&self, state: &LayerState) -> Result<LayerState, StoreError> {
        if state.environment != self.environment {
            return Err(StoreError::IntegrityFailure {
                record: format!("{}/{}", self.environment, state.layer),
                expected: self.environment.to_string(),
                actual: state.environment.to_string(),
            });
        }
        let previous_serial = match self.get(&state.layer) {
            Ok(Some(prev)) => prev.serial,
            Ok(None) => 0,
            Err(e) => {
                warn!("overwriting unreadable record for '{}': {e}", state.layer);
                state.serial
            }
        };

        let mut stamped = state.clone();
        stamped.serial = previous_serial.max(state.serial) + 1;
        stamped.updated_at = chrono::Utc::now().to_rfc3339();
        stamped.checksum = None;
        stamped.checksum = Some(stamped.compute_checksum()?);

        let content = serde_json::to_string_pretty(&stamped)?;
        write_atomic(
            &self.layout.layer_file(&self.environment, &state.layer),
            content.as_bytes(),
        )?;
        debug!(
            "wrote state {}/{} serial={} status={}",
            self.environment, stamped.layer, stamped.serial, stamped.last_status
        );
        Ok(stamped)
    }

    pub fn remove(&self, layer: &str) -> Result<(), StoreError> {
        let path = self.layout.layer_file(&self.environment, layer);
        if path.exists() {
            fs::remove_file(&path)?;
            crate::fsync_dir(&self.layout.layers_dir(&self.environment))?;
            debug!("removed state {}/{layer}", self.environment);
        }
        Ok(())
    }

    /// All readable records, sorted by layer name. Corrupted records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<LayerState>, StoreError> {
        let dir = self.layout.layers_dir(&self.environment);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(layer) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(layer) {
                Ok(Some(state)) => results.push(state),
                Ok(None) => {}
                Err(e) => warn!("skipping corrupted state record '{layer}': {e}"),
            }
        }
        results.sort_by(|a, b| a.layer.cmp(&b.layer));
        Ok(results)
    }
}
