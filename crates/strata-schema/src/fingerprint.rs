use crate::types::Fingerprint;
use serde::Serialize;

/// One input that participates in a layer's provisioning fingerprint.
///
/// The label carries the artifact's role and origin (e.g. `script:/srv/infra/db.sh`
/// or `input:01-core.network_id`), so moving bytes between roles changes the digest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Artifact {
    pub label: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }
}

/// Deterministic digest over the ordered concatenation of `artifacts`.
///
/// Each field is length-prefixed so that no two distinct artifact lists can
/// produce the same byte stream.
pub fn compute_fingerprint(artifacts: &[Artifact]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"strata-fingerprint-v1");
    hasher.update(&(artifacts.len() as u64).to_le_bytes());
    for artifact in artifacts {
        hasher.update(&(artifact.label.len() as u64).to_le_bytes());
        hasher.update(artifact.label.as_bytes());
        hasher.update(&(artifact.bytes.len() as u64).to_le_bytes());
        hasher.update(&artifact.bytes);
    }
    Fingerprint::new(hasher.finalize().to_hex().to_string())
}
