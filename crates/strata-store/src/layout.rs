use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a Strata state store.
///
/// Each environment owns a partition under `store/envs/<env>`; nothing below
/// one partition is shared with another.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn envs_dir(&self) -> PathBuf {
        self.store_dir().join("envs")
    }

    #[inline]
    pub fn env_dir(&self, env: &str) -> PathBuf {
        self.envs_dir().join(env)
    }

    #[inline]
    pub fn environment_file(&self, env: &str) -> PathBuf {
        self.env_dir(env).join("environment.json")
    }

    #[inline]
    pub fn layers_dir(&self, env: &str) -> PathBuf {
        self.env_dir(env).join("layers")
    }

    #[inline]
    pub fn layer_file(&self, env: &str, layer: &str) -> PathBuf {
        self.layers_dir(env).join(format!("{layer}.json"))
    }

    #[inline]
    pub fn locks_dir(&self, env: &str) -> PathBuf {
        self.env_dir(env).join("locks")
    }

    #[inline]
    pub fn lock_file(&self, env: &str, layer: &str) -> PathBuf {
        self.locks_dir(env).join(format!("{layer}.lock"))
    }

    #[inline]
    pub fn runs_dir(&self, env: &str) -> PathBuf {
        self.store_dir().join("runs").join(env)
    }

    /// Private working area of a resource provider backend.
    #[inline]
    pub fn provider_dir(&self, backend: &str) -> PathBuf {
        self.root.join("provider").join(backend)
    }

    fn version_file(&self) -> PathBuf {
        self.store_dir().join(VERSION_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.version_file().is_file()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.envs_dir())?;
        fs::create_dir_all(self.store_dir().join("runs"))?;

        if self.version_file().exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            write_atomic(&self.version_file(), content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.version_file())?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
