use crate::provider::{Attributes, ResourceProvider, ResourceSpec};
use crate::RuntimeError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_schema::ResourceHandle;
use strata_store::StoreLayout;
use tempfile::NamedTempFile;
use tracing::debug;

const LEDGER_FILE: &str = "resources.json";
const LEDGER_LOCK: &str = "resources.lock";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    next_address: u32,
    #[serde(default)]
    free_addresses: Vec<String>,
    resources: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    spec: ResourceSpec,
    generation: u64,
}

/// Provider that records resources in a JSON ledger under the store root.
///
/// Stands in for a cloud API on a single machine: handles and addresses are
/// stable across invocations, and every mutation is persisted atomically.
pub struct LocalProvider {
    dir: PathBuf,
}

impl LocalProvider {
    pub fn new(store_root: &Path) -> Self {
        Self {
            dir: StoreLayout::new(store_root).provider_dir("local"),
        }
    }

    fn with_ledger<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> Result<(T, bool), RuntimeError>,
    ) -> Result<T, RuntimeError> {
        fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LEDGER_LOCK))?;
        lock.lock_exclusive()?;

        let path = self.dir.join(LEDGER_FILE);
        let mut ledger: Ledger = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Ledger::default()
        };

        let (out, dirty) = f(&mut ledger)?;
        if dirty {
            let content = serde_json::to_string_pretty(&ledger)?;
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| RuntimeError::Io(e.error))?;
        }
        let _ = lock.unlock();
        Ok(out)
    }
}

fn format_address(index: u32) -> String {
    let host = index + 10;
    format!(
        "10.{}.{}.{}",
        64 + ((host >> 16) & 0x3f),
        (host >> 8) & 0xff,
        host & 0xff
    )
}

impl ResourceProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn create_or_update_resource(
        &self,
        spec: &ResourceSpec,
    ) -> Result<ResourceHandle, RuntimeError> {
        let handle = spec.handle();
        self.with_ledger(|ledger| {
            let dirty = match ledger.resources.get_mut(handle.as_str()) {
                Some(entry) if entry.spec == *spec => false,
                Some(entry) => {
                    entry.spec = spec.clone();
                    entry.generation += 1;
                    debug!("local provider: updated {handle} ({})", spec.name);
                    true
                }
                None => {
                    ledger.resources.insert(
                        handle.to_string(),
                        LedgerEntry {
                            spec: spec.clone(),
                            generation: 1,
                        },
                    );
                    debug!("local provider: created {handle} ({})", spec.name);
                    true
                }
            };
            Ok(((), dirty))
        })?;
        Ok(handle)
    }

    fn destroy_resource(&self, handle: &ResourceHandle) -> Result<(), RuntimeError> {
        self.with_ledger(|ledger| match ledger.resources.remove(handle.as_str()) {
            Some(_) => {
                debug!("local provider: destroyed {handle}");
                Ok(((), true))
            }
            None => Err(RuntimeError::ResourceNotFound(handle.to_string())),
        })
    }

    fn describe_resource(&self, handle: &ResourceHandle) -> Result<Attributes, RuntimeError> {
        self.with_ledger(|ledger| match ledger.resources.get(handle.as_str()) {
            Some(entry) => {
                let mut attrs = entry.spec.attributes(handle);
                attrs.insert("generation".to_owned(), entry.generation.into());
                Ok((attrs, false))
            }
            None => Err(RuntimeError::ResourceNotFound(handle.to_string())),
        })
    }

    fn allocate_stable_address(&self) -> Result<String, RuntimeError> {
        self.with_ledger(|ledger| {
            if let Some(address) = ledger.free_addresses.pop() {
                return Ok((address, true));
            }
            let address = format_address(ledger.next_address);
            ledger.next_address += 1;
            Ok((address, true))
        })
    }

    fn release_stable_address(&self, address: &str) -> Result<(), RuntimeError> {
        self.with_ledger(|ledger| {
            let in_use = ledger
                .resources
                .values()
                .any(|e| e.spec.address.as_deref() == Some(address));
            if in_use || ledger.free_addresses.iter().any(|a| a == address) {
                return Ok(((), false));
            }
            ledger.free_addresses.push(address.to_owned());
            Ok(((), true))
        })
    }
}
