use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strata_schema::ResourceHandle;

pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Desired state of one provider resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub environment: String,
    /// Per-environment key; resources of different environments never collide.
    pub isolation_key: String,
    pub layer: String,
    pub name: String,
    pub kind: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Address previously obtained from `allocate_stable_address`, if any.
    pub address: Option<String>,
}

impl ResourceSpec {
    /// Deterministic handle: the same `(environment, layer, name)` always maps to
    /// the same resource, which makes `create_or_update_resource` idempotent.
    pub fn handle(&self) -> ResourceHandle {
        let key = format!("{}/{}/{}", self.isolation_key, self.layer, self.name);
        ResourceHandle::new(format!(
            "res-{}",
            &blake3::hash(key.as_bytes()).to_hex()[..16]
        ))
    }

    /// Attributes reported by `describe_resource` for this spec.
    pub fn attributes(&self, handle: &ResourceHandle) -> Attributes {
        let mut attrs = self.properties.clone();
        attrs.insert("id".to_owned(), handle.as_str().into());
        attrs.insert("name".to_owned(), self.name.clone().into());
        attrs.insert("kind".to_owned(), self.kind.clone().into());
        attrs.insert("environment".to_owned(), self.environment.clone().into());
        if let Some(address) = &self.address {
            attrs.insert("address".to_owned(), address.clone().into());
        }
        attrs
    }
}

/// Declarative reconciliation API of the infrastructure provider.
pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Create the resource if absent, otherwise update it in place.
    fn create_or_update_resource(&self, spec: &ResourceSpec)
        -> Result<ResourceHandle, RuntimeError>;

    /// Fails with [`RuntimeError::ResourceNotFound`] if the handle is unknown.
    fn destroy_resource(&self, handle: &ResourceHandle) -> Result<(), RuntimeError>;

    fn describe_resource(&self, handle: &ResourceHandle) -> Result<Attributes, RuntimeError>;

    fn allocate_stable_address(&self) -> Result<String, RuntimeError>;

    /// Return an address obtained from `allocate_stable_address` to the pool.
    fn release_stable_address(&self, _address: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

pub fn select_provider(
    name: &str,
    store_root: &Path,
) -> Result<Box<dyn ResourceProvider>, RuntimeError> {
    match name {
        "local" => Ok(Box::new(crate::local::LocalProvider::new(store_root))),
        "mock" => Ok(Box::new(crate::mock::MockProvider::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
