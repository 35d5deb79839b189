use crate::CoreError;
use std::path::{Path, PathBuf};
use strata_schema::{EnvName, LayerName};
use strata_store::{
    Environment, EnvironmentStore, LayerLock, LayerState, RunLog, StateStore, StoreError,
    StoreLayout,
};
use tracing::{debug, info, warn};

/// Maps environment names to isolated state partitions under one store root.
pub struct WorkspaceManager {
    layout: StoreLayout,
    environments: EnvironmentStore,
}

impl WorkspaceManager {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        let layout = StoreLayout::new(store_root);
        let environments = EnvironmentStore::new(layout.clone());
        Self {
            layout,
            environments,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Bind to `name`, creating its partition on first use.
    ///
    /// Lock tokens left on records by a crashed run are cleared here when the
    /// layer lock is no longer held.
    pub fn select(&self, name: &str) -> Result<WorkspaceHandle, CoreError> {
        let unavailable = |e: StoreError| match e {
            StoreError::InvalidName(_) => CoreError::Store(e),
            other => CoreError::EnvironmentUnavailable {
                environment: name.to_owned(),
                reason: other.to_string(),
            },
        };

        self.layout.initialize().map_err(unavailable)?;
        let (environment, created) = self.environments.ensure(name).map_err(unavailable)?;
        let handle = WorkspaceHandle {
            states: StateStore::new(self.layout.clone(), environment.name.clone()),
            layout: self.layout.clone(),
            environment,
            created,
        };
        handle.clear_stale_tokens()?;
        debug!(
            "workspace '{}' selected (isolation key {})",
            handle.name(),
            handle.environment.isolation_key
        );
        Ok(handle)
    }

    /// Open an existing partition without creating it.
    pub fn open(&self, name: &str) -> Result<WorkspaceHandle, CoreError> {
        if !self.layout.is_initialized() || !self.environments.exists(name) {
            return Err(CoreError::Store(StoreError::EnvNotFound(name.to_owned())));
        }
        self.select(name)
    }

    pub fn list(&self) -> Result<Vec<Environment>, CoreError> {
        if !self.layout.is_initialized() {
            return Ok(Vec::new());
        }
        Ok(self.environments.list()?)
    }

    pub fn record_count(&self, name: &str) -> Result<usize, CoreError> {
        Ok(self.environments.record_count(name)?)
    }

    /// Delete an empty partition. Refused while any layer record remains.
    pub fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.environments.remove(name)?;
        info!("deleted workspace '{name}'");
        Ok(())
    }
}

/// One environment's partition. Every state operation made through the handle
/// is confined to that environment.
pub struct WorkspaceHandle {
    layout: StoreLayout,
    environment: Environment,
    states: StateStore,
    created: bool,
}

impl WorkspaceHandle {
    pub fn name(&self) -> &EnvName {
        &self.environment.name
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn isolation_key(&self) -> &str {
        &self.environment.isolation_key
    }

    /// Whether the partition was created by the `select` that returned this handle.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn store_root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn get(&self, layer: &str) -> Result<Option<LayerState>, CoreError> {
        Ok(self.states.get(layer)?)
    }

    pub fn put(&self, state: &LayerState) -> Result<LayerState, CoreError> {
        Ok(self.states.put(state)?)
    }

    pub fn remove(&self, layer: &str) -> Result<(), CoreError> {
        Ok(self.states.remove(layer)?)
    }

    pub fn list(&self) -> Result<Vec<LayerState>, CoreError> {
        Ok(self.states.list()?)
    }

    pub fn new_state(&self, layer: &LayerName, status: strata_store::LayerStatus) -> LayerState {
        LayerState::new(layer.clone(), self.environment.name.clone(), status)
    }

    pub fn lock_exclusive(&self, layer: &str, token: &str) -> Result<LayerLock, CoreError> {
        Ok(LayerLock::try_exclusive(
            &self.layout.lock_file(self.name(), layer),
            layer,
            self.name(),
            token,
        )?)
    }

    pub fn lock_shared(&self, layer: &str) -> Result<LayerLock, CoreError> {
        Ok(LayerLock::try_shared(
            &self.layout.lock_file(self.name(), layer),
            layer,
            self.name(),
        )?)
    }

    pub fn open_run_log(&self, mode: &str) -> Result<RunLog, CoreError> {
        Ok(RunLog::create(&self.layout, self.name(), mode)?)
    }

    fn clear_stale_tokens(&self) -> Result<(), CoreError> {
        for mut state in self.states.list()? {
            let Some(token) = state.lock_token.clone() else {
                continue;
            };
            let lock_path = self.layout.lock_file(self.name(), &state.layer);
            if LayerLock::is_free(&lock_path)? {
                warn!(
                    "clearing stale lock token {token} on {}/{}",
                    self.name(),
                    state.layer
                );
                state.lock_token = None;
                self.states.put(&state)?;
            }
        }
        Ok(())
    }
}
