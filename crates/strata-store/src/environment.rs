use crate::layout::StoreLayout;
use crate::{write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use strata_schema::EnvName;
use tracing::{debug, info, warn};

/// A deployment target (dev, staging, production) with its own state partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    pub name: EnvName,
    /// Stable key derived from the name; tags provider resources per environment.
    pub isolation_key: String,
    pub created_at: String,
}

pub fn isolation_key(name: &str) -> String {
    let digest = blake3::hash(format!("strata-env:{name}").as_bytes());
    digest.to_hex()[..16].to_owned()
}

pub fn validate_env_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 64 {
        return Err(StoreError::InvalidName(
            "environment name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(StoreError::InvalidName(
            "environment name must match [a-zA-Z0-9_-]".to_owned(),
        ));
    }
    Ok(())
}

pub struct EnvironmentStore {
    layout: StoreLayout,
}

impl EnvironmentStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Return the environment, creating its partition on first use.
    ///
    /// The boolean is `true` when the partition was created by this call.
    pub fn ensure(&self, name: &str) -> Result<(Environment, bool), StoreError> {
        validate_env_name(name)?;
        if self.exists(name) {
            return Ok((self.get(name)?, false));
        }

        fs::create_dir_all(self.layout.layers_dir(name))?;
        fs::create_dir_all(self.layout.locks_dir(name))?;
        fs::create_dir_all(self.layout.runs_dir(name))?;

        let env = Environment {
            name: EnvName::new(name),
            isolation_key: isolation_key(name),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&env)?;
        write_atomic(&self.layout.environment_file(name), content.as_bytes())?;
        info!("created environment partition '{name}'");
        Ok((env, true))
    }

    pub fn get(&self, name: &str) -> Result<Environment, StoreError> {
        validate_env_name(name)?;
        let path = self.layout.environment_file(name);
        if !path.exists() {
            return Err(StoreError::EnvNotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let env: Environment = serde_json::from_str(&content)?;
        if env.name != name || env.isolation_key != isolation_key(name) {
            return Err(StoreError::IntegrityFailure {
                record: format!("environment {name}"),
                expected: isolation_key(name),
                actual: env.isolation_key,
            });
        }
        Ok(env)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_env_name(name).is_ok() && self.layout.environment_file(name).is_file()
    }

    pub fn list(&self) -> Result<Vec<Environment>, StoreError> {
        let dir = self.layout.envs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else {
                continue;
            };
            match self.get(name_str) {
                Ok(env) => results.push(env),
                Err(e) => warn!("skipping unreadable environment '{name_str}': {e}"),
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    /// Number of layer state records currently held by the partition.
    pub fn record_count(&self, name: &str) -> Result<usize, StoreError> {
        let dir = self.layout.layers_dir(name);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete an environment partition. Refused while any layer record remains.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.get(name)?;
        let records = self.record_count(name)?;
        if records > 0 {
            return Err(StoreError::PartitionNotEmpty {
                environment: name.to_owned(),
                records,
            });
        }
        fs::remove_dir_all(self.layout.env_dir(name))?;
        let runs = self.layout.runs_dir(name);
        if runs.exists() {
            fs::remove_dir_all(runs)?;
        }
        debug!("removed environment partition '{name}'");
        Ok(())
    }
}
