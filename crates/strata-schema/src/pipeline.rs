use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read pipeline file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse pipeline: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported pipeline_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("invalid {what} '{name}'")]
    InvalidName { what: &'static str, name: String },
    #[error("layer '{0}' is declared more than once")]
    DuplicateLayer(String),
    #[error("ordinal {ordinal} is used by both '{first}' and '{second}'")]
    DuplicateOrdinal {
        ordinal: u32,
        first: String,
        second: String,
    },
    #[error("layer '{layer}' (ordinal {ordinal}) references '{from}' (ordinal {from_ordinal}); inputs must come from a strictly smaller ordinal")]
    ForwardReference {
        layer: String,
        ordinal: u32,
        from: String,
        from_ordinal: u32,
    },
    #[error("layer '{0}' does not exist")]
    UnknownLayer(String),
    #[error("layer '{layer}' reads '{key}' from '{from}', which does not declare that output")]
    UndeclaredOutput {
        layer: String,
        from: String,
        key: String,
    },
    #[error("layer '{layer}' declares input key '{key}' more than once")]
    DuplicateInputKey { layer: String, key: String },
    #[error("layer '{layer}': output '{key}' = '{expr}' is not of the form <resource>.<attribute>")]
    InvalidOutputExpr {
        layer: String,
        key: String,
        expr: String,
    },
    #[error("layer '{layer}' refers to resource '{resource}', which it does not declare")]
    UnknownResource { layer: String, resource: String },
    #[error("layer '{layer}': provision host '{host}' is neither a stable-address resource nor an input key")]
    InvalidHost { layer: String, host: String },
    #[error("layer '{layer}': firewall protocol '{protocol}' is not tcp or udp")]
    InvalidProtocol { layer: String, protocol: String },
    #[error("layer '{layer}': service '{service}' needs at least one health check attempt")]
    InvalidAttempts { layer: String, service: String },
    #[error("layer '{layer}': {reason}")]
    InvalidLayer { layer: String, reason: String },
    #[error("template error in {context}: {message}")]
    Template { context: String, message: String },
}

/// On-disk pipeline definition, as written in `strata.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    pub pipeline_version: u32,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default, rename = "layer")]
    pub layers: Vec<LayerSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProviderSection {
    #[serde(default = "default_provider_backend")]
    pub backend: String,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            backend: default_provider_backend(),
        }
    }
}

/// Connection and retry settings for the remote execution backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    #[serde(default = "default_remote_backend")]
    pub backend: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// Name of the environment variable holding the path to the SSH identity file.
    #[serde(default)]
    pub identity_file_env: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            backend: default_remote_backend(),
            user: default_user(),
            identity_file_env: None,
            port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LayerSection {
    pub name: String,
    pub ordinal: u32,
    #[serde(default)]
    pub inputs: Vec<InputSection>,
    /// Output key to `<resource>.<attribute>` expression.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceSection>,
    #[serde(default)]
    pub provision: Option<ProvisionSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InputSection {
    pub from: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSection {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub stable_address: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProvisionSection {
    pub host: String,
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Environment variable names whose values are exposed to templates as `secrets.<NAME>`.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default, rename = "file")]
    pub files: Vec<FileSection>,
    #[serde(default, rename = "managed_block")]
    pub managed_blocks: Vec<ManagedBlockSection>,
    #[serde(default)]
    pub firewall: Vec<FirewallSection>,
    #[serde(default)]
    pub service: Option<ServiceSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileSection {
    pub source: String,
    pub remote_path: String,
    #[serde(default)]
    pub template: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManagedBlockSection {
    pub path: String,
    pub marker: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FirewallSection {
    pub source: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
    /// Overrides the default `systemctl is-active --quiet <name>` probe.
    #[serde(default)]
    pub health_command: Option<Vec<String>>,
}

fn default_provider_backend() -> String {
    "local".to_owned()
}

fn default_remote_backend() -> String {
    "ssh".to_owned()
}

fn default_user() -> String {
    "root".to_owned()
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    5
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

fn default_attempts() -> u32 {
    5
}

fn default_backoff() -> u64 {
    3
}

fn default_service_timeout() -> u64 {
    30
}

pub fn parse_pipeline_str(input: &str) -> Result<PipelineFile, PipelineError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_pipeline_file(path: impl AsRef<Path>) -> Result<PipelineFile, PipelineError> {
    let content = fs::read_to_string(path)?;
    parse_pipeline_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_pipeline() {
        let input = r#"
pipeline_version = 1

[provider]
backend = "mock"

[remote]
backend = "mock"
user = "deploy"
identity_file_env = "STRATA_SSH_KEY"

[[layer]]
name = "01-core"
ordinal = 1
outputs = { network_id = "vpc.id" }

  [[layer.resource]]
  name = "vpc"
  kind = "network"
  properties = { cidr = "10.0.0.0/16" }

[[layer]]
name = "02-compute"
ordinal = 2
inputs = [{ from = "01-core", key = "network_id" }]
outputs = { public_ip = "web.address" }

  [[layer.resource]]
  name = "web"
  kind = "instance"
  stable_address = true
  properties = { network = "{{ inputs.network_id }}", size = 2 }

  [layer.provision]
  host = "web"
  scripts = ["scripts/bootstrap.sh"]
  secrets = ["DB_PASSWORD"]

    [[layer.provision.managed_block]]
    path = "/etc/postgresql/pg_hba.conf"
    marker = "strata-acl"
    content = "host all app 10.0.0.0/16 scram-sha-256"

    [[layer.provision.firewall]]
    source = "10.0.0.0/16"
    port = 5432

    [layer.provision.service]
    name = "postgresql"
    attempts = 4
"#;
        let pipeline = parse_pipeline_str(input).expect("should parse");
        assert_eq!(pipeline.pipeline_version, 1);
        assert_eq!(pipeline.provider.backend, "mock");
        assert_eq!(pipeline.remote.user, "deploy");
        assert_eq!(pipeline.remote.port, 22);
        assert_eq!(pipeline.layers.len(), 2);

        let compute = &pipeline.layers[1];
        assert_eq!(compute.inputs[0].from, "01-core");
        assert_eq!(compute.resources[0].properties["size"], serde_json::json!(2));
        let provision = compute.provision.as_ref().unwrap();
        assert_eq!(provision.firewall[0].protocol, "tcp");
        let service = provision.service.as_ref().unwrap();
        assert_eq!(service.attempts, 4);
        assert_eq!(service.backoff_secs, 3);
        assert_eq!(service.timeout_secs, 30);
    }

    #[test]
    fn parses_minimal_pipeline() {
        let pipeline = parse_pipeline_str("pipeline_version = 1\n").expect("should parse");
        assert!(pipeline.layers.is_empty());
        assert_eq!(pipeline.provider.backend, "local");
        assert_eq!(pipeline.remote.backend, "ssh");
        assert_eq!(pipeline.remote.retry_attempts, 3);
        assert_eq!(pipeline.remote.retry_backoff_secs, 5);
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
pipeline_version = 1

[[layer]]
name = "01-core"
ordinal = 1
parallel = true
"#;
        assert!(parse_pipeline_str(input).is_err());
    }

    #[test]
    fn rejects_missing_version() {
        assert!(parse_pipeline_str("[provider]\nbackend = \"local\"\n").is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        fs::write(&path, "pipeline_version = 1\n").unwrap();
        assert!(parse_pipeline_file(&path).is_ok());
        assert!(parse_pipeline_file(dir.path().join("missing.toml")).is_err());
    }
}
