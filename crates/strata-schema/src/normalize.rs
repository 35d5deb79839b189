use crate::pipeline::{LayerSection, PipelineError, PipelineFile, ProvisionSection, RemoteSection};
use crate::types::LayerName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Validated pipeline with layers sorted by ordinal.
///
/// Every input reference points at a layer with a strictly smaller ordinal,
/// so the dependency graph is acyclic by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    pub provider_backend: String,
    pub remote: RemoteSection,
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub name: LayerName,
    pub ordinal: u32,
    pub inputs: Vec<InputRef>,
    pub outputs: Vec<OutputBinding>,
    pub resources: Vec<ResourceDecl>,
    pub provision: Option<Provision>,
}

/// A single value this layer reads from an upstream layer's outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct InputRef {
    pub from: LayerName,
    pub key: String,
}

/// Output key bound to an attribute of one of the layer's resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputBinding {
    pub key: String,
    pub resource: String,
    pub attribute: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    pub name: String,
    pub kind: String,
    pub stable_address: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HostRef {
    /// Address allocated to a resource of this layer.
    Resource(String),
    /// Address published by an upstream layer.
    Input(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provision {
    pub host: HostRef,
    /// Run in declared order.
    pub scripts: Vec<PathBuf>,
    pub secrets: Vec<String>,
    pub files: Vec<FilePayload>,
    pub managed_blocks: Vec<ManagedBlockDecl>,
    pub firewall: Vec<FirewallDecl>,
    pub service: Option<ServiceDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilePayload {
    pub source: PathBuf,
    pub remote_path: String,
    pub template: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedBlockDecl {
    pub path: String,
    pub marker: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallDecl {
    pub source: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDecl {
    pub name: String,
    pub attempts: u32,
    pub backoff_secs: u64,
    pub timeout_secs: u64,
    pub health_command: Option<Vec<String>>,
}

impl PipelineFile {
    /// Validate the pipeline and resolve relative paths against `base_dir`.
    pub fn normalize(&self, base_dir: &Path) -> Result<Pipeline, PipelineError> {
        if self.pipeline_version != 1 {
            return Err(PipelineError::UnsupportedVersion(self.pipeline_version));
        }

        let mut by_name: BTreeMap<&str, &LayerSection> = BTreeMap::new();
        let mut by_ordinal: BTreeMap<u32, &str> = BTreeMap::new();
        for section in &self.layers {
            validate_name("layer name", &section.name)?;
            if by_name.insert(&section.name, section).is_some() {
                return Err(PipelineError::DuplicateLayer(section.name.clone()));
            }
            if let Some(first) = by_ordinal.insert(section.ordinal, &section.name) {
                return Err(PipelineError::DuplicateOrdinal {
                    ordinal: section.ordinal,
                    first: first.to_owned(),
                    second: section.name.clone(),
                });
            }
        }

        let mut layers = self
            .layers
            .iter()
            .map(|section| normalize_layer(section, &by_name, base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        layers.sort_by_key(|l| l.ordinal);

        let mut remote = self.remote.clone();
        remote.backend = remote.backend.trim().to_lowercase();

        Ok(Pipeline {
            provider_backend: self.provider.backend.trim().to_lowercase(),
            remote,
            layers,
        })
    }
}

fn normalize_layer(
    section: &LayerSection,
    by_name: &BTreeMap<&str, &LayerSection>,
    base_dir: &Path,
) -> Result<Layer, PipelineError> {
    let layer = section.name.as_str();

    let mut resource_names = BTreeSet::new();
    let mut resources = Vec::with_capacity(section.resources.len());
    for res in &section.resources {
        validate_name("resource name", &res.name)?;
        if !resource_names.insert(res.name.as_str()) {
            return Err(invalid(
                layer,
                format!("resource '{}' is declared more than once", res.name),
            ));
        }
        if res.kind.trim().is_empty() {
            return Err(invalid(layer, format!("resource '{}' has an empty kind", res.name)));
        }
        resources.push(ResourceDecl {
            name: res.name.clone(),
            kind: res.kind.trim().to_owned(),
            stable_address: res.stable_address,
            properties: res.properties.clone(),
        });
    }
    resources.sort_by(|a, b| a.name.cmp(&b.name));

    let mut input_keys = BTreeSet::new();
    let mut inputs = Vec::with_capacity(section.inputs.len());
    for input in &section.inputs {
        let Some(upstream) = by_name.get(input.from.as_str()) else {
            return Err(PipelineError::UnknownLayer(input.from.clone()));
        };
        if upstream.ordinal >= section.ordinal {
            return Err(PipelineError::ForwardReference {
                layer: layer.to_owned(),
                ordinal: section.ordinal,
                from: input.from.clone(),
                from_ordinal: upstream.ordinal,
            });
        }
        if !upstream.outputs.contains_key(&input.key) {
            return Err(PipelineError::UndeclaredOutput {
                layer: layer.to_owned(),
                from: input.from.clone(),
                key: input.key.clone(),
            });
        }
        if !input_keys.insert(input.key.as_str()) {
            return Err(PipelineError::DuplicateInputKey {
                layer: layer.to_owned(),
                key: input.key.clone(),
            });
        }
        inputs.push(InputRef {
            from: LayerName::new(input.from.clone()),
            key: input.key.clone(),
        });
    }
    inputs.sort();

    let mut outputs = Vec::with_capacity(section.outputs.len());
    for (key, expr) in &section.outputs {
        validate_identifier("output key", key)?;
        let Some((resource, attribute)) = expr
            .split_once('.')
            .filter(|(r, a)| !r.is_empty() && !a.is_empty())
        else {
            return Err(PipelineError::InvalidOutputExpr {
                layer: layer.to_owned(),
                key: key.clone(),
                expr: expr.clone(),
            });
        };
        if !resource_names.contains(resource) {
            return Err(PipelineError::UnknownResource {
                layer: layer.to_owned(),
                resource: resource.to_owned(),
            });
        }
        outputs.push(OutputBinding {
            key: key.clone(),
            resource: resource.to_owned(),
            attribute: attribute.to_owned(),
        });
    }

    let provision = match &section.provision {
        Some(p) => Some(normalize_provision(
            layer,
            p,
            &resources,
            &input_keys,
            base_dir,
        )?),
        None => None,
    };

    Ok(Layer {
        name: LayerName::new(layer),
        ordinal: section.ordinal,
        inputs,
        outputs,
        resources,
        provision,
    })
}

fn normalize_provision(
    layer: &str,
    section: &ProvisionSection,
    resources: &[ResourceDecl],
    input_keys: &BTreeSet<&str>,
    base_dir: &Path,
) -> Result<Provision, PipelineError> {
    let host = if resources
        .iter()
        .any(|r| r.name == section.host && r.stable_address)
    {
        HostRef::Resource(section.host.clone())
    } else if input_keys.contains(section.host.as_str()) {
        HostRef::Input(section.host.clone())
    } else {
        return Err(PipelineError::InvalidHost {
            layer: layer.to_owned(),
            host: section.host.clone(),
        });
    };

    let mut secrets = Vec::with_capacity(section.secrets.len());
    for name in &section.secrets {
        validate_identifier("secret variable", name)?;
        secrets.push(name.clone());
    }
    secrets.sort();
    secrets.dedup();

    let scripts = section
        .scripts
        .iter()
        .map(|s| base_dir.join(s.trim()))
        .collect();

    let mut files = Vec::with_capacity(section.files.len());
    for file in &section.files {
        require_absolute(layer, &file.remote_path)?;
        files.push(FilePayload {
            source: base_dir.join(file.source.trim()),
            remote_path: file.remote_path.clone(),
            template: file.template,
        });
    }

    let mut managed_blocks = Vec::with_capacity(section.managed_blocks.len());
    let mut seen_blocks = BTreeSet::new();
    for block in &section.managed_blocks {
        require_absolute(layer, &block.path)?;
        if block.marker.is_empty()
            || !block
                .marker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(PipelineError::InvalidName {
                what: "managed block marker",
                name: block.marker.clone(),
            });
        }
        if !seen_blocks.insert((block.path.as_str(), block.marker.as_str())) {
            return Err(invalid(
                layer,
                format!(
                    "managed block '{}' in {} is declared more than once",
                    block.marker, block.path
                ),
            ));
        }
        managed_blocks.push(ManagedBlockDecl {
            path: block.path.clone(),
            marker: block.marker.clone(),
            content: block.content.clone(),
        });
    }

    let mut firewall = Vec::with_capacity(section.firewall.len());
    for rule in &section.firewall {
        let protocol = match rule.protocol.trim().to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => {
                return Err(PipelineError::InvalidProtocol {
                    layer: layer.to_owned(),
                    protocol: rule.protocol.clone(),
                })
            }
        };
        if rule.source.trim().is_empty() || rule.source.contains(char::is_whitespace) {
            return Err(invalid(
                layer,
                format!("firewall source '{}' is not a single address or range", rule.source),
            ));
        }
        firewall.push(FirewallDecl {
            source: rule.source.trim().to_owned(),
            port: rule.port,
            protocol,
        });
    }

    let service = match &section.service {
        Some(svc) => {
            if svc.attempts == 0 {
                return Err(PipelineError::InvalidAttempts {
                    layer: layer.to_owned(),
                    service: svc.name.clone(),
                });
            }
            if svc.name.trim().is_empty() {
                return Err(invalid(layer, "service name must not be empty".to_owned()));
            }
            if svc.health_command.as_ref().is_some_and(Vec::is_empty) {
                return Err(invalid(
                    layer,
                    format!("service '{}' has an empty health_command", svc.name),
                ));
            }
            Some(ServiceDecl {
                name: svc.name.trim().to_owned(),
                attempts: svc.attempts,
                backoff_secs: svc.backoff_secs,
                timeout_secs: svc.timeout_secs.max(1),
                health_command: svc.health_command.clone(),
            })
        }
        None => None,
    };

    Ok(Provision {
        host,
        scripts,
        secrets,
        files,
        managed_blocks,
        firewall,
        service,
    })
}

fn invalid(layer: &str, reason: String) -> PipelineError {
    PipelineError::InvalidLayer {
        layer: layer.to_owned(),
        reason,
    }
}

fn require_absolute(layer: &str, path: &str) -> Result<(), PipelineError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(invalid(layer, format!("remote path '{path}' must be absolute")))
    }
}

/// Layer, resource and environment names: non-empty `[A-Za-z0-9_-]`.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), PipelineError> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(PipelineError::InvalidName {
            what,
            name: name.to_owned(),
        })
    }
}

/// Keys that appear in template paths (`inputs.<key>`, `secrets.<NAME>`).
fn validate_identifier(what: &'static str, name: &str) -> Result<(), PipelineError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidName {
            what,
            name: name.to_owned(),
        })
    }
}

impl Pipeline {
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Layers whose inputs reference `name`, ascending by ordinal.
    pub fn dependents_of(&self, name: &str) -> Vec<&Layer> {
        self.layers
            .iter()
            .filter(|l| l.depends_on(name))
            .collect()
    }

    /// Layers that `layer` reads outputs from, ascending by ordinal.
    pub fn upstream_of(&self, layer: &Layer) -> Vec<&Layer> {
        self.layers
            .iter()
            .filter(|l| layer.depends_on(&l.name))
            .collect()
    }

    /// Resolve target names to layers in ordinal order. Empty targets select every layer.
    pub fn select(&self, targets: &[String]) -> Result<Vec<&Layer>, PipelineError> {
        if targets.is_empty() {
            return Ok(self.layers.iter().collect());
        }
        for target in targets {
            if self.layer(target).is_none() {
                return Err(PipelineError::UnknownLayer(target.clone()));
            }
        }
        Ok(self
            .layers
            .iter()
            .filter(|l| targets.iter().any(|t| l.name == t.as_str()))
            .collect())
    }
}

impl Layer {
    pub fn depends_on(&self, upstream: &str) -> bool {
        self.inputs.iter().any(|i| i.from == upstream)
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.key.as_str())
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }
}
