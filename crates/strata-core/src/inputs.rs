//! Everything a layer's apply consumes, rendered and fingerprinted.
//!
//! Upstream values, rendered resource properties, script bodies, templated
//! payloads, managed-block contents, firewall rules and the service check all
//! become labelled fingerprint artifacts, so a change to any of them (including
//! a transitive upstream output change) re-triggers provisioning. Secrets enter
//! the fingerprint only as a blake3 digest of their value.

use crate::CoreError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use strata_runtime::{BlockEdit, FirewallRule, ManagedBlock, Redactor, ScriptStep, ServiceCheck, Upload};
use strata_schema::{
    compute_fingerprint, render_str, render_value, Artifact, Fingerprint, HostRef, Layer,
    Pipeline, TemplateContext,
};

/// Source of secret values, looked up by variable name.
pub trait SecretSource: Send + Sync {
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretSource for BTreeMap<String, String> {
    fn secret(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// A resource declaration with templates rendered against the layer's inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedResource {
    pub name: String,
    pub kind: String,
    pub stable_address: bool,
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct LayerInputs {
    pub upstream: BTreeMap<String, Value>,
    pub secrets: BTreeMap<String, String>,
    pub resources: Vec<RenderedResource>,
    pub uploads: Vec<Upload>,
    pub scripts: Vec<ScriptStep>,
    pub blocks: Vec<BlockEdit>,
    pub firewall: Vec<FirewallRule>,
    pub service: Option<ServiceCheck>,
    pub artifacts: Vec<Artifact>,
}

impl LayerInputs {
    pub fn fingerprint(&self) -> Fingerprint {
        compute_fingerprint(&self.artifacts)
    }

    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.secrets.values().cloned())
    }
}

#[derive(Serialize)]
struct ServiceArtifact<'a> {
    attempts: u32,
    backoff_secs: u64,
    timeout_secs: u64,
    health_command: &'a Option<Vec<String>>,
}

/// Render and fingerprint `layer`'s inputs for `environment`.
///
/// `upstream` holds resolved input values keyed by input key; pass an empty map
/// for a layer without inputs.
#[allow(clippy::too_many_lines)]
pub fn gather(
    environment: &str,
    layer: &Layer,
    upstream: BTreeMap<String, Value>,
    secrets: &dyn SecretSource,
) -> Result<LayerInputs, CoreError> {
    let mut resolved_secrets = BTreeMap::new();
    if let Some(provision) = &layer.provision {
        for name in &provision.secrets {
            let value = secrets.secret(name).ok_or_else(|| CoreError::MissingSecret {
                layer: layer.name.to_string(),
                name: name.clone(),
            })?;
            resolved_secrets.insert(name.clone(), value);
        }
    }

    let ctx = TemplateContext {
        environment: environment.to_owned(),
        layer: layer.name.to_string(),
        inputs: upstream.clone(),
        secrets: resolved_secrets.clone(),
    };
    let mut artifacts = Vec::new();
    for (key, value) in &upstream {
        artifacts.push(Artifact::new(format!("input:{key}"), serde_json::to_vec(value)?));
    }

    let mut resources = Vec::with_capacity(layer.resources.len());
    for decl in &layer.resources {
        let mut properties = BTreeMap::new();
        for (key, value) in &decl.properties {
            let what = format!("{}.{}.{key}", layer.name, decl.name);
            properties.insert(key.clone(), render_value(value, &ctx, &what)?);
        }
        let rendered = RenderedResource {
            name: decl.name.clone(),
            kind: decl.kind.clone(),
            stable_address: decl.stable_address,
            properties,
        };
        artifacts.push(Artifact::new(
            format!("resource:{}", rendered.name),
            serde_json::to_vec(&rendered)?,
        ));
        resources.push(rendered);
    }

    for (name, value) in &resolved_secrets {
        artifacts.push(Artifact::new(
            format!("secret:{name}"),
            blake3::hash(value.as_bytes()).as_bytes().to_vec(),
        ));
    }

    let mut inputs = LayerInputs {
        upstream,
        secrets: resolved_secrets,
        resources,
        uploads: Vec::new(),
        scripts: Vec::new(),
        blocks: Vec::new(),
        firewall: Vec::new(),
        service: None,
        artifacts,
    };

    let Some(provision) = &layer.provision else {
        return Ok(inputs);
    };

    let host = match &provision.host {
        HostRef::Resource(name) => format!("resource:{name}"),
        HostRef::Input(key) => format!("input:{key}"),
    };
    inputs.artifacts.push(Artifact::new("host", host.into_bytes()));

    for (index, path) in provision.scripts.iter().enumerate() {
        let body = read_payload(layer, path)?;
        let file_name = path
            .file_name()
            .map_or_else(|| format!("script-{index}"), |n| n.to_string_lossy().into_owned());
        let step = ScriptStep {
            name: format!("{}-{:02}-{file_name}", layer.name, index + 1),
            body,
        };
        inputs
            .artifacts
            .push(Artifact::new(format!("script:{}", step.name), step.body.clone()));
        inputs.scripts.push(step);
    }

    for file in &provision.files {
        let raw = read_payload(layer, &file.source)?;
        let bytes = if file.template {
            let source = String::from_utf8(raw).map_err(|_| CoreError::Payload {
                layer: layer.name.to_string(),
                path: file.source.display().to_string(),
                message: "template is not valid UTF-8".to_owned(),
            })?;
            render_str(&source, &ctx, &file.source.display().to_string())?.into_bytes()
        } else {
            raw
        };
        inputs.artifacts.push(Artifact::new(
            format!("file:{}", file.remote_path),
            bytes.clone(),
        ));
        inputs.uploads.push(Upload {
            remote_path: file.remote_path.clone(),
            bytes,
        });
    }

    for decl in &provision.managed_blocks {
        let what = format!("{} block {}", decl.path, decl.marker);
        let body = render_str(&decl.content, &ctx, &what)?;
        inputs.artifacts.push(Artifact::new(
            format!("block:{}#{}", decl.path, decl.marker),
            body.as_bytes(),
        ));
        inputs.blocks.push(BlockEdit {
            path: decl.path.clone(),
            block: ManagedBlock::new(decl.marker.clone(), body),
        });
    }

    for decl in &provision.firewall {
        let rule = FirewallRule {
            source: decl.source.clone(),
            port: decl.port,
            protocol: decl.protocol,
        };
        inputs.artifacts.push(Artifact::new(
            format!(
                "firewall:{} {}/{}",
                rule.source,
                rule.port,
                rule.protocol.as_str()
            ),
            Vec::new(),
        ));
        inputs.firewall.push(rule);
    }

    if let Some(decl) = &provision.service {
        inputs.artifacts.push(Artifact::new(
            format!("service:{}", decl.name),
            serde_json::to_vec(&ServiceArtifact {
                attempts: decl.attempts,
                backoff_secs: decl.backoff_secs,
                timeout_secs: decl.timeout_secs,
                health_command: &decl.health_command,
            })?,
        ));
        inputs.service = Some(ServiceCheck {
            name: decl.name.clone(),
            attempts: decl.attempts,
            backoff: Duration::from_secs(decl.backoff_secs),
            timeout: Duration::from_secs(decl.timeout_secs),
            health_command: decl.health_command.clone(),
        });
    }

    Ok(inputs)
}

fn read_payload(layer: &Layer, path: &std::path::Path) -> Result<Vec<u8>, CoreError> {
    std::fs::read(path).map_err(|e| CoreError::Payload {
        layer: layer.name.to_string(),
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Redactor over every secret the pipeline declares that `secrets` can supply.
/// Used when showing stored outputs outside a run.
pub fn pipeline_redactor(pipeline: &Pipeline, secrets: &dyn SecretSource) -> Redactor {
    let values = pipeline
        .layers
        .iter()
        .filter_map(|l| l.provision.as_ref())
        .flat_map(|p| p.secrets.iter())
        .filter_map(|name| secrets.secret(name));
    Redactor::new(values.collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_schema::parse_pipeline_str;

    fn pipeline(dir: &Path) -> Pipeline {
        std::fs::create_dir_all(dir.join("scripts")).unwrap();
        std::fs::create_dir_all(dir.join("files")).unwrap();
        std::fs::write(dir.join("scripts/db.sh"), "apt-get install -y postgresql\n").unwrap();
        std::fs::write(
            dir.join("files/app.env.tera"),
            "DB_HOST={{ inputs.db_host }}\nDB_PASSWORD={{ secrets.DB_PASSWORD }}\nENV={{ environment }}\n",
        )
        .unwrap();
        let toml = r#"
pipeline_version = 1

[[layer]]
name = "02-compute"
ordinal = 2
outputs = { db_host = "db.address" }

  [[layer.resource]]
  name = "db"
  kind = "instance"
  stable_address = true

[[layer]]
name = "04-application"
ordinal = 4
inputs = [{ from = "02-compute", key = "db_host" }]

  [[layer.resource]]
  name = "app"
  kind = "instance"
  stable_address = true
  properties = { tags = ["{{ environment }}", "app"], db = "{{ inputs.db_host }}" }

  [layer.provision]
  host = "app"
  scripts = ["scripts/db.sh"]
  secrets = ["DB_PASSWORD"]

    [[layer.provision.file]]
    source = "files/app.env.tera"
    remote_path = "/etc/app/app.env"
    template = true

    [[layer.provision.managed_block]]
    path = "/etc/hosts"
    marker = "strata-hosts"
    content = "{{ inputs.db_host }} db"

    [[layer.provision.firewall]]
    source = "0.0.0.0/0"
    port = 443

    [layer.provision.service]
    name = "app"
    attempts = 2
"#;
        parse_pipeline_str(toml).unwrap().normalize(dir).unwrap()
    }

    fn secrets(password: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("DB_PASSWORD".to_owned(), password.to_owned())])
    }

    fn upstream(host: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([("db_host".to_owned(), Value::from(host))])
    }

    #[test]
    fn renders_every_payload() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let layer = p.layer("04-application").unwrap();
        let inputs = gather("dev", layer, upstream("10.64.0.10"), &secrets("s3cret")).unwrap();

        assert_eq!(inputs.resources[0].properties["db"], "10.64.0.10");
        assert_eq!(inputs.resources[0].properties["tags"][0], "dev");
        assert_eq!(
            String::from_utf8(inputs.uploads[0].bytes.clone()).unwrap(),
            "DB_HOST=10.64.0.10\nDB_PASSWORD=s3cret\nENV=dev\n"
        );
        assert_eq!(inputs.scripts[0].name, "04-application-01-db.sh");
        assert_eq!(inputs.blocks[0].block.body, "10.64.0.10 db");
        assert_eq!(inputs.firewall[0].port, 443);
        assert_eq!(inputs.service.as_ref().unwrap().attempts, 2);
        assert_eq!(inputs.redactor().redact("pw s3cret"), "pw [REDACTED]");
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let layer = p.layer("04-application").unwrap();
        let a = gather("dev", layer, upstream("10.64.0.10"), &secrets("s3cret")).unwrap();
        let b = gather("dev", layer, upstream("10.64.0.10"), &secrets("s3cret")).unwrap();
        let c = gather("dev", layer, upstream("10.64.0.11"), &secrets("s3cret")).unwrap();
        let d = gather("dev", layer, upstream("10.64.0.10"), &secrets("rotated")).unwrap();
        let e = gather("staging", layer, upstream("10.64.0.10"), &secrets("s3cret")).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
        assert_ne!(a.fingerprint(), e.fingerprint());
    }

    #[test]
    fn secret_rotation_changes_fingerprint_without_exposing_value() {
        let dir = tempfile::tempdir().unwrap();
        // No template consumes the secret, so only its digest can move the fingerprint.
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/db.sh"), "psql -c 'select 1'\n").unwrap();
        let toml = r#"
pipeline_version = 1

[[layer]]
name = "03-database"
ordinal = 3

  [[layer.resource]]
  name = "db"
  kind = "instance"

  [layer.provision]
  host = "db"
  scripts = ["scripts/db.sh"]
  secrets = ["DB_PASSWORD"]
"#;
        let p = parse_pipeline_str(toml).unwrap().normalize(dir.path()).unwrap();
        let layer = p.layer("03-database").unwrap();
        let before = gather("dev", layer, BTreeMap::new(), &secrets("s3cret")).unwrap();
        let after = gather("dev", layer, BTreeMap::new(), &secrets("rotated")).unwrap();

        assert_ne!(before.fingerprint(), after.fingerprint());
        assert_eq!(before.secrets["DB_PASSWORD"], "s3cret");
        let digest = before
            .artifacts
            .iter()
            .find(|a| a.label == "secret:DB_PASSWORD")
            .unwrap();
        assert_eq!(digest.bytes, blake3::hash(b"s3cret").as_bytes().to_vec());
    }

    #[test]
    fn script_edit_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let layer = p.layer("04-application").unwrap();
        let before = gather("dev", layer, upstream("h"), &secrets("x")).unwrap();
        std::fs::write(dir.path().join("scripts/db.sh"), "apt-get install -y postgresql-16\n")
            .unwrap();
        let after = gather("dev", layer, upstream("h"), &secrets("x")).unwrap();
        assert_ne!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn missing_secret_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let layer = p.layer("04-application").unwrap();
        let err = gather("dev", layer, upstream("h"), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CoreError::MissingSecret { name, .. } if name == "DB_PASSWORD"));
    }

    #[test]
    fn missing_script_is_payload_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        std::fs::remove_file(dir.path().join("scripts/db.sh")).unwrap();
        let layer = p.layer("04-application").unwrap();
        assert!(matches!(
            gather("dev", layer, upstream("h"), &secrets("x")),
            Err(CoreError::Payload { .. })
        ));
    }

    #[test]
    fn layer_without_provision_has_only_resources() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let layer = p.layer("02-compute").unwrap();
        let inputs = gather("dev", layer, BTreeMap::new(), &ProcessEnv).unwrap();
        assert_eq!(inputs.resources.len(), 1);
        assert!(inputs.scripts.is_empty());
        assert_eq!(inputs.artifacts.len(), 1);
    }
}
