use super::{json_pretty, Context, EXIT_SUCCESS};
use std::io::Write;
use std::path::{Path, PathBuf};
use strata_core::WorkspaceManager;
use tempfile::NamedTempFile;

pub const STARTER_PIPELINE: &str = r#"pipeline_version = 1

[provider]
backend = "local"

[remote]
backend = "ssh"
user = "root"
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
  properties = { network = "{{ inputs.network_id }}", size = "small" }
"#;

fn write_atomic(dest: &Path, content: &str) -> Result<(), String> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| format!("write temp file: {e}"))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| format!("write temp file: {e}"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| format!("fsync temp file: {e}"))?;
    tmp.persist(dest)
        .map_err(|e| format!("persist pipeline: {}", e.error))?;
    Ok(())
}

pub fn run(ctx: &Context, environment: &str, force: bool) -> Result<u8, String> {
    let workspace = WorkspaceManager::new(&ctx.store)
        .select(environment)
        .map_err(|e| e.to_string())?;

    let wrote = if ctx.pipeline.exists() && !force {
        false
    } else {
        write_atomic(&ctx.pipeline, STARTER_PIPELINE)?;
        true
    };

    if ctx.json {
        let payload = serde_json::json!({
            "store": ctx.store,
            "pipeline": ctx.pipeline,
            "pipeline_written": wrote,
            "environment": environment,
            "environment_created": workspace.created(),
            "isolation_key": workspace.isolation_key(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("store:       {}", ctx.store.display());
        if wrote {
            println!("pipeline:    wrote {}", ctx.pipeline.display());
        } else {
            println!(
                "pipeline:    {} exists, left unchanged (pass --force to overwrite)",
                ctx.pipeline.display()
            );
        }
        let verb = if workspace.created() { "created" } else { "selected" };
        println!("environment: {verb} '{environment}'");
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_schema::parse_pipeline_str;

    #[test]
    fn starter_pipeline_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = parse_pipeline_str(STARTER_PIPELINE)
            .unwrap()
            .normalize(dir.path())
            .unwrap();
        assert_eq!(pipeline.layers.len(), 2);
        assert!(pipeline.layers[1].depends_on("01-core"));
    }

    #[test]
    fn write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("strata.toml");
        write_atomic(&dest, "a").unwrap();
        write_atomic(&dest, "b").unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "b");
    }
}
