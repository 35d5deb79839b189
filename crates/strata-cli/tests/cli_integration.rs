//! CLI subprocess integration tests.
//!
//! These tests invoke the `strata` binary as a subprocess and verify exit
//! codes, stdout content, and JSON output stability. Resources go to the
//! local ledger provider and commands to the mock fleet.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const PIPELINE: &str = r#"pipeline_version = 1

[provider]
backend = "local"

[remote]
backend = "mock"
retry_backoff_secs = 0

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
outputs = { web_host = "web.address" }

  [[layer.resource]]
  name = "web"
  kind = "instance"
  stable_address = true
  properties = { network = "{{ inputs.network_id }}" }

[[layer]]
name = "03-web"
ordinal = 3
inputs = [{ from = "02-compute", key = "web_host" }]

  [layer.provision]
  host = "web_host"
  scripts = ["scripts/nginx.sh"]

    [layer.provision.service]
    name = "nginx"
"#;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(
            dir.path().join("scripts/nginx.sh"),
            "#!/bin/sh\napt-get install -y nginx\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("strata.toml"), PIPELINE).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self) -> PathBuf {
        self.path().join(".strata")
    }

    fn strata(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_strata"))
            .current_dir(self.path())
            .env_remove("STRATA_LOG")
            .args(args)
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let mut full = vec!["--json"];
        full.extend_from_slice(args);
        let output = self.strata(&full);
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout)
            .unwrap_or_else(|e| panic!("invalid JSON from {args:?}: {e}\n{stdout}"))
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let fx = Fixture::new();
    let output = fx.strata(&["--version"]);
    assert!(output.status.success(), "strata --version must exit 0");
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}

#[test]
fn cli_help_lists_commands() {
    let fx = Fixture::new();
    let output = fx.strata(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["init", "plan", "apply", "destroy", "status", "inspect", "workspace"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn cli_plan_json_marks_downstream_pending() {
    let fx = Fixture::new();
    let plan = fx.json(&["plan", "-e", "dev"]);
    assert_eq!(plan["mode"], "plan");
    assert_eq!(plan["overall_succeeded"], true);
    let layers = plan["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 3);
    assert_eq!(layers[0]["status"], "would_apply");
    assert_eq!(layers[1]["status"], "pending");
    assert_eq!(layers[2]["status"], "pending");
}

#[test]
fn cli_apply_status_destroy_cycle() {
    let fx = Fixture::new();

    let apply = fx.strata(&["apply", "-e", "dev", "--auto-approve"]);
    assert!(apply.status.success(), "apply failed: {}", stderr(&apply));
    let stdout = String::from_utf8_lossy(&apply.stdout);
    assert!(stdout.contains("apply succeeded in 'dev'"), "{stdout}");

    let status = fx.json(&["status", "-e", "dev"]);
    let layers = status["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 3);
    assert!(layers.iter().all(|l| l["last_status"] == "succeeded"));
    assert!(status["absent"].as_array().unwrap().is_empty());

    let inspect = fx.json(&["inspect", "-e", "dev", "02-compute"]);
    assert!(inspect["outputs"]["web_host"].is_string());
    assert_eq!(inspect["resource_handles"][0]["name"], "web");

    // A second apply has nothing to change.
    let rerun = fx.json(&["apply", "-e", "dev", "--auto-approve"]);
    assert!(rerun["layers"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["status"] == "unchanged"));

    let destroy = fx.strata(&["destroy", "-e", "dev", "--auto-approve"]);
    assert!(destroy.status.success(), "destroy failed: {}", stderr(&destroy));

    let status = fx.json(&["status", "-e", "dev"]);
    assert!(status["layers"].as_array().unwrap().is_empty());
    assert_eq!(status["absent"].as_array().unwrap().len(), 3);
}

#[test]
fn cli_environments_are_isolated() {
    let fx = Fixture::new();
    let apply = fx.strata(&["apply", "-e", "dev", "--auto-approve", "--layer", "01-core"]);
    assert!(apply.status.success(), "{}", stderr(&apply));

    let staging = fx.json(&["plan", "-e", "staging", "--layer", "01-core"]);
    assert_eq!(staging["layers"][0]["status"], "would_apply");

    let dev = fx.json(&["plan", "-e", "dev", "--layer", "01-core"]);
    assert_eq!(dev["layers"][0]["status"], "unchanged");
}

#[test]
fn cli_apply_without_upstream_fails() {
    let fx = Fixture::new();
    let output = fx.strata(&["apply", "-e", "dev", "--auto-approve", "--layer", "03-web"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("stopped at layer '03-web'"), "{stdout}");
    assert!(stdout.contains("dependency_not_satisfied"), "{stdout}");
}

#[test]
fn cli_apply_requires_approval_when_not_interactive() {
    let fx = Fixture::new();
    let output = fx.strata(&["apply", "-e", "dev"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("--auto-approve"));
    assert!(!fx.store().join("store/envs/dev/layers/01-core.json").exists());
}

#[test]
fn cli_invalid_pipeline_exits_two() {
    let fx = Fixture::new();
    std::fs::write(fx.path().join("strata.toml"), "pipeline_version = 1\n[[layer]]\n").unwrap();
    let output = fx.strata(&["plan"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
    assert!(stderr(&output).contains("pipeline error"));
}

#[test]
fn cli_unknown_layer_exits_two() {
    let fx = Fixture::new();
    let output = fx.strata(&["plan", "--layer", "99-nope"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
}

#[test]
fn cli_status_of_unknown_environment_exits_three() {
    let fx = Fixture::new();
    let output = fx.strata(&["status", "-e", "nowhere"]);
    assert_eq!(output.status.code(), Some(3), "{}", stderr(&output));
}

#[test]
fn cli_workspace_delete_refuses_non_empty_partition() {
    let fx = Fixture::new();
    let apply = fx.strata(&["apply", "-e", "qa", "--auto-approve", "--layer", "01-core"]);
    assert!(apply.status.success(), "{}", stderr(&apply));

    let list = fx.json(&["workspace", "list"]);
    assert_eq!(list[0]["name"], "qa");
    assert_eq!(list[0]["records"], 1);

    let refused = fx.strata(&["workspace", "delete", "qa", "--auto-approve"]);
    assert_eq!(refused.status.code(), Some(3), "{}", stderr(&refused));

    let destroy = fx.strata(&["destroy", "-e", "qa", "--auto-approve"]);
    assert!(destroy.status.success(), "{}", stderr(&destroy));
    let deleted = fx.strata(&["workspace", "delete", "qa", "--auto-approve"]);
    assert!(deleted.status.success(), "{}", stderr(&deleted));
    assert!(fx.json(&["workspace", "list"]).as_array().unwrap().is_empty());
}

#[test]
fn cli_init_writes_starter_pipeline_once() {
    let dir = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_strata"))
            .current_dir(dir.path())
            .args(args)
            .output()
            .unwrap()
    };

    let first = run(&["init", "-e", "dev"]);
    assert!(first.status.success(), "{}", stderr(&first));
    let written = std::fs::read_to_string(dir.path().join("strata.toml")).unwrap();
    assert!(written.contains("pipeline_version = 1"));

    std::fs::write(dir.path().join("strata.toml"), "# mine\n").unwrap();
    let second = run(&["init", "-e", "dev"]);
    assert!(second.status.success());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("strata.toml")).unwrap(),
        "# mine\n"
    );

    let forced = run(&["init", "-e", "dev", "--force"]);
    assert!(forced.status.success());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("strata.toml")).unwrap(),
        written
    );
}

#[test]
fn cli_completions_bash() {
    let fx = Fixture::new();
    let output = fx.strata(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("strata"));
}
