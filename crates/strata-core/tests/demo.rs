//! The shipped multi-tier demo stays loadable and applies cleanly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{load_pipeline, Orchestrator, OutcomeStatus, RunOptions, WorkspaceManager};
use strata_runtime::mock::{MockExecutor, MockProvider};
use strata_schema::HostRef;

fn demo_pipeline() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/multi-tier/strata.toml")
}

#[test]
fn demo_pipeline_normalizes() {
    let pipeline = load_pipeline(&demo_pipeline()).unwrap();
    assert_eq!(pipeline.provider_backend, "local");
    assert_eq!(pipeline.remote.backend, "ssh");
    let names: Vec<&str> = pipeline.layers.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(
        names,
        ["01-core", "02-compute", "03-database", "04-application"]
    );

    let app = pipeline.layer("04-application").unwrap();
    let provision = app.provision.as_ref().unwrap();
    assert!(matches!(&provision.host, HostRef::Input(key) if key == "app_host"));
    assert!(provision.files.iter().all(|f| f.source.is_file()));
    assert!(provision.scripts.iter().all(|s| s.is_file()));
}

#[test]
fn demo_applies_against_mock_backends() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = load_pipeline(&demo_pipeline()).unwrap();
    let workspace = WorkspaceManager::new(dir.path()).select("dev").unwrap();
    let executor = Arc::new(MockExecutor::new());
    let orc = Orchestrator::new(
        pipeline,
        workspace,
        Arc::new(MockProvider::new()),
        executor.clone(),
    )
    .with_secrets(BTreeMap::from([
        ("DB_PASSWORD".to_owned(), "demo-password".to_owned()),
        ("STRATA_SSH_KEY".to_owned(), "/dev/null".to_owned()),
    ]));

    let summary = orc.apply(&RunOptions::default()).unwrap();
    assert!(summary.overall_succeeded, "{summary:?}");
    assert_eq!(summary.count(OutcomeStatus::Applied), 4);
    assert!(executor.call_count() > 0);

    let rerun = orc.apply(&RunOptions::default()).unwrap();
    assert_eq!(rerun.count(OutcomeStatus::Unchanged), 4);
}
