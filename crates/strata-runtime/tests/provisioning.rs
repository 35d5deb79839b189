//! End-to-end provisioning against the mock fleet: repeated runs must leave
//! hosts byte-identical and never accumulate firewall rules or config blocks.

use std::collections::BTreeMap;
use std::time::Duration;
use strata_runtime::mock::{MockExecutor, MockProvider};
use strata_runtime::steps::execute;
use strata_runtime::{
    select_provider, BlockEdit, Credentials, FirewallRule, ManagedBlock, ProvisionPlan, Redactor,
    ResourceProvider, ResourceSpec, RetryPolicy, RuntimeError, ScriptStep, ServiceCheck, Upload,
};
use strata_schema::Protocol;

const DB: &str = "10.64.0.10";
const PG_HBA: &str = "/etc/postgresql/16/main/pg_hba.conf";

fn db_plan(app_subnet: &str) -> ProvisionPlan {
    let mut plan = ProvisionPlan::new(DB, Credentials::default());
    plan.retry = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(5));
    plan.command_timeout = Duration::from_secs(5);
    plan.uploads.push(Upload {
        remote_path: "/etc/postgresql/16/main/conf.d/strata.conf".to_owned(),
        bytes: b"listen_addresses = '*'\n".to_vec(),
    });
    plan.scripts.push(ScriptStep {
        name: "10-postgres.sh".to_owned(),
        body: b"apt-get install -y postgresql\n".to_vec(),
    });
    plan.blocks.push(BlockEdit {
        path: PG_HBA.to_owned(),
        block: ManagedBlock::new(
            "strata-app-access",
            format!("host all app {app_subnet} scram-sha-256"),
        ),
    });
    plan.firewall.push(FirewallRule {
        source: app_subnet.to_owned(),
        port: 5432,
        protocol: Protocol::Tcp,
    });
    plan.service = Some(ServiceCheck {
        backoff: Duration::ZERO,
        ..ServiceCheck::new("postgresql")
    });
    plan
}

#[test]
fn repeated_provisioning_is_idempotent() {
    let exec = MockExecutor::new();
    exec.put_file(DB, PG_HBA, "local all postgres peer\n");
    let redactor = Redactor::default();

    execute(&exec, &db_plan("10.0.1.0/24"), &redactor).unwrap();
    let after_first = exec.file(DB, PG_HBA).unwrap();

    for _ in 0..3 {
        let report = execute(&exec, &db_plan("10.0.1.0/24"), &redactor).unwrap();
        assert_eq!(report.blocks_changed, 0);
    }

    assert_eq!(exec.file(DB, PG_HBA).unwrap(), after_first);
    assert_eq!(after_first.matches("# BEGIN strata-app-access").count(), 1);
    assert_eq!(exec.firewall_rules(DB), vec!["10.0.1.0/24 5432/tcp"]);
}

#[test]
fn changed_input_rewrites_block_in_place() {
    let exec = MockExecutor::new();
    exec.put_file(DB, PG_HBA, "local all postgres peer\n");
    let redactor = Redactor::default();

    execute(&exec, &db_plan("10.0.1.0/24"), &redactor).unwrap();
    let report = execute(&exec, &db_plan("10.0.2.0/24"), &redactor).unwrap();
    assert_eq!(report.blocks_changed, 1);

    let hba = exec.file(DB, PG_HBA).unwrap();
    assert!(hba.starts_with("local all postgres peer\n"));
    assert!(hba.contains("10.0.2.0/24"));
    assert!(!hba.contains("10.0.1.0/24"));
    assert!(exec
        .file(DB, &format!("{PG_HBA}.strata.bak"))
        .unwrap()
        .contains("10.0.1.0/24"));
}

#[test]
fn unhealthy_service_surfaces_redacted_diagnostics() {
    let exec = MockExecutor::new();
    exec.set_unhealthy("postgresql", true);
    exec.put_file(
        DB,
        "/etc/systemd/system/postgresql.service",
        "[Service]\nEnvironment=PGPASSWORD=correct-horse\n",
    );
    let redactor = Redactor::new(vec!["correct-horse".to_owned()]);

    let err = execute(&exec, &db_plan("10.0.1.0/24"), &redactor).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("postgresql"));
    assert!(message.contains("journalctl"));
    assert!(!message.contains("correct-horse"));
    assert!(matches!(
        err,
        RuntimeError::HealthCheckExhausted { attempts: 5, .. }
    ));
}

#[test]
fn provider_and_executor_share_addresses() {
    let provider = MockProvider::new();
    let address = provider.allocate_stable_address().unwrap();
    let spec = ResourceSpec {
        environment: "staging".to_owned(),
        isolation_key: "abc".to_owned(),
        layer: "02-data".to_owned(),
        name: "db".to_owned(),
        kind: "instance".to_owned(),
        properties: BTreeMap::new(),
        address: Some(address.clone()),
    };
    let handle = provider.create_or_update_resource(&spec).unwrap();
    assert_eq!(provider.describe_resource(&handle).unwrap()["address"], address.as_str());

    let exec = MockExecutor::new();
    let mut plan = ProvisionPlan::new(address.clone(), Credentials::default());
    plan.retry = RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(5));
    plan.uploads.push(Upload {
        remote_path: "/etc/motd".to_owned(),
        bytes: b"staging db\n".to_vec(),
    });
    execute(&exec, &plan, &Redactor::default()).unwrap();
    assert_eq!(exec.file(&address, "/etc/motd").unwrap(), "staging db\n");
}

#[test]
fn unknown_backends_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        select_provider("aws", dir.path()),
        Err(RuntimeError::BackendUnavailable(_))
    ));
    assert!(strata_runtime::select_executor("telnet").is_err());
}
