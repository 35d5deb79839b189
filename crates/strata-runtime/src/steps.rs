//! Execution of a layer's provisioning plan against one host.
//!
//! Every remote operation is retried on transient connection errors per the
//! plan's [`RetryPolicy`]. Every step converges: uploads overwrite, scripts are expected to be
//! re-runnable, managed blocks are rewritten only when their content changes,
//! firewall rules are deduplicated before being added, and the service check
//! is bounded. Re-running an unchanged plan leaves the host in the same state.

use crate::firewall::FirewallRule;
use crate::managed::ManagedBlock;
use crate::redact::Redactor;
use crate::remote::{argv, command_line, CommandOutput, Credentials, RemoteExecutor, RemoteSession};
use crate::retry::RetryPolicy;
use crate::service::ServiceCheck;
use crate::RuntimeError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Directory on the host that receives provisioning scripts.
pub const SCRIPT_DIR: &str = "/var/lib/strata/scripts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub remote_path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    /// File name under [`SCRIPT_DIR`].
    pub name: String,
    pub body: Vec<u8>,
}

impl ScriptStep {
    pub fn remote_path(&self) -> String {
        format!("{SCRIPT_DIR}/{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEdit {
    pub path: String,
    pub block: ManagedBlock,
}

#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub address: String,
    pub credentials: Credentials,
    pub uploads: Vec<Upload>,
    pub scripts: Vec<ScriptStep>,
    /// Exported to every script as `NAME=value`. Holds resolved secrets.
    pub env: BTreeMap<String, String>,
    pub blocks: Vec<BlockEdit>,
    pub firewall: Vec<FirewallRule>,
    pub service: Option<ServiceCheck>,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProvisionPlan {
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        let retry = RetryPolicy::default();
        Self {
            address: address.into(),
            credentials,
            uploads: Vec::new(),
            scripts: Vec::new(),
            env: BTreeMap::new(),
            blocks: Vec::new(),
            firewall: Vec::new(),
            service: None,
            command_timeout: retry.timeout,
            retry,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
            && self.scripts.is_empty()
            && self.blocks.is_empty()
            && self.firewall.is_empty()
            && self.service.is_none()
    }

    /// `env NAME=value ... bash <path>`, or plain `bash <path>` without env.
    fn script_argv(&self, path: &str) -> Vec<String> {
        let mut cmd = Vec::with_capacity(self.env.len() + 3);
        if !self.env.is_empty() {
            cmd.push("env".to_owned());
            cmd.extend(self.env.iter().map(|(name, value)| format!("{name}={value}")));
        }
        cmd.extend(argv(["bash", path]));
        cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub uploads: usize,
    pub scripts: usize,
    pub blocks_changed: usize,
    pub blocks_unchanged: usize,
    pub firewall_duplicates_removed: u32,
    pub service_attempts: u32,
}

/// Session wrapper that retries uploads and commands per the plan's policy
/// and keeps secrets out of retry logs and command errors.
struct RetryingSession<'a> {
    inner: &'a dyn RemoteSession,
    retry: &'a RetryPolicy,
    redactor: &'a Redactor,
}

impl RemoteSession for RetryingSession<'_> {
    fn address(&self) -> &str {
        self.inner.address()
    }

    fn upload_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), RuntimeError> {
        self.retry.run(&format!("upload {remote_path}"), |_| {
            self.inner.upload_file(bytes, remote_path)
        })
    }

    fn run_command(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let line = self.redactor.redact(&command_line(argv));
        self.retry
            .run(&line, |_| self.inner.run_command(argv, timeout))
            .map_err(|e| redact_error(e, self.redactor))
    }
}

fn redact_error(e: RuntimeError, redactor: &Redactor) -> RuntimeError {
    match e {
        RuntimeError::Timeout { command, secs } => RuntimeError::Timeout {
            command: redactor.redact(&command),
            secs,
        },
        RuntimeError::CommandFailed {
            command,
            exit_code,
            stderr,
        } => RuntimeError::CommandFailed {
            command: redactor.redact(&command),
            exit_code,
            stderr: redactor.redact(&stderr),
        },
        RuntimeError::Connect { address, message } => RuntimeError::Connect {
            address,
            message: redactor.redact(&message),
        },
        other => other,
    }
}

fn command_failed(cmd: &[String], out: &CommandOutput, redactor: &Redactor) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: redactor.redact(&command_line(cmd)),
        exit_code: out.exit_code,
        stderr: redactor.redact(&out.stderr),
    }
}

/// Run `plan` through `executor`. Connection, upload and command failures
/// that look transient are retried per `plan.retry`; everything else fails
/// fast.
pub fn execute(
    executor: &dyn RemoteExecutor,
    plan: &ProvisionPlan,
    redactor: &Redactor,
) -> Result<ProvisionReport, RuntimeError> {
    let mut report = ProvisionReport::default();
    if plan.is_empty() {
        return Ok(report);
    }

    let session = plan.retry.run(&format!("connect {}", plan.address), |_| {
        executor.connect(&plan.address, &plan.credentials)
    })?;
    let session = RetryingSession {
        inner: session.as_ref(),
        retry: &plan.retry,
        redactor,
    };
    let session = &session;
    info!("provisioning {} via {}", plan.address, executor.name());

    for upload in &plan.uploads {
        session.upload_file(&upload.bytes, &upload.remote_path)?;
        report.uploads += 1;
    }

    for script in &plan.scripts {
        let path = script.remote_path();
        session.upload_file(&script.body, &path)?;
        let cmd = plan.script_argv(&path);
        let out = session.run_command(&cmd, plan.command_timeout)?;
        if !out.success() {
            return Err(command_failed(&cmd, &out, redactor));
        }
        debug!("script {} ok on {}", script.name, plan.address);
        report.scripts += 1;
    }

    for edit in &plan.blocks {
        if apply_block(session, plan, edit, redactor)? {
            report.blocks_changed += 1;
        } else {
            report.blocks_unchanged += 1;
        }
    }

    for rule in &plan.firewall {
        report.firewall_duplicates_removed +=
            rule.converge(session, plan.command_timeout, redactor)?;
    }

    if let Some(check) = &plan.service {
        report.service_attempts = check.restart_and_verify(session, redactor)?;
    }

    Ok(report)
}

/// Current content of `path`, or `None` when the file does not exist. A file
/// that exists but cannot be read is an error, never treated as absent.
fn read_existing(
    session: &dyn RemoteSession,
    path: &str,
    timeout: Duration,
    redactor: &Redactor,
) -> Result<Option<String>, RuntimeError> {
    let test = argv(["test", "-e", path]);
    let out = session.run_command(&test, timeout)?;
    match out.exit_code {
        0 => {}
        1 => return Ok(None),
        _ => return Err(command_failed(&test, &out, redactor)),
    }

    let cat = argv(["cat", path]);
    let out = session.run_command(&cat, timeout)?;
    if out.success() {
        Ok(Some(out.stdout))
    } else if out.exit_code == 1 && out.stderr.contains("No such file") {
        // Removed between the two commands.
        Ok(None)
    } else {
        Err(command_failed(&cat, &out, redactor))
    }
}

/// Rewrite the block in its file; returns whether the file changed.
///
/// A file that already exists is copied to `<path>.strata.bak` before it is
/// replaced.
fn apply_block(
    session: &dyn RemoteSession,
    plan: &ProvisionPlan,
    edit: &BlockEdit,
    redactor: &Redactor,
) -> Result<bool, RuntimeError> {
    let existing = read_existing(session, &edit.path, plan.command_timeout, redactor)?;
    let existed = existing.is_some();
    let current = existing.unwrap_or_default();

    let updated = edit.block.apply(&current, &edit.path)?;
    if existed && updated == current {
        debug!("block {} in {} unchanged", edit.block.marker, edit.path);
        return Ok(false);
    }

    if existed {
        let backup = format!("{}.strata.bak", edit.path);
        let cmd = argv(["cp", "-p", edit.path.as_str(), backup.as_str()]);
        let out = session.run_command(&cmd, plan.command_timeout)?;
        if !out.success() {
            return Err(command_failed(&cmd, &out, redactor));
        }
    }
    session.upload_file(updated.as_bytes(), &edit.path)?;
    info!("block {} written to {}", edit.block.marker, edit.path);
    Ok(true)
}
