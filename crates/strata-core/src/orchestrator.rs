use crate::concurrency::shutdown_requested;
use crate::drift::verify_resources;
use crate::inputs::{gather, pipeline_redactor, LayerInputs, ProcessEnv, SecretSource};
use crate::lifecycle::validate_transition;
use crate::resolver::resolve_inputs;
use crate::summary::{LayerFailure, LayerOutcome, OutcomeStatus, RunSummary};
use crate::trigger::decide;
use crate::workspace::WorkspaceHandle;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_runtime::steps::{self, ProvisionReport};
use strata_runtime::{
    select_executor, select_provider, Credentials, ProvisionPlan, Redactor, RemoteExecutor,
    ResourceProvider, ResourceSpec, RetryPolicy, RuntimeError,
};
use strata_schema::{parse_pipeline_file, HostRef, Layer, Pipeline, Provision};
use strata_store::{LayerLock, LayerState, LayerStatus, ResourceRecord, RunEvent};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Plan,
    Apply,
    Destroy,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Plan => "plan",
            RunMode::Apply => "apply",
            RunMode::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an invocation is in its walk over the layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Resolving,
    Executing(String),
    Failed,
    Completed,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to these layers. Empty selects every layer.
    pub targets: Vec<String>,
    /// Re-run provisioning even when the fingerprint is unchanged.
    pub force: bool,
    /// Checked at layer boundaries, in addition to Ctrl-C.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    fn cancelled(&self) -> bool {
        shutdown_requested()
            || self
                .cancel
                .as_ref()
                .is_some_and(|c| c.load(Ordering::SeqCst))
    }
}

/// Parse and validate a pipeline file, resolving payload paths against its directory.
pub fn load_pipeline(path: &Path) -> Result<Pipeline, CoreError> {
    let file = parse_pipeline_file(path)?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    Ok(file.normalize(base_dir)?)
}

/// State private to one invocation.
struct Run {
    token: String,
    phase: RunPhase,
    /// Locks taken so far; a layer is never locked twice by the same run.
    held: HashMap<String, LayerLock>,
    /// Plan: layers reported as changing, whose outputs are not yet known.
    changing: BTreeSet<String>,
    /// Warnings raised by the layer in flight, attached to its outcome even
    /// when it fails.
    warnings: Vec<String>,
}

impl Run {
    fn enter(&mut self, phase: RunPhase) {
        debug!("run {}: {:?} -> {:?}", self.token, self.phase, phase);
        self.phase = phase;
    }
}

/// Drives plan, apply and destroy over a pipeline in one environment.
///
/// An orchestrator is bound to a single `WorkspaceHandle` for its lifetime;
/// there is no way to switch environments mid-run.
pub struct Orchestrator {
    pipeline: Pipeline,
    workspace: WorkspaceHandle,
    provider: Arc<dyn ResourceProvider>,
    executor: Arc<dyn RemoteExecutor>,
    secrets: Box<dyn SecretSource>,
}

impl Orchestrator {
    pub fn new(
        pipeline: Pipeline,
        workspace: WorkspaceHandle,
        provider: Arc<dyn ResourceProvider>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            pipeline,
            workspace,
            provider,
            executor,
            secrets: Box::new(ProcessEnv),
        }
    }

    /// Use the provider and executor backends named in the pipeline file.
    pub fn with_pipeline_backends(
        pipeline: Pipeline,
        workspace: WorkspaceHandle,
    ) -> Result<Self, CoreError> {
        let provider = select_provider(&pipeline.provider_backend, workspace.store_root())?;
        let executor = select_executor(&pipeline.remote.backend)?;
        Ok(Self::new(
            pipeline,
            workspace,
            Arc::from(provider),
            Arc::from(executor),
        ))
    }

    pub fn with_secrets(mut self, secrets: impl SecretSource + 'static) -> Self {
        self.secrets = Box::new(secrets);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn workspace(&self) -> &WorkspaceHandle {
        &self.workspace
    }

    /// Redactor for every secret the pipeline declares.
    pub fn redactor(&self) -> Redactor {
        pipeline_redactor(&self.pipeline, self.secrets.as_ref())
    }

    pub fn plan(&self, options: &RunOptions) -> Result<RunSummary, CoreError> {
        self.run(RunMode::Plan, options)
    }

    pub fn apply(&self, options: &RunOptions) -> Result<RunSummary, CoreError> {
        self.run(RunMode::Apply, options)
    }

    pub fn destroy(&self, options: &RunOptions) -> Result<RunSummary, CoreError> {
        self.run(RunMode::Destroy, options)
    }

    /// Walk the selected layers (ascending for plan/apply, descending for
    /// destroy), stopping at the first failure.
    ///
    /// Layer failures are reported in the summary; `Err` is returned only when
    /// the run could not start or its log could not be written.
    pub fn run(&self, mode: RunMode, options: &RunOptions) -> Result<RunSummary, CoreError> {
        let mut layers = self.pipeline.select(&options.targets)?;
        if mode == RunMode::Destroy {
            layers.reverse();
        }

        let mut log = self.workspace.open_run_log(mode.as_str())?;
        let mut run = Run {
            token: log.run_id().to_owned(),
            phase: RunPhase::Init,
            held: HashMap::new(),
            changing: BTreeSet::new(),
            warnings: Vec::new(),
        };
        let environment = self.workspace.name().to_string();
        log.append(&RunEvent::Started {
            run_id: run.token.clone(),
            environment: environment.clone(),
            mode: mode.as_str().to_owned(),
            started_at: chrono::Utc::now().to_rfc3339(),
            layers: layers.iter().map(|l| l.name.to_string()).collect(),
        })?;
        info!(
            "{mode} of {} layer(s) in '{environment}' (run {})",
            layers.len(),
            run.token
        );

        let mut summary = RunSummary::new(run.token.clone(), environment.clone(), mode);
        run.enter(RunPhase::Resolving);
        for layer in layers {
            if options.cancelled() {
                warn!("cancelled before layer '{}'", layer.name);
                let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Cancelled);
                outcome.detail = Some("cancellation requested".to_owned());
                self.record(&mut log, &outcome)?;
                summary.push(outcome);
                run.enter(RunPhase::Failed);
                break;
            }

            run.enter(RunPhase::Executing(layer.name.to_string()));
            let started = Instant::now();
            let result = match mode {
                RunMode::Plan => self.plan_layer(layer, options, &mut run),
                RunMode::Apply => self.apply_layer(layer, options, &mut run),
                RunMode::Destroy => self.destroy_layer(layer, &mut run),
            };
            let mut outcome = result.unwrap_or_else(|e| {
                warn!("{mode} of '{}' in '{environment}' failed: {e}", layer.name);
                let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Failed);
                outcome.failure = Some(LayerFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                outcome
            });
            outcome.warnings.append(&mut run.warnings);
            outcome.duration_ms = started.elapsed().as_millis() as u64;
            self.record(&mut log, &outcome)?;

            let failed = outcome.status.is_failure();
            summary.push(outcome);
            if failed {
                run.enter(RunPhase::Failed);
                break;
            }
        }
        if summary.overall_succeeded {
            run.enter(RunPhase::Completed);
        }
        run.held.clear();

        log.append(&RunEvent::Finished {
            overall_succeeded: summary.overall_succeeded,
            finished_at: chrono::Utc::now().to_rfc3339(),
            summary: serde_json::to_value(&summary)?,
        })?;
        Ok(summary)
    }

    fn record(&self, log: &mut strata_store::RunLog, outcome: &LayerOutcome) -> Result<(), CoreError> {
        let detail = match (&outcome.failure, &outcome.detail) {
            (Some(f), _) => Some(format!("{}: {}", f.kind, f.message)),
            (None, detail) => detail.clone(),
        };
        log.append(&RunEvent::LayerOutcome {
            layer: outcome.layer.clone(),
            status: outcome.status.to_string(),
            duration_ms: outcome.duration_ms,
            detail,
            fingerprint: outcome.fingerprint.clone(),
            at: chrono::Utc::now().to_rfc3339(),
        })?;
        Ok(())
    }

    fn hold_exclusive(&self, run: &mut Run, layer: &str) -> Result<(), CoreError> {
        if run.held.get(layer).is_some_and(LayerLock::is_exclusive) {
            return Ok(());
        }
        run.held.remove(layer);
        let lock = self.workspace.lock_exclusive(layer, &run.token)?;
        run.held.insert(layer.to_owned(), lock);
        Ok(())
    }

    fn hold_shared(&self, run: &mut Run, layer: &str) -> Result<(), CoreError> {
        if run.held.contains_key(layer) {
            return Ok(());
        }
        let lock = self.workspace.lock_shared(layer)?;
        run.held.insert(layer.to_owned(), lock);
        Ok(())
    }

    fn status_of(&self, layer: &str) -> Result<Option<LayerStatus>, CoreError> {
        Ok(self.workspace.get(layer)?.map(|s| s.last_status))
    }

    fn not_satisfied(&self, layer: &Layer, dependency: &str, status: Option<LayerStatus>) -> CoreError {
        CoreError::DependencyNotSatisfied {
            layer: layer.name.to_string(),
            dependency: dependency.to_owned(),
            environment: self.workspace.name().to_string(),
            status: status.map_or_else(|| "not applied".to_owned(), |s| s.to_string()),
        }
    }

    fn gather(&self, layer: &Layer) -> Result<LayerInputs, CoreError> {
        let upstream = resolve_inputs(&self.workspace, layer)?;
        gather(self.workspace.name(), layer, upstream, self.secrets.as_ref())
    }

    fn plan_layer(
        &self,
        layer: &Layer,
        options: &RunOptions,
        run: &mut Run,
    ) -> Result<LayerOutcome, CoreError> {
        self.hold_shared(run, &layer.name)?;
        let mut waiting = Vec::new();
        for upstream in self.pipeline.upstream_of(layer) {
            self.hold_shared(run, &upstream.name)?;
            if run.changing.contains(upstream.name.as_str()) {
                waiting.push(upstream.name.to_string());
                continue;
            }
            let status = self.status_of(&upstream.name)?;
            if status != Some(LayerStatus::Succeeded) {
                return Err(self.not_satisfied(layer, &upstream.name, status));
            }
        }
        if !waiting.is_empty() {
            run.changing.insert(layer.name.to_string());
            let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Pending);
            outcome.detail = Some(format!(
                "inputs known after {} is applied",
                waiting.join(", ")
            ));
            return Ok(outcome);
        }

        let inputs = self.gather(layer)?;
        let previous = self.workspace.get(&layer.name)?;
        let decision = decide(previous.as_ref(), &inputs.artifacts);
        let mut outcome = if decision.run || options.force {
            validate_transition(previous.as_ref().map(|s| s.last_status), LayerStatus::Succeeded)?;
            run.changing.insert(layer.name.to_string());
            let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::WouldApply);
            outcome.detail = Some(if decision.run {
                decision.reason.to_string()
            } else {
                "forced".to_owned()
            });
            outcome
        } else {
            let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Unchanged);
            if let Some(state) = &previous {
                outcome.warnings = verify_resources(self.provider.as_ref(), state);
            }
            outcome
        };
        outcome.fingerprint = Some(decision.new_fingerprint.short().to_owned());
        Ok(outcome)
    }

    fn apply_layer(
        &self,
        layer: &Layer,
        options: &RunOptions,
        run: &mut Run,
    ) -> Result<LayerOutcome, CoreError> {
        let environment = self.workspace.name().to_string();
        self.hold_exclusive(run, &layer.name)?;
        for upstream in self.pipeline.upstream_of(layer) {
            self.hold_shared(run, &upstream.name)?;
            let status = self.status_of(&upstream.name)?;
            if status != Some(LayerStatus::Succeeded) {
                return Err(self.not_satisfied(layer, &upstream.name, status));
            }
        }

        let inputs = self.gather(layer)?;
        let previous = self.workspace.get(&layer.name)?;
        let decision = decide(previous.as_ref(), &inputs.artifacts);
        let fingerprint = decision.new_fingerprint.short().to_owned();

        if !decision.run && !options.force {
            info!("{environment}/{} unchanged ({fingerprint})", layer.name);
            let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Unchanged);
            outcome.fingerprint = Some(fingerprint);
            if let Some(state) = &previous {
                outcome.warnings = verify_resources(self.provider.as_ref(), state);
            }
            return Ok(outcome);
        }

        validate_transition(previous.as_ref().map(|s| s.last_status), LayerStatus::Succeeded)?;
        let reason = if decision.run {
            decision.reason.to_string()
        } else {
            "forced".to_owned()
        };
        info!("applying {environment}/{}: {reason}", layer.name);

        if let Some(prev) = &previous {
            let mut marked = prev.clone();
            marked.lock_token = Some(run.token.clone());
            self.workspace.put(&marked)?;
        }

        let mut created = Vec::new();
        let executed = self.execute_layer(
            layer,
            &inputs,
            previous.as_ref(),
            &mut created,
            &mut run.warnings,
        );
        let (outputs, report) = match executed {
            Ok(done) => done,
            Err(e) => {
                self.record_failure(layer, previous.as_ref(), created);
                return Err(e);
            }
        };

        let mut state = self.workspace.new_state(&layer.name, LayerStatus::Succeeded);
        state.outputs = outputs;
        state.resource_handles = created;
        state.last_applied_fingerprint = Some(decision.new_fingerprint);
        let state = self.workspace.put(&state)?;

        let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Applied);
        outcome.detail = Some(describe_apply(&reason, &state, report.as_ref()));
        outcome.fingerprint = Some(fingerprint);
        outcome.warnings = self.prune(previous.as_ref(), &state);
        Ok(outcome)
    }

    /// Reconcile resources, read outputs, then provision the host.
    ///
    /// Every resource reconciled is pushed to `created` as soon as the provider
    /// returns its handle, so a failure later on can still record it.
    fn execute_layer(
        &self,
        layer: &Layer,
        inputs: &LayerInputs,
        previous: Option<&LayerState>,
        created: &mut Vec<ResourceRecord>,
        warnings: &mut Vec<String>,
    ) -> Result<(BTreeMap<String, Value>, Option<ProvisionReport>), CoreError> {
        let env = self.workspace.environment();
        for resource in &inputs.resources {
            let prior_address = previous
                .and_then(|p| p.resource_handles.iter().find(|r| r.name == resource.name))
                .and_then(|r| r.address.clone());
            let (address, fresh) = match (resource.stable_address, prior_address) {
                (false, _) => (None, false),
                (true, Some(address)) => (Some(address), false),
                (true, None) => (Some(self.provider.allocate_stable_address()?), true),
            };
            let spec = ResourceSpec {
                environment: env.name.to_string(),
                isolation_key: env.isolation_key.clone(),
                layer: layer.name.to_string(),
                name: resource.name.clone(),
                kind: resource.kind.clone(),
                properties: resource.properties.clone(),
                address: address.clone(),
            };
            let handle = match self.provider.create_or_update_resource(&spec) {
                Ok(handle) => handle,
                Err(e) => {
                    if let (true, Some(address)) = (fresh, &address) {
                        if let Err(re) = self.provider.release_stable_address(address) {
                            warn!("could not release address {address}: {re}");
                            warnings.push(format!("could not release address {address}: {re}"));
                        }
                    }
                    return Err(e.into());
                }
            };
            debug!("reconciled {}/{} -> {handle}", layer.name, resource.name);
            created.push(ResourceRecord {
                name: resource.name.clone(),
                kind: resource.kind.clone(),
                handle,
                address,
            });
        }

        let mut described: BTreeMap<&str, strata_runtime::Attributes> = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for binding in &layer.outputs {
            let missing = || CoreError::OutputKeyMissing {
                layer: layer.name.to_string(),
                environment: env.name.to_string(),
                key: binding.key.clone(),
            };
            if !described.contains_key(binding.resource.as_str()) {
                let record = created
                    .iter()
                    .find(|r| r.name == binding.resource)
                    .ok_or_else(missing)?;
                described.insert(
                    binding.resource.as_str(),
                    self.provider.describe_resource(&record.handle)?,
                );
            }
            let value = described
                .get(binding.resource.as_str())
                .and_then(|attrs| attrs.get(&binding.attribute))
                .cloned()
                .ok_or_else(missing)?;
            outputs.insert(binding.key.clone(), value);
        }

        let report = match &layer.provision {
            Some(provision) => {
                let plan = self.provision_plan(layer, provision, inputs, created)?;
                let report = steps::execute(self.executor.as_ref(), &plan, &inputs.redactor())
                    .map_err(|e| self.remote_error(layer, e))?;
                Some(report)
            }
            None => None,
        };
        Ok((outputs, report))
    }

    fn provision_plan(
        &self,
        layer: &Layer,
        provision: &Provision,
        inputs: &LayerInputs,
        created: &[ResourceRecord],
    ) -> Result<ProvisionPlan, CoreError> {
        let address = match &provision.host {
            HostRef::Resource(name) => created
                .iter()
                .find(|r| &r.name == name)
                .and_then(|r| r.address.clone()),
            HostRef::Input(key) => inputs
                .upstream
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
        .ok_or_else(|| CoreError::RemoteExecutionFailed {
            layer: layer.name.to_string(),
            environment: self.workspace.name().to_string(),
            message: "provision host has no address".to_owned(),
        })?;

        let remote = &self.pipeline.remote;
        let identity_file = match &remote.identity_file_env {
            Some(var) => Some(PathBuf::from(self.secrets.secret(var).ok_or_else(|| {
                CoreError::MissingSecret {
                    layer: layer.name.to_string(),
                    name: var.clone(),
                }
            })?)),
            None => None,
        };
        let credentials = Credentials {
            user: remote.user.clone(),
            port: remote.port,
            identity_file,
            connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
        };

        let timeout = Duration::from_secs(remote.command_timeout_secs);
        let mut plan = ProvisionPlan::new(address, credentials);
        plan.uploads.clone_from(&inputs.uploads);
        plan.scripts.clone_from(&inputs.scripts);
        plan.env.clone_from(&inputs.secrets);
        plan.blocks.clone_from(&inputs.blocks);
        plan.firewall.clone_from(&inputs.firewall);
        plan.service.clone_from(&inputs.service);
        plan.command_timeout = timeout;
        plan.retry = RetryPolicy::new(
            remote.retry_attempts,
            Duration::from_secs(remote.retry_backoff_secs),
            timeout,
        );
        Ok(plan)
    }

    fn remote_error(&self, layer: &Layer, e: RuntimeError) -> CoreError {
        let environment = self.workspace.name().to_string();
        match e {
            RuntimeError::HealthCheckExhausted {
                service,
                attempts,
                diagnostics,
            } => CoreError::HealthCheckExhausted {
                layer: layer.name.to_string(),
                environment,
                service,
                attempts,
                diagnostics,
            },
            other => CoreError::RemoteExecutionFailed {
                layer: layer.name.to_string(),
                environment,
                message: other.to_string(),
            },
        }
    }

    /// Persist a `failed` record after an apply error.
    ///
    /// A layer with no prior record and no reconciled resources leaves nothing
    /// behind. Otherwise the record keeps every handle destroy may need to reach
    /// and drops the fingerprint so the next apply re-runs.
    fn record_failure(
        &self,
        layer: &Layer,
        previous: Option<&LayerState>,
        created: Vec<ResourceRecord>,
    ) {
        let mut handles = created;
        if let Some(prev) = previous {
            for record in &prev.resource_handles {
                if !handles.iter().any(|h| h.handle == record.handle) {
                    handles.push(record.clone());
                }
            }
        }
        if previous.is_none() && handles.is_empty() {
            return;
        }

        let mut state = self.workspace.new_state(&layer.name, LayerStatus::Failed);
        state.resource_handles = handles;
        if let Err(e) = self.workspace.put(&state) {
            warn!("could not record failure of '{}': {e}", layer.name);
        }
    }

    /// Destroy resources the previous apply owned that are no longer declared.
    fn prune(&self, previous: Option<&LayerState>, current: &LayerState) -> Vec<String> {
        let Some(prev) = previous else {
            return Vec::new();
        };
        let mut warnings = Vec::new();
        for record in &prev.resource_handles {
            if current.resource_handles.iter().any(|r| r.handle == record.handle) {
                continue;
            }
            info!("removing resource '{}' no longer declared by {}", record.name, current.layer);
            match self.provider.destroy_resource(&record.handle) {
                Ok(()) | Err(RuntimeError::ResourceNotFound(_)) => {
                    if let Some(address) = &record.address {
                        if let Err(e) = self.provider.release_stable_address(address) {
                            warnings.push(format!("could not release address {address}: {e}"));
                        }
                    }
                }
                Err(e) => warnings.push(format!(
                    "could not remove undeclared resource '{}' ({}): {e}",
                    record.name, record.handle
                )),
            }
        }
        warnings
    }

    fn destroy_layer(&self, layer: &Layer, run: &mut Run) -> Result<LayerOutcome, CoreError> {
        self.hold_exclusive(run, &layer.name)?;
        let Some(state) = self.workspace.get(&layer.name)? else {
            return Ok(LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Absent));
        };

        for dependent in self.pipeline.dependents_of(&layer.name) {
            self.hold_shared(run, &dependent.name)?;
            if self.status_of(&dependent.name)? == Some(LayerStatus::Succeeded) {
                return Err(CoreError::DependentStillApplied {
                    layer: layer.name.to_string(),
                    dependent: dependent.name.to_string(),
                    environment: self.workspace.name().to_string(),
                });
            }
        }
        validate_transition(Some(state.last_status), LayerStatus::Destroyed)?;

        let mut tombstone = state.clone();
        tombstone.last_status = LayerStatus::Destroyed;
        tombstone.lock_token = Some(run.token.clone());
        let tombstone = self.workspace.put(&tombstone)?;
        info!(
            "destroying {}/{} ({} resource(s))",
            self.workspace.name(),
            layer.name,
            tombstone.resource_handles.len()
        );

        let mut remaining = tombstone.resource_handles.clone();
        let mut warnings = Vec::new();
        let total = remaining.len();
        while let Some(record) = remaining.last().cloned() {
            match self.provider.destroy_resource(&record.handle) {
                Ok(()) => {}
                Err(RuntimeError::ResourceNotFound(_)) => {
                    warnings.push(format!("resource '{}' was already gone", record.name));
                }
                Err(e) => {
                    let mut failed = tombstone.clone();
                    failed.last_status = LayerStatus::Failed;
                    failed.lock_token = None;
                    failed.outputs.clear();
                    failed.last_applied_fingerprint = None;
                    failed.resource_handles = remaining;
                    if let Err(pe) = self.workspace.put(&failed) {
                        warn!("could not record failed destroy of '{}': {pe}", layer.name);
                    }
                    return Err(e.into());
                }
            }
            if let Some(address) = &record.address {
                if let Err(e) = self.provider.release_stable_address(address) {
                    warnings.push(format!("could not release address {address}: {e}"));
                }
            }
            remaining.pop();
        }

        self.workspace.remove(&layer.name)?;
        let mut outcome = LayerOutcome::new(layer.name.as_str(), OutcomeStatus::Destroyed);
        outcome.detail = Some(format!("{total} resource(s) destroyed"));
        outcome.warnings = warnings;
        Ok(outcome)
    }
}

fn describe_apply(reason: &str, state: &LayerState, report: Option<&ProvisionReport>) -> String {
    let mut detail = format!(
        "{reason}; {} resource(s), serial {}",
        state.resource_handles.len(),
        state.serial
    );
    if let Some(r) = report {
        detail.push_str(&format!(
            "; {} upload(s), {} script(s), {} block(s) changed",
            r.uploads, r.scripts, r.blocks_changed
        ));
        if r.service_attempts > 0 {
            detail.push_str(&format!(", healthy after {} probe(s)", r.service_attempts));
        }
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_pipeline_resolves_relative_payloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/web.sh"), "true\n").unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            r#"
pipeline_version = 1

[[layer]]
name = "02-compute"
ordinal = 2

  [[layer.resource]]
  name = "web"
  kind = "instance"
  stable_address = true

  [layer.provision]
  host = "web"
  scripts = ["scripts/web.sh"]
"#,
        )
        .unwrap();
        let pipeline = load_pipeline(&path).unwrap();
        let provision = pipeline.layers[0].provision.as_ref().unwrap();
        assert_eq!(provision.scripts[0], dir.path().join("scripts/web.sh"));
    }

    #[test]
    fn run_mode_names() {
        assert_eq!(RunMode::Destroy.to_string(), "destroy");
        assert_eq!(serde_json::to_value(RunMode::Plan).unwrap(), "plan");
    }

    #[test]
    fn options_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let options = RunOptions {
            cancel: Some(flag.clone()),
            ..RunOptions::default()
        };
        assert!(!options.cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(options.cancelled());
    }
}
