use super::{
    confirm, json_pretty, redact_summary, spin_fail, spin_ok, spinner, status_cell,
    summary_exit_code, Context, EXIT_SUCCESS,
};
use strata_core::{
    load_pipeline, Orchestrator, OutcomeStatus, RunMode, RunOptions, RunSummary, WorkspaceManager,
};
use tracing::debug;

/// Flags shared by `apply` and `destroy`.
#[derive(Debug, Default)]
pub struct Flags {
    pub layers: Vec<String>,
    pub auto_approve: bool,
    pub plan_only: bool,
    pub force: bool,
}

fn orchestrator(ctx: &Context, environment: &str) -> Result<Orchestrator, String> {
    let pipeline = load_pipeline(&ctx.pipeline).map_err(|e| e.to_string())?;
    let workspace = WorkspaceManager::new(&ctx.store)
        .select(environment)
        .map_err(|e| e.to_string())?;
    if workspace.created() && !ctx.json {
        eprintln!("created workspace '{environment}'");
    }
    debug!(
        "pipeline {} loaded, store {}",
        ctx.pipeline.display(),
        ctx.store.display()
    );
    Orchestrator::with_pipeline_backends(pipeline, workspace).map_err(|e| e.to_string())
}

fn execute(
    ctx: &Context,
    orc: &Orchestrator,
    mode: RunMode,
    options: &RunOptions,
) -> Result<RunSummary, String> {
    let pb = if ctx.json {
        None
    } else {
        Some(spinner(&format!("{mode} in '{}'...", orc.workspace().name())))
    };
    match orc.run(mode, options) {
        Ok(mut summary) => {
            redact_summary(&mut summary, &orc.redactor());
            if let Some(ref pb) = pb {
                if summary.overall_succeeded {
                    spin_ok(pb, &format!("{mode} finished"));
                } else {
                    spin_fail(pb, &format!("{mode} failed"));
                }
            }
            Ok(summary)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("{mode} failed"));
            }
            Err(e.to_string())
        }
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), String> {
    if json {
        println!("{}", json_pretty(summary)?);
        return Ok(());
    }
    for outcome in &summary.layers {
        let fingerprint = outcome.fingerprint.as_deref().unwrap_or("");
        println!(
            "  {:<20} {} {:<12} {:>6}ms  {}",
            outcome.layer,
            status_cell(outcome.status.as_str(), 12),
            fingerprint,
            outcome.duration_ms,
            outcome.detail.as_deref().unwrap_or("")
        );
        for warning in &outcome.warnings {
            println!("      warning: {warning}");
        }
        if let Some(failure) = &outcome.failure {
            for (i, line) in failure.message.lines().enumerate() {
                if i == 0 {
                    println!("      error [{}]: {line}", failure.kind);
                } else {
                    println!("        {line}");
                }
            }
        }
    }
    match summary.first_failure() {
        None => println!(
            "{} succeeded in '{}' (run {})",
            summary.mode, summary.environment, summary.run_id
        ),
        Some(failed) => println!(
            "{} stopped at layer '{}' in environment '{}' (run {})",
            summary.mode, failed.layer, summary.environment, summary.run_id
        ),
    }
    Ok(())
}

pub fn plan(ctx: &Context, environment: &str, layers: Vec<String>) -> Result<u8, String> {
    let orc = orchestrator(ctx, environment)?;
    let options = RunOptions {
        targets: layers,
        ..RunOptions::default()
    };
    let summary = execute(ctx, &orc, RunMode::Plan, &options)?;
    print_summary(&summary, ctx.json)?;
    Ok(summary_exit_code(&summary))
}

pub fn apply(ctx: &Context, environment: &str, flags: Flags) -> Result<u8, String> {
    let orc = orchestrator(ctx, environment)?;
    let options = RunOptions {
        targets: flags.layers,
        force: flags.force,
        cancel: None,
    };

    if flags.plan_only || !flags.auto_approve {
        let plan = execute(ctx, &orc, RunMode::Plan, &options)?;
        if flags.plan_only || !ctx.json || !plan.overall_succeeded {
            print_summary(&plan, ctx.json)?;
        }
        if flags.plan_only || !plan.overall_succeeded {
            return Ok(summary_exit_code(&plan));
        }
        let changes = plan.count(OutcomeStatus::WouldApply) + plan.count(OutcomeStatus::Pending);
        if changes == 0 {
            if !ctx.json {
                println!("nothing to apply in '{environment}'");
            }
            return Ok(EXIT_SUCCESS);
        }
        if !confirm(
            &format!("apply {changes} layer(s) in '{environment}'?"),
            flags.auto_approve,
        )? {
            println!("apply cancelled");
            return Ok(EXIT_SUCCESS);
        }
    }

    let summary = execute(ctx, &orc, RunMode::Apply, &options)?;
    print_summary(&summary, ctx.json)?;
    Ok(summary_exit_code(&summary))
}

pub fn destroy(ctx: &Context, environment: &str, flags: Flags) -> Result<u8, String> {
    let orc = orchestrator(ctx, environment)?;
    let options = RunOptions {
        targets: flags.layers,
        ..RunOptions::default()
    };

    if flags.plan_only || !flags.auto_approve {
        let mut doomed = Vec::new();
        let selected = orc
            .pipeline()
            .select(&options.targets)
            .map_err(|e| format!("pipeline error: {e}"))?;
        for layer in selected.iter().rev() {
            if let Some(state) = orc.workspace().get(&layer.name).map_err(|e| e.to_string())? {
                doomed.push((
                    layer.name.to_string(),
                    state.last_status.to_string(),
                    state.resource_handles.len(),
                ));
            }
        }
        if ctx.json && flags.plan_only {
            let payload: Vec<_> = doomed
                .iter()
                .map(|(layer, status, resources)| {
                    serde_json::json!({"layer": layer, "status": status, "resources": resources})
                })
                .collect();
            println!("{}", json_pretty(&payload)?);
        } else if !ctx.json {
            if doomed.is_empty() {
                println!("nothing to destroy in '{environment}'");
            }
            for (layer, status, resources) in &doomed {
                println!(
                    "  {layer:<20} {} {resources} resource(s)",
                    status_cell(status, 12)
                );
            }
        }
        if flags.plan_only || doomed.is_empty() {
            return Ok(EXIT_SUCCESS);
        }
        if !confirm(
            &format!("destroy {} layer(s) in '{environment}'?", doomed.len()),
            flags.auto_approve,
        )? {
            println!("destroy cancelled");
            return Ok(EXIT_SUCCESS);
        }
    }

    let summary = execute(ctx, &orc, RunMode::Destroy, &options)?;
    print_summary(&summary, ctx.json)?;
    Ok(summary_exit_code(&summary))
}
