use super::{json_pretty, redact_outputs, status_cell, Context, EXIT_SUCCESS};
use strata_core::{load_pipeline, WorkspaceManager};
use strata_schema::Fingerprint;
use strata_store::list_runs;

pub fn run(ctx: &Context, environment: &str) -> Result<u8, String> {
    let workspace = WorkspaceManager::new(&ctx.store)
        .open(environment)
        .map_err(|e| e.to_string())?;
    let redactor = ctx.redactor();

    let mut states = workspace.list().map_err(|e| e.to_string())?;
    for state in &mut states {
        state.outputs = redact_outputs(&state.outputs, &redactor);
    }

    // Layers declared in the pipeline but never applied show as absent.
    let mut absent = Vec::new();
    if let Ok(pipeline) = load_pipeline(&ctx.pipeline) {
        for layer in &pipeline.layers {
            if !states.iter().any(|s| s.layer == layer.name) {
                absent.push(layer.name.to_string());
            }
        }
    }

    let last_run = list_runs(workspace.layout(), environment)
        .map_err(|e| e.to_string())?
        .pop();

    if ctx.json {
        let payload = serde_json::json!({
            "environment": environment,
            "isolation_key": workspace.isolation_key(),
            "last_run": last_run,
            "layers": states,
            "absent": absent,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("environment '{environment}' ({})", workspace.isolation_key());
    if let Some(run_id) = &last_run {
        println!("last run: {run_id}");
    }
    if states.is_empty() && absent.is_empty() {
        println!("no layer records");
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<20} {:<12} {:>6} {:<12} {:>9}  UPDATED",
        "LAYER", "STATUS", "SERIAL", "FINGERPRINT", "RESOURCES"
    );
    for state in &states {
        let fingerprint = state
            .last_applied_fingerprint
            .as_ref()
            .map_or("-", Fingerprint::short);
        let locked = if state.lock_token.is_some() { " (locked)" } else { "" };
        println!(
            "{:<20} {} {:>6} {:<12} {:>9}  {}{locked}",
            state.layer.as_str(),
            status_cell(&state.last_status.to_string(), 12),
            state.serial,
            fingerprint,
            state.resource_handles.len(),
            state.updated_at,
        );
    }
    for layer in &absent {
        println!("{layer:<20} {} {:>6} {:<12} {:>9}", status_cell("absent", 12), "-", "-", 0);
    }
    Ok(EXIT_SUCCESS)
}
