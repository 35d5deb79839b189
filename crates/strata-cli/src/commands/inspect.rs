use super::{colorize_status, display_value, json_pretty, redact_outputs, Context, EXIT_SUCCESS};
use strata_core::WorkspaceManager;
use strata_schema::Fingerprint;

pub fn run(ctx: &Context, environment: &str, layer: &str) -> Result<u8, String> {
    let workspace = WorkspaceManager::new(&ctx.store)
        .open(environment)
        .map_err(|e| e.to_string())?;
    let Some(mut state) = workspace.get(layer).map_err(|e| e.to_string())? else {
        return Err(format!(
            "layer '{layer}' has no record in environment '{environment}'"
        ));
    };
    state.outputs = redact_outputs(&state.outputs, &ctx.redactor());

    if ctx.json {
        println!("{}", json_pretty(&state)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("layer:       {}", state.layer);
    println!("environment: {}", state.environment);
    println!("status:      {}", colorize_status(&state.last_status.to_string()));
    println!("serial:      {}", state.serial);
    println!(
        "fingerprint: {}",
        state
            .last_applied_fingerprint
            .as_ref()
            .map_or("-", Fingerprint::as_str)
    );
    println!("updated:     {}", state.updated_at);
    if let Some(token) = &state.lock_token {
        println!("lock token:  {token}");
    }

    if state.resource_handles.is_empty() {
        println!("resources:   none");
    } else {
        println!("resources:");
        println!("  {:<16} {:<12} {:<40} ADDRESS", "NAME", "KIND", "HANDLE");
        for record in &state.resource_handles {
            println!(
                "  {:<16} {:<12} {:<40} {}",
                record.name,
                record.kind,
                record.handle.as_str(),
                record.address.as_deref().unwrap_or("-")
            );
        }
    }

    if state.outputs.is_empty() {
        println!("outputs:     none");
    } else {
        println!("outputs:");
        for (key, value) in &state.outputs {
            println!("  {key} = {}", display_value(value));
        }
    }
    Ok(EXIT_SUCCESS)
}
