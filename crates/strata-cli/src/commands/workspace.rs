use super::{confirm, json_pretty, Context, EXIT_SUCCESS};
use strata_core::WorkspaceManager;

pub fn list(ctx: &Context) -> Result<u8, String> {
    let manager = WorkspaceManager::new(&ctx.store);
    let environments = manager.list().map_err(|e| e.to_string())?;

    let mut rows = Vec::with_capacity(environments.len());
    for env in &environments {
        let records = manager.record_count(&env.name).map_err(|e| e.to_string())?;
        rows.push((env, records));
    }

    if ctx.json {
        let payload: Vec<_> = rows
            .iter()
            .map(|(env, records)| {
                serde_json::json!({
                    "name": env.name,
                    "isolation_key": env.isolation_key,
                    "created_at": env.created_at,
                    "records": records,
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    if rows.is_empty() {
        println!("no environments");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<20} {:>7}  CREATED", "NAME", "RECORDS");
    for (env, records) in &rows {
        println!("{:<20} {records:>7}  {}", env.name.as_str(), env.created_at);
    }
    Ok(EXIT_SUCCESS)
}

pub fn delete(ctx: &Context, name: &str, auto_approve: bool) -> Result<u8, String> {
    let manager = WorkspaceManager::new(&ctx.store);
    // Surface a missing partition before prompting.
    manager.open(name).map_err(|e| e.to_string())?;
    let records = manager.record_count(name).map_err(|e| e.to_string())?;
    if records > 0 {
        return Err(format!(
            "environment '{name}' still holds {records} layer record(s); destroy them first"
        ));
    }
    if !confirm(&format!("delete environment '{name}'?"), auto_approve)? {
        println!("delete cancelled");
        return Ok(EXIT_SUCCESS);
    }
    manager.delete(name).map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&serde_json::json!({"deleted": name}))?);
    } else {
        println!("deleted environment '{name}'");
    }
    Ok(EXIT_SUCCESS)
}
