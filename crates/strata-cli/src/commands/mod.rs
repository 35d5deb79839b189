pub mod completions;
pub mod init;
pub mod inspect;
pub mod run;
pub mod status;
pub mod workspace;

use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{stderr, stdin, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;
use strata_core::{load_pipeline, pipeline_redactor, FailureKind, ProcessEnv, RunSummary};
use strata_runtime::Redactor;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PIPELINE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Global flags shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub store: PathBuf,
    pub pipeline: PathBuf,
    pub json: bool,
}

impl Context {
    /// Redactor for the pipeline's declared secrets, if the pipeline can be read.
    pub fn redactor(&self) -> Redactor {
        match load_pipeline(&self.pipeline) {
            Ok(pipeline) => pipeline_redactor(&pipeline, &ProcessEnv),
            Err(_) => Redactor::default(),
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "applied" | "succeeded" | "destroyed" => Style::new().green().apply_to(status).to_string(),
        "would_apply" => Style::new().cyan().bold().apply_to(status).to_string(),
        "pending" => Style::new().yellow().apply_to(status).to_string(),
        "failed" | "cancelled" => Style::new().red().bold().apply_to(status).to_string(),
        "unchanged" | "absent" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// Coloured status padded to `width` visible columns.
pub fn status_cell(status: &str, width: usize) -> String {
    let pad = width.saturating_sub(status.chars().count());
    format!("{}{}", colorize_status(status), " ".repeat(pad))
}

/// Ask before a mutating command. Non-interactive sessions must pass `--auto-approve`.
pub fn confirm(prompt: &str, auto_approve: bool) -> Result<bool, String> {
    if auto_approve {
        return Ok(true);
    }
    if !stdin().is_terminal() || !stderr().is_terminal() {
        return Err("refusing to continue without confirmation (pass --auto-approve)".to_owned());
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))
}

/// Exit code for a run that did not fully succeed.
pub fn summary_exit_code(summary: &RunSummary) -> u8 {
    if summary.overall_succeeded {
        return EXIT_SUCCESS;
    }
    match summary
        .first_failure()
        .and_then(|o| o.failure.as_ref())
        .map(|f| f.kind)
    {
        Some(FailureKind::Configuration) => EXIT_PIPELINE_ERROR,
        Some(FailureKind::LockContention | FailureKind::Store) => EXIT_STORE_ERROR,
        _ => EXIT_FAILURE,
    }
}

/// Redact secret values out of everything a summary will print.
pub fn redact_summary(summary: &mut RunSummary, redactor: &Redactor) {
    for outcome in &mut summary.layers {
        if let Some(detail) = &mut outcome.detail {
            *detail = redactor.redact(detail);
        }
        for warning in &mut outcome.warnings {
            *warning = redactor.redact(warning);
        }
        if let Some(failure) = &mut outcome.failure {
            failure.message = redactor.redact(&failure.message);
        }
    }
}

pub fn redact_outputs(outputs: &BTreeMap<String, Value>, redactor: &Redactor) -> BTreeMap<String, Value> {
    outputs
        .iter()
        .map(|(k, v)| (k.clone(), redact_value(v, redactor)))
        .collect()
}

fn redact_value(value: &Value, redactor: &Redactor) -> Value {
    match value {
        Value::String(s) => Value::String(redactor.redact(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(v, redactor)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v, redactor)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a value for a one-line table cell.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
