use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One line of a run log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: String,
        environment: String,
        mode: String,
        started_at: String,
        layers: Vec<String>,
    },
    LayerOutcome {
        layer: String,
        status: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
        at: String,
    },
    Finished {
        overall_succeeded: bool,
        finished_at: String,
        summary: serde_json::Value,
    },
}

/// Append-only JSON-lines log of one orchestrator invocation.
pub struct RunLog {
    run_id: String,
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn create(layout: &StoreLayout, environment: &str, mode: &str) -> Result<Self, StoreError> {
        let now = chrono::Utc::now();
        let seed = format!(
            "{environment}:{mode}:{}:{}",
            now.timestamp_nanos_opt().unwrap_or_default(),
            std::process::id()
        );
        let run_id = format!(
            "{}-{}",
            now.format("%Y%m%dT%H%M%S%3fZ"),
            &blake3::hash(seed.as_bytes()).to_hex()[..8]
        );

        let dir = layout.runs_dir(environment);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        debug!("run log {run_id} opened for {environment} ({mode})");

        Ok(Self { run_id, path, file })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &RunEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Run ids recorded for an environment, oldest first.
pub fn list_runs(layout: &StoreLayout, environment: &str) -> Result<Vec<String>, StoreError> {
    let dir = layout.runs_dir(environment);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "jsonl") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_owned());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Read every event of a run. A torn final line from an interrupted run is skipped.
pub fn read_run(
    layout: &StoreLayout,
    environment: &str,
    run_id: &str,
) -> Result<Vec<RunEvent>, StoreError> {
    let path = layout.runs_dir(environment).join(format!("{run_id}.jsonl"));
    let reader = BufReader::new(File::open(&path)?);
    let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(e) if i == last => {
                warn!("ignoring truncated last line of run {run_id}: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: &str) -> RunEvent {
        RunEvent::Started {
            run_id: run_id.to_owned(),
            environment: "dev".to_owned(),
            mode: "apply".to_owned(),
            started_at: "2026-01-01T00:00:00Z".to_owned(),
            layers: vec!["01-core".to_owned()],
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        let mut log = RunLog::create(&layout, "dev", "apply").unwrap();
        let id = log.run_id().to_owned();
        log.append(&started(&id)).unwrap();
        log.append(&RunEvent::LayerOutcome {
            layer: "01-core".to_owned(),
            status: "applied".to_owned(),
            duration_ms: 12,
            detail: None,
            fingerprint: Some("abc".to_owned()),
            at: "2026-01-01T00:00:01Z".to_owned(),
        })
        .unwrap();
        log.append(&RunEvent::Finished {
            overall_succeeded: true,
            finished_at: "2026-01-01T00:00:02Z".to_owned(),
            summary: serde_json::json!({ "overall_succeeded": true }),
        })
        .unwrap();

        let events = read_run(&layout, "dev", &id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], started(&id));
        assert!(matches!(
            events[2],
            RunEvent::Finished {
                overall_succeeded: true,
                ..
            }
        ));
        assert_eq!(list_runs(&layout, "dev").unwrap(), vec![id]);
        assert!(list_runs(&layout, "staging").unwrap().is_empty());
    }

    #[test]
    fn lines_are_tagged_json() {
        let line = serde_json::to_string(&started("r1")).unwrap();
        assert!(line.starts_with(r#"{"event":"started""#));
    }

    #[test]
    fn torn_last_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let mut log = RunLog::create(&layout, "dev", "destroy").unwrap();
        let id = log.run_id().to_owned();
        log.append(&started(&id)).unwrap();
        let mut raw = OpenOptions::new().append(true).open(log.path()).unwrap();
        raw.write_all(br#"{"event":"layer_out"#).unwrap();

        let events = read_run(&layout, "dev", &id).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn run_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let a = RunLog::create(&layout, "dev", "plan").unwrap();
        let b = RunLog::create(&layout, "dev", "plan").unwrap();
        assert_ne!(a.run_id(), b.run_id());
    }
}
