// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-job artifact tree: the contract files plus the append-only run log.

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Create (if absent) and return the artifact directory for a job.
pub fn ensure_job_artifact_dir(root: &str, job_id: &str) -> std::io::Result<PathBuf> {
    let dir = Path::new(root).join(job_id);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Create an empty file for every contract name that does not exist yet.
pub fn ensure_contract(dir: &Path, contract: &[String]) -> std::io::Result<()> {
    for name in contract {
        let target = dir.join(name);
        if !target.exists() {
            fs::write(&target, b"")?;
        }
    }
    Ok(())
}

/// Overwrite `path` with `content`, creating parents as needed.
pub fn write_text(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Read a text artifact, treating a missing file as empty.
pub fn read_text(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Append one JSON record (plus newline) to a `.jsonl` file.
pub fn append_jsonl(path: &Path, record: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")
}

/// Append a run-log record with the standard timestamp field. Logging must
/// never fail the job, so errors are swallowed after a trace.
pub fn log_run_event(run_log: &Path, event: &str, extra: serde_json::Value) {
    let mut record = serde_json::json!({
        "ts": Utc::now().to_rfc3339(),
        "event": event,
    });
    if let (Some(target), serde_json::Value::Object(fields)) = (record.as_object_mut(), extra) {
        for (key, value) in fields {
            target.insert(key, value);
        }
    }
    if let Err(err) = append_jsonl(run_log, &record) {
        tracing::warn!(error = %err, path = %run_log.display(), "failed to append run log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_files_are_created_empty_once() {
        let tmp = tempfile::tempdir().unwrap();
        let contract: Vec<String> = vec!["plan.md".into(), "run.jsonl".into()];
        ensure_contract(tmp.path(), &contract).unwrap();
        assert_eq!(read_text(&tmp.path().join("plan.md")), "");

        write_text(&tmp.path().join("plan.md"), "kept").unwrap();
        ensure_contract(tmp.path(), &contract).unwrap();
        assert_eq!(read_text(&tmp.path().join("plan.md")), "kept");
    }

    #[test]
    fn run_log_records_are_line_delimited_json() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.jsonl");
        log_run_event(&log, "job_start", serde_json::json!({"job_id": "x"}));
        log_run_event(&log, "stage_start", serde_json::json!({"stage": "triage"}));

        let raw = read_text(&log);
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "job_start");
        assert_eq!(first["job_id"], "x");
        assert!(first["ts"].is_string());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["stage"], "triage");
    }

    #[test]
    fn artifact_dir_is_partitioned_by_job() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().to_string();
        let a = ensure_job_artifact_dir(&root, "job-a").unwrap();
        let b = ensure_job_artifact_dir(&root, "job-b").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir());
        assert!(b.is_dir());
    }
}
