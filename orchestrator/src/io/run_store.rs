//! Append-only on-disk run store.
//!
//! Each run owns `<runs-root>/<run_id>/` with two artifacts: `run.json`,
//! rewritten atomically after every mutation, and `output.log`, an
//! append-only stream of child output and system lines.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::evaluate::Evaluation;
use crate::core::evidence::Evidence;

const APP_DIR: &str = "ai-dev-orchestrator";

/// Platform runs root: `<user data dir>/ai-dev-orchestrator/data/runs`.
pub fn default_runs_root() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .context("resolve user data directory")?;
    Ok(base.join(APP_DIR).join("data").join("runs"))
}

/// Ensure the runs root exists, creating it if missing.
pub fn ensure_runs_root(root: &Path) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("create runs root {}", root.display()))
}

/// Generate a run id from the wall clock.
///
/// Fixed-width UTC timestamp with nanosecond precision, so ids sort
/// lexicographically in creation order and are unique per process.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%dT%H%M%S%.9fZ"))
}

/// Summary of the plan a run executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub name: String,
    #[serde(rename = "stepsCount")]
    pub steps_count: usize,
}

/// Decision merged into the record once delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub result: String,
    pub timestamp: String,
    pub files: Vec<String>,
}

impl DecisionRecord {
    pub fn dependency_change(result: &str, files: Vec<String>, timestamp: String) -> Self {
        Self {
            kind: "dependency_change".to_string(),
            result: result.to_string(),
            timestamp,
            files,
        }
    }
}

/// Per-step record appended as the run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the plan.
    pub step_index: usize,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timeout: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub blocked_by_policy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    /// Reason evidence collection failed after this step, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_error: Option<String>,
}

impl StepRecord {
    pub fn new(step_index: usize, step_type: &str) -> Self {
        Self {
            step_index,
            step_type: step_type.to_string(),
            message: None,
            command: None,
            tool: None,
            instructions_length: None,
            started_at: None,
            ended_at: None,
            exit_code: None,
            cancelled: false,
            timeout: false,
            blocked_by_policy: false,
            evaluation: None,
            evidence: None,
            evidence_error: None,
        }
    }
}

/// The run record persisted at `<runs-root>/<run_id>/run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(rename = "workspacePath")]
    pub workspace_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: String,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub plan: PlanSummary,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub blocked_by_policy: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub timeout: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled_by_decision: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub decision_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionRecord>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Directory of a single run under the runs root.
pub fn run_dir(root: &Path, run_id: &str) -> PathBuf {
    root.join(run_id)
}

/// Atomically rewrite `run.json` (temp sibling + rename).
pub fn write_record(dir: &Path, record: &RunRecord) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create run dir {}", dir.display()))?;
    let path = dir.join("run.json");
    let mut buf = serde_json::to_string_pretty(record)?;
    buf.push('\n');
    let tmp_path = dir.join("run.json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Load a run record from a run directory.
pub fn load_record(dir: &Path) -> Result<RunRecord> {
    let path = dir.join("run.json");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let record: RunRecord =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(record)
}

/// Append-only handle on `output.log`, shareable across the reader threads
/// that stream child output.
#[derive(Clone)]
pub struct OutputLog {
    inner: Arc<Mutex<File>>,
}

impl OutputLog {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create run dir {}", dir.display()))?;
        let path = dir.join("output.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// Append text verbatim. Log failures are reported, not fatal: a broken
    /// log must not kill a running child.
    pub fn append(&self, text: &str) {
        let mut file = match self.inner.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = file.write_all(text.as_bytes()) {
            warn!(error = %err, "output.log append failed");
        }
    }
}

/// Run directories under the root, newest first by modification time.
pub fn list_run_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((path, modified));
    }
    entries.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(entries.into_iter().map(|(path, _)| path).collect())
}

/// The most recent run record, if any directory holds a readable one.
pub fn latest_record(root: &Path) -> Option<RunRecord> {
    let dirs = list_run_dirs(root).ok()?;
    for dir in dirs {
        match load_record(&dir) {
            Ok(record) => return Some(record),
            Err(err) => debug!(dir = %dir.display(), error = %err, "skipping unreadable run"),
        }
    }
    None
}
