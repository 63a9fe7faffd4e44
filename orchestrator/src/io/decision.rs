//! Pending-decision bookkeeping for the dependency gate.
//!
//! One process-wide map from run id to pending request. Synchronous waits
//! ride a one-shot channel; deferred (autobuild) requests outlive the run
//! and are merged straight into `run.json` when the decision arrives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::io::run_store::{DecisionRecord, load_record, write_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionResult {
    Approved,
    Rejected,
}

impl DecisionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionResult::Approved => "approved",
            DecisionResult::Rejected => "rejected",
        }
    }
}

struct PendingDecision {
    files: Vec<String>,
    run_dir: PathBuf,
    /// Present in synchronous mode; the waiting run executor holds the
    /// receiver. Absent for deferred requests.
    waiter: Option<Sender<DecisionResult>>,
}

/// Process-wide map of pending decisions.
#[derive(Default)]
pub struct DecisionMap {
    pending: Mutex<HashMap<String, PendingDecision>>,
}

impl DecisionMap {
    /// Register a synchronous request; the caller blocks on the returned
    /// receiver until the decision is delivered or the run is cancelled.
    pub fn register_wait(
        &self,
        run_id: &str,
        files: Vec<String>,
        run_dir: &Path,
    ) -> Receiver<DecisionResult> {
        let (tx, rx) = channel();
        self.insert(run_id, files, run_dir, Some(tx));
        rx
    }

    /// Register a deferred request and return immediately.
    pub fn register_pending(&self, run_id: &str, files: Vec<String>, run_dir: &Path) {
        self.insert(run_id, files, run_dir, None);
    }

    /// Deliver a decision. Returns false when no request is pending for the
    /// run. Synchronous waiters are woken; deferred requests are merged into
    /// the finalized record on disk.
    pub fn submit(&self, run_id: &str, result: DecisionResult) -> bool {
        let Some(entry) = self.remove(run_id) else {
            return false;
        };
        debug!(run_id, result = result.as_str(), "decision delivered");
        match entry.waiter {
            Some(waiter) => {
                // The run executor owns the record while it waits.
                let _ = waiter.send(result);
            }
            None => merge_into_record(&entry.run_dir, result, entry.files),
        }
        true
    }

    /// Resolve a pending request as rejected because the run is being
    /// cancelled. Returns true when a request was pending.
    pub fn reject_for_cancel(&self, run_id: &str) -> bool {
        let Some(entry) = self.remove(run_id) else {
            return false;
        };
        debug!(run_id, "pending decision rejected by cancel");
        match entry.waiter {
            Some(waiter) => {
                let _ = waiter.send(DecisionResult::Rejected);
            }
            None => merge_into_record(&entry.run_dir, DecisionResult::Rejected, entry.files),
        }
        true
    }

    /// Drop a request that the run completed without (sync-mode cleanup).
    pub fn clear(&self, run_id: &str) {
        self.remove(run_id);
    }

    /// Files awaiting a decision for the run, if any.
    pub fn pending_files(&self, run_id: &str) -> Option<Vec<String>> {
        let pending = self.lock();
        pending.get(run_id).map(|entry| entry.files.clone())
    }

    fn insert(&self, run_id: &str, files: Vec<String>, run_dir: &Path, waiter: Option<Sender<DecisionResult>>) {
        let mut pending = self.lock();
        pending.insert(
            run_id.to_string(),
            PendingDecision {
                files,
                run_dir: run_dir.to_path_buf(),
                waiter,
            },
        );
    }

    fn remove(&self, run_id: &str) -> Option<PendingDecision> {
        self.lock().remove(run_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingDecision>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn merge_into_record(run_dir: &Path, result: DecisionResult, files: Vec<String>) {
    let record = match load_record(run_dir) {
        Ok(record) => record,
        Err(err) => {
            warn!(dir = %run_dir.display(), error = %err, "decision merge: record unreadable");
            return;
        }
    };
    let mut record = record;
    record.decision = Some(DecisionRecord::dependency_change(
        result.as_str(),
        files,
        Utc::now().to_rfc3339(),
    ));
    if let Err(err) = write_record(run_dir, &record) {
        warn!(dir = %run_dir.display(), error = %err, "decision merge: write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::run_store::{PlanSummary, RunRecord};

    fn seeded_record(dir: &Path, run_id: &str) {
        let record = RunRecord {
            run_id: run_id.to_string(),
            workspace_path: "/tmp/ws".to_string(),
            requirement: None,
            start_time: "2026-08-02T12:00:00Z".to_string(),
            end_time: Some("2026-08-02T12:00:09Z".to_string()),
            plan: PlanSummary {
                name: "p".to_string(),
                steps_count: 1,
            },
            steps: Vec::new(),
            evidence: None,
            exit_code: Some(0),
            blocked_by_policy: false,
            timeout: false,
            cancelled: false,
            cancelled_by_decision: false,
            decision_pending: true,
            decision: None,
        };
        write_record(dir, &record).expect("seed record");
    }

    #[test]
    fn synchronous_submit_wakes_the_waiter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let map = DecisionMap::default();
        let rx = map.register_wait("run-1", vec!["package.json".to_string()], temp.path());

        assert!(map.submit("run-1", DecisionResult::Approved));
        assert_eq!(rx.recv().expect("decision"), DecisionResult::Approved);
        assert!(map.pending_files("run-1").is_none());
    }

    #[test]
    fn cancel_resolves_waiter_as_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let map = DecisionMap::default();
        let rx = map.register_wait("run-1", vec!["yarn.lock".to_string()], temp.path());

        assert!(map.reject_for_cancel("run-1"));
        assert_eq!(rx.recv().expect("decision"), DecisionResult::Rejected);
    }

    #[test]
    fn unknown_run_id_is_refused() {
        let map = DecisionMap::default();
        assert!(!map.submit("run-missing", DecisionResult::Approved));
        assert!(!map.reject_for_cancel("run-missing"));
    }

    #[test]
    fn deferred_submit_merges_into_finalized_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        seeded_record(temp.path(), "run-1");
        let map = DecisionMap::default();
        map.register_pending("run-1", vec!["package.json".to_string()], temp.path());

        assert!(map.submit("run-1", DecisionResult::Approved));
        let record = load_record(temp.path()).expect("load");
        let decision = record.decision.expect("decision merged");
        assert_eq!(decision.result, "approved");
        assert_eq!(decision.kind, "dependency_change");
        assert_eq!(decision.files, vec!["package.json"]);
    }
}
