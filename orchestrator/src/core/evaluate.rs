//! Post-executor evaluation: compare the working tree against a pre-step
//! baseline and classify the outcome.

use serde::{Deserialize, Serialize};

/// Evaluation attached to an executor step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Paths changed by this step (current minus baseline, current order).
    pub changed_files: Vec<String>,
    pub has_changes: bool,
    /// Executor exited 0 yet produced no new changes.
    pub suspicious_no_change: bool,
    /// Suspicious, and the preceding content-search probe already found the
    /// requested content.
    pub no_op: bool,
    /// The single-shot retry policy was invoked.
    pub retried: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_result: Option<RetryResult>,
}

/// Baseline-diff record of the retried attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryResult {
    pub changed_files: Vec<String>,
    pub has_changes: bool,
}

/// Set difference `current \ baseline`, preserving `current` order.
pub fn changed_since(baseline: &[String], current: &[String]) -> Vec<String> {
    current
        .iter()
        .filter(|path| !baseline.contains(path))
        .cloned()
        .collect()
}

/// Classify an executor step. `retried` starts false; the run executor fills
/// in the retry fields if it invokes the retry policy.
pub fn classify(exit_code: i32, changed_files: Vec<String>, precheck_hit: bool) -> Evaluation {
    let has_changes = !changed_files.is_empty();
    let suspicious_no_change = exit_code == 0 && !has_changes;
    Evaluation {
        changed_files,
        has_changes,
        suspicious_no_change,
        no_op: suspicious_no_change && precheck_hit,
        retried: false,
        retry_result: None,
    }
}

/// Fixed instruction prompt for the single-shot retry.
///
/// Asks for a real, minimal diff and forbids dependency-file edits. The
/// optional focus hint narrows where the change should land.
pub fn retry_instructions(focus_hint: Option<&str>) -> String {
    let mut text = String::from(
        "The previous attempt exited successfully but produced no diff. \
         Apply the smallest real change that satisfies the instructions: \
         modify existing files, do not touch package manager files \
         (package.json, lock files), and do not duplicate existing UI or logic.",
    );
    if let Some(hint) = focus_hint {
        text.push_str(&format!(" Focus the change on {hint}."));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn changed_since_preserves_current_order() {
        let baseline = paths(&["a.rs", "b.rs"]);
        let current = paths(&["c.rs", "a.rs", "d.rs"]);
        assert_eq!(changed_since(&baseline, &current), paths(&["c.rs", "d.rs"]));
    }

    #[test]
    fn changed_since_empty_when_nothing_new() {
        let baseline = paths(&["a.rs"]);
        assert_eq!(changed_since(&baseline, &baseline), Vec::<String>::new());
    }

    #[test]
    fn zero_exit_with_changes_is_clean() {
        let eval = classify(0, paths(&["a.rs"]), false);
        assert!(eval.has_changes);
        assert!(!eval.suspicious_no_change);
        assert!(!eval.no_op);
    }

    #[test]
    fn zero_exit_without_changes_is_suspicious() {
        let eval = classify(0, Vec::new(), false);
        assert!(eval.suspicious_no_change);
        assert!(!eval.no_op);
        assert!(!eval.retried);
    }

    #[test]
    fn no_op_requires_precheck_hit() {
        let eval = classify(0, Vec::new(), true);
        assert!(eval.suspicious_no_change);
        assert!(eval.no_op);
    }

    #[test]
    fn nonzero_exit_is_never_suspicious() {
        let eval = classify(1, Vec::new(), true);
        assert!(!eval.suspicious_no_change);
        assert!(!eval.no_op);
    }

    #[test]
    fn retry_instructions_mention_focus_hint() {
        let text = retry_instructions(Some("src/ui/render.rs"));
        assert!(text.contains("src/ui/render.rs"));
        assert!(retry_instructions(None).contains("smallest real change"));
    }
}
