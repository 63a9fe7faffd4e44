//! Evidence model: the trio of read-only VCS query results collected after
//! every non-note step, plus the path parsing the gate and evaluator share.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Captured stdout of the three evidence queries, keyed stably for the run
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub git_status: String,
    pub git_diff_stat: String,
    pub git_diff_names: String,
}

impl Evidence {
    /// Human-readable block written to the output log after each step.
    pub fn format_block(&self) -> String {
        format!(
            "[evidence] git status --porcelain\n{}[evidence] git diff --stat\n{}[evidence] git diff --name-only\n{}",
            ensure_trailing_newline(&self.git_status),
            ensure_trailing_newline(&self.git_diff_stat),
            ensure_trailing_newline(&self.git_diff_names),
        )
    }
}

/// Block emitted when an evidence query fails.
pub fn format_failed_block(reason: &str) -> String {
    format!("[evidence] collection failed: {reason}\n")
}

/// Parse `diff --name-only` output into changed paths, preserving output
/// order. Blank lines are dropped; duplicates are kept (callers that need a
/// set deduplicate themselves).
pub fn parse_name_only(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sorted, deduplicated changed-path list for the decision gate.
pub fn changed_paths_sorted(output: &str) -> Vec<String> {
    let mut paths = parse_name_only(output);
    paths.sort();
    paths.dedup();
    paths
}

/// Paths whose basename matches one of the dependency-file basenames.
///
/// Basename equality only: `vendor/package.json` matches just like a
/// top-level `package.json`.
pub fn dependency_files(paths: &[String], basenames: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|path| {
            Path::new(path)
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| basenames.iter().any(|b| b == name))
        })
        .cloned()
        .collect()
}

fn ensure_trailing_newline(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_only_in_order() {
        let out = "src/b.rs\nsrc/a.rs\n\nsrc/b.rs\n";
        assert_eq!(
            parse_name_only(out),
            vec!["src/b.rs", "src/a.rs", "src/b.rs"]
        );
    }

    #[test]
    fn sorted_paths_are_deduplicated() {
        let out = "src/b.rs\nsrc/a.rs\nsrc/b.rs\n";
        assert_eq!(changed_paths_sorted(out), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn dependency_match_is_basename_equality() {
        let basenames = vec![
            "package.json".to_string(),
            "package-lock.json".to_string(),
            "yarn.lock".to_string(),
            "pnpm-lock.yaml".to_string(),
        ];
        let paths = vec![
            "package.json".to_string(),
            "vendor/deep/yarn.lock".to_string(),
            "src/package.json.bak".to_string(),
            "src/main.rs".to_string(),
        ];
        assert_eq!(
            dependency_files(&paths, &basenames),
            vec!["package.json", "vendor/deep/yarn.lock"]
        );
    }

    #[test]
    fn block_keeps_fixed_section_order() {
        let evidence = Evidence {
            git_status: " M a.rs".to_string(),
            git_diff_stat: " a.rs | 1 +\n".to_string(),
            git_diff_names: "a.rs\n".to_string(),
        };
        let block = evidence.format_block();
        let status_at = block.find("git status --porcelain").expect("status");
        let stat_at = block.find("git diff --stat").expect("stat");
        let names_at = block.find("git diff --name-only").expect("names");
        assert!(status_at < stat_at && stat_at < names_at);
    }
}
