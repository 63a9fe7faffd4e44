//! Git adapter for the evidence queries.
//!
//! The orchestrator never mutates the working tree itself; this wrapper only
//! issues the read-only queries that back evidence collection and the
//! repository preflight.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::evidence::Evidence;

/// Wrapper for executing git queries in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True iff the workdir holds a `.git` directory (not a file or link
    /// target elsewhere).
    pub fn is_repository(&self) -> bool {
        self.workdir.join(".git").is_dir()
    }

    /// Run the three evidence queries in fixed order.
    ///
    /// On the first non-zero exit the reason is returned as `Err`; partial
    /// evidence is never reported.
    #[instrument(skip_all)]
    pub fn collect_evidence(&self) -> Result<Evidence, String> {
        let git_status = self.query(&["status", "--porcelain"])?;
        let git_diff_stat = self.query(&["diff", "--stat"])?;
        let git_diff_names = self.query(&["diff", "--name-only"])?;
        debug!(
            status_len = git_status.len(),
            names_len = git_diff_names.len(),
            "evidence collected"
        );
        Ok(Evidence {
            git_status,
            git_diff_stat,
            git_diff_names,
        })
    }

    /// Fresh `diff --name-only` stdout, used for executor-step baselines.
    pub fn diff_name_only(&self) -> Result<String, String> {
        self.query(&["diff", "--name-only"])
    }

    fn query(&self, args: &[&str]) -> Result<String, String> {
        let output = self
            .run(args)
            .map_err(|err| format!("git {}: {err}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "git {} exited {}: {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn recognizes_a_repository() {
        let repo = TestRepo::new().expect("repo");
        assert!(Git::new(repo.root()).is_repository());

        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repository());
    }

    #[test]
    fn collects_evidence_from_clean_tree() {
        let repo = TestRepo::new().expect("repo");
        let evidence = Git::new(repo.root()).collect_evidence().expect("evidence");
        assert_eq!(evidence.git_status, "");
        assert_eq!(evidence.git_diff_names, "");
    }

    #[test]
    fn sees_modified_tracked_file() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("src/lib.rs", "pub fn a() {}\n").expect("commit");
        repo.write_file("src/lib.rs", "pub fn a() {}\npub fn b() {}\n")
            .expect("write");

        let evidence = Git::new(repo.root()).collect_evidence().expect("evidence");
        assert!(evidence.git_status.contains("src/lib.rs"));
        assert!(evidence.git_diff_names.contains("src/lib.rs"));
        assert!(evidence.git_diff_stat.contains("src/lib.rs"));
    }

    #[test]
    fn fails_outside_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Git::new(temp.path()).collect_evidence().unwrap_err();
        assert!(err.contains("git status"), "got {err}");
    }
}
