//! Test-only fixtures: a disposable git repository, scripted seams for the
//! completion endpoint and the executor tool, and an event-collecting sink.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::core::plan::ExecutorToolKind;
use crate::io::completion::{CompletionClient, CompletionError};
use crate::io::events::{Event, EventSink};
use crate::io::executor_tool::{ExecutorTool, ToolContext};
use crate::io::process::ChildOutcome;

/// A real git repository in a tempdir with committed identity, so evidence
/// queries and grep probes behave exactly as they do in production.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.commit_file("README.md", "seed\n")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Write a file and commit it, leaving the tree clean.
    pub fn commit_file(&self, rel: &str, contents: &str) -> Result<()> {
        self.write_file(rel, contents)?;
        self.git(&["add", rel])?;
        self.git(&["commit", "-q", "-m", &format!("add {rel}")])
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Sink that records every event for order and payload assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink lock").clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("sink lock").push(event);
    }
}

/// One scripted executor-tool invocation.
pub struct ScriptedCall {
    pub exit_code: i32,
    /// Files written into the workspace when the call runs.
    pub files: Vec<(String, String)>,
}

impl ScriptedCall {
    pub fn clean() -> Self {
        Self {
            exit_code: 0,
            files: Vec::new(),
        }
    }

    pub fn writing(rel: &str, contents: &str) -> Self {
        Self {
            exit_code: 0,
            files: vec![(rel.to_string(), contents.to_string())],
        }
    }
}

/// Executor tool that replays scripted calls instead of spawning codex.
///
/// Each `exec` consumes one scripted call (defaulting to a clean no-op when
/// the script runs dry); `apply` always succeeds. Instructions are recorded
/// so tests can assert on retry prompts.
pub struct ScriptedTool {
    calls: Mutex<VecDeque<ScriptedCall>>,
    instructions_seen: Mutex<Vec<String>>,
}

impl ScriptedTool {
    pub fn new(calls: Vec<ScriptedCall>) -> Self {
        Self {
            calls: Mutex::new(calls.into()),
            instructions_seen: Mutex::new(Vec::new()),
        }
    }

    /// Tool whose every call exits 0 without touching the tree.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Tool whose first call writes the given files.
    pub fn mutating(files: Vec<(String, String)>) -> Self {
        Self::new(vec![ScriptedCall {
            exit_code: 0,
            files,
        }])
    }

    pub fn instructions_seen(&self) -> Vec<String> {
        self.instructions_seen.lock().expect("tool lock").clone()
    }
}

impl ExecutorTool for ScriptedTool {
    fn exec(&self, ctx: &ToolContext<'_>, instructions: &str) -> ChildOutcome {
        self.instructions_seen
            .lock()
            .expect("tool lock")
            .push(instructions.to_string());
        let call = self
            .calls
            .lock()
            .expect("tool lock")
            .pop_front()
            .unwrap_or_else(ScriptedCall::clean);
        for (rel, contents) in &call.files {
            let path = ctx.workspace.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create scripted dir");
            }
            std::fs::write(&path, contents).expect("write scripted file");
        }
        ChildOutcome {
            exit_code: call.exit_code,
            ..ChildOutcome::default()
        }
    }

    fn apply(&self, _ctx: &ToolContext<'_>) -> ChildOutcome {
        ChildOutcome::default()
    }

    fn kind(&self) -> ExecutorToolKind {
        ExecutorToolKind::Codex
    }
}

/// Captured (system, user) prompt pair.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub system: String,
    pub user: String,
}

/// Completion client replaying scripted responses.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<String, CompletionError>>>,
    requests: Mutex<Vec<CapturedRequest>>,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().expect("completion lock").clone()
    }
}

impl CompletionClient for ScriptedCompletion {
    fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        self.requests.lock().expect("completion lock").push(CapturedRequest {
            system: system.to_string(),
            user: user.to_string(),
        });
        self.responses
            .lock()
            .expect("completion lock")
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Upstream("script exhausted".to_string())))
    }
}
