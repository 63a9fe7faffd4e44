//! Executor-tool launcher.
//!
//! The tool is a two-phase actor: `exec` proposes a change, `apply` lands
//! it. Both phases run detached (group leader) so a kill reaches whatever
//! the tool spawned underneath. The [`ExecutorTool`] trait decouples the
//! run executor from the real binary; tests use scripted tools that mutate
//! a fixture tree instead of spawning processes.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::core::plan::ExecutorToolKind;
use crate::io::events::EventSink;
use crate::io::process::{ChildOutcome, OutputPrefix, RUN_TIMEOUT, SpawnSpec, supervise};
use crate::io::run_store::OutputLog;

/// Everything a tool invocation needs from the surrounding run.
pub struct ToolContext<'a> {
    pub run_id: &'a str,
    pub workspace: &'a Path,
    pub cancel: &'a AtomicBool,
    pub sink: &'a dyn EventSink,
    pub log: &'a OutputLog,
}

/// Abstraction over the workspace-mutating tool.
pub trait ExecutorTool: Send + Sync {
    /// Propose phase: run the tool against the workspace with instructions.
    fn exec(&self, ctx: &ToolContext<'_>, instructions: &str) -> ChildOutcome;

    /// Apply phase: land the proposed change. Only called after a
    /// zero-exit propose.
    fn apply(&self, ctx: &ToolContext<'_>) -> ChildOutcome;

    fn kind(&self) -> ExecutorToolKind;
}

/// The `codex` CLI tool.
pub struct CodexTool;

impl CodexTool {
    fn exec_spec(workspace: &Path, instructions: &str) -> SpawnSpec {
        SpawnSpec {
            program: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "-C".to_string(),
                workspace.display().to_string(),
                "--full-auto".to_string(),
                instructions.to_string(),
            ],
            workdir: workspace.to_path_buf(),
            detached: true,
            prefix: Some(OutputPrefix::executor()),
        }
    }

    fn apply_spec(workspace: &Path) -> SpawnSpec {
        SpawnSpec {
            program: "codex".to_string(),
            args: vec![
                "apply".to_string(),
                "-C".to_string(),
                workspace.display().to_string(),
            ],
            workdir: workspace.to_path_buf(),
            detached: true,
            prefix: Some(OutputPrefix::executor()),
        }
    }
}

impl ExecutorTool for CodexTool {
    fn exec(&self, ctx: &ToolContext<'_>, instructions: &str) -> ChildOutcome {
        let spec = Self::exec_spec(ctx.workspace, instructions);
        supervise(&spec, ctx.run_id, RUN_TIMEOUT, ctx.cancel, ctx.sink, ctx.log)
    }

    fn apply(&self, ctx: &ToolContext<'_>) -> ChildOutcome {
        let spec = Self::apply_spec(ctx.workspace);
        supervise(&spec, ctx.run_id, RUN_TIMEOUT, ctx.cancel, ctx.sink, ctx.log)
    }

    fn kind(&self) -> ExecutorToolKind {
        ExecutorToolKind::Codex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_spec_is_two_phase_propose() {
        let spec = CodexTool::exec_spec(Path::new("/ws"), "add a button");
        assert_eq!(spec.program, "codex");
        assert_eq!(spec.args, vec!["exec", "-C", "/ws", "--full-auto", "add a button"]);
        assert!(spec.detached);
        assert_eq!(spec.workdir, Path::new("/ws"));
    }

    #[test]
    fn apply_spec_targets_same_workspace() {
        let spec = CodexTool::apply_spec(Path::new("/ws"));
        assert_eq!(spec.args, vec!["apply", "-C", "/ws"]);
        assert!(spec.detached);
    }

    #[test]
    fn instructions_pass_through_verbatim() {
        let spec = CodexTool::exec_spec(Path::new("/ws"), "  keep  my   spacing ");
        assert_eq!(spec.args[4], "  keep  my   spacing ");
    }
}
