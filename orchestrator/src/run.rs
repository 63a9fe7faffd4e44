//! Run executor: drives one validated plan step-by-step against a
//! workspace, collecting evidence and maintaining the on-disk run record.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::evaluate::{self, RetryResult};
use crate::core::evidence;
use crate::core::plan::{Plan, Step};
use crate::core::policy;
use crate::io::config::OrchestratorConfig;
use crate::io::decision::{DecisionMap, DecisionResult};
use crate::io::events::{Event, EventSink};
use crate::io::executor_tool::{ExecutorTool, ToolContext};
use crate::io::git::Git;
use crate::io::process::{ChildOutcome, RUN_TIMEOUT, SpawnSpec, emit_system, supervise};
use crate::io::run_store::{
    DecisionRecord, OutputLog, PlanSummary, RunRecord, StepRecord, run_dir, write_record,
};

/// How the dependency gate behaves when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionMode {
    /// Suspend the run until a decision is delivered.
    Synchronous,
    /// Record the pending request and end the run with `decision_pending`.
    Deferred,
}

/// Everything a run needs from its surroundings.
pub struct RunContext<'a> {
    pub config: &'a OrchestratorConfig,
    pub runs_root: &'a Path,
    pub workspace: &'a Path,
    pub run_id: &'a str,
    pub tool: &'a dyn ExecutorTool,
    pub sink: &'a dyn EventSink,
    pub decisions: &'a DecisionMap,
    pub cancel: &'a AtomicBool,
    pub decision_mode: DecisionMode,
}

/// Summary of a finished run, shaped for the autobuild classifier.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub run_id: String,
    pub exit_code: i32,
    pub cancelled: bool,
    pub timed_out: bool,
    pub blocked_by_policy: bool,
    pub cancelled_by_decision: bool,
    pub decision_pending: bool,
    /// Classification of the last executor step, if any ran.
    pub no_op: bool,
    pub suspicious_no_change: bool,
    pub retried: bool,
    pub retry_has_changes: Option<bool>,
}

enum GateFlow {
    Continue,
    Pending,
    Rejected,
    CancelledWhileWaiting,
}

enum StepEnd {
    Continue,
    EndRun,
}

/// Execute an admitted plan to completion.
///
/// Policy violations, timeouts, cancels, and step failures are recovered
/// into the run record; only I/O failures on the record itself propagate.
#[instrument(skip_all, fields(run_id = %ctx.run_id, steps = plan.steps.len()))]
pub fn execute_run(
    ctx: &RunContext<'_>,
    plan: &Plan,
    requirement: Option<&str>,
) -> Result<RunOutcome> {
    let dir = run_dir(ctx.runs_root, ctx.run_id);
    let log = OutputLog::create(&dir)?;
    let mut record = RunRecord {
        run_id: ctx.run_id.to_string(),
        workspace_path: ctx.workspace.display().to_string(),
        requirement: requirement.map(str::to_string),
        start_time: now(),
        end_time: None,
        plan: PlanSummary {
            name: plan.name.clone(),
            steps_count: plan.steps.len(),
        },
        steps: Vec::new(),
        evidence: None,
        exit_code: None,
        blocked_by_policy: false,
        timeout: false,
        cancelled: false,
        cancelled_by_decision: false,
        decision_pending: false,
        decision: None,
    };
    write_record(&dir, &record)?;
    info!(workspace = %ctx.workspace.display(), "run started");

    let git = Git::new(ctx.workspace);
    let total = plan.steps.len();
    let mut exit_code = 0i32;
    // Set by a content-search probe with non-empty stdout; cleared by notes.
    let mut precheck_hit = false;
    let mut precheck_stdout = String::new();

    for (offset, step) in plan.steps.iter().enumerate() {
        let index = offset + 1;
        if ctx.cancel.load(Ordering::Relaxed) {
            record.cancelled = true;
            exit_code = -1;
            break;
        }
        ctx.sink.emit(Event::RunStep {
            run_id: ctx.run_id.to_string(),
            step_index: index,
            total,
        });

        let end = match step {
            Step::Note { message } => {
                emit_system(ctx.sink, &log, ctx.run_id, &format!("Note: {message}\n"));
                precheck_hit = false;
                precheck_stdout.clear();
                let mut sr = StepRecord::new(index, "note");
                sr.message = Some(message.clone());
                record.steps.push(sr);
                write_record(&dir, &record)?;
                StepEnd::Continue
            }
            Step::Cmd { command } => run_cmd_step(
                ctx,
                &git,
                &dir,
                &log,
                &mut record,
                index,
                command,
                &mut precheck_hit,
                &mut precheck_stdout,
                &mut exit_code,
            )?,
            Step::Executor { tool, instructions } => run_executor_step(
                ctx,
                &git,
                &dir,
                &log,
                &mut record,
                index,
                *tool,
                instructions,
                precheck_hit,
                &precheck_stdout,
                &mut exit_code,
            )?,
        };
        if matches!(end, StepEnd::EndRun) {
            break;
        }
    }

    record.end_time = Some(now());
    record.exit_code = Some(exit_code);
    write_record(&dir, &record)?;
    if !record.decision_pending {
        ctx.decisions.clear(ctx.run_id);
    }
    ctx.sink.emit(Event::RunDone {
        run_id: ctx.run_id.to_string(),
        exit_code,
    });
    info!(exit_code, "run finished");

    Ok(outcome_from_record(&record))
}

#[allow(clippy::too_many_arguments)]
fn run_cmd_step(
    ctx: &RunContext<'_>,
    git: &Git,
    dir: &Path,
    log: &OutputLog,
    record: &mut RunRecord,
    index: usize,
    command: &str,
    precheck_hit: &mut bool,
    precheck_stdout: &mut String,
    exit_code: &mut i32,
) -> Result<StepEnd> {
    let mut sr = StepRecord::new(index, "cmd");
    sr.command = Some(command.to_string());
    sr.started_at = Some(now());

    if !policy::is_command_allowed(command, &ctx.config.command_allowlist) {
        return block_step(
            ctx,
            git,
            dir,
            log,
            record,
            sr,
            "Command not allowed by policy",
            exit_code,
        );
    }
    if policy::has_forbidden_shell_operators(command) {
        return block_step(
            ctx,
            git,
            dir,
            log,
            record,
            sr,
            "Command contains forbidden shell operators",
            exit_code,
        );
    }
    let tokens = match policy::tokenize(command) {
        Ok(tokens) => tokens,
        Err(err) => {
            let reason = format!("Command could not be parsed: {err}");
            return block_step(ctx, git, dir, log, record, sr, &reason, exit_code);
        }
    };

    let spec = SpawnSpec {
        program: tokens[0].clone(),
        args: tokens[1..].to_vec(),
        workdir: ctx.workspace.to_path_buf(),
        detached: false,
        prefix: None,
    };
    let outcome = supervise(&spec, ctx.run_id, RUN_TIMEOUT, ctx.cancel, ctx.sink, log);

    // A git grep probe records whether the content already exists; exit 1
    // just means "no match" and must not end the run.
    let is_probe = tokens.len() >= 2 && tokens[0] == "git" && tokens[1] == "grep";
    if is_probe {
        *precheck_hit = !outcome.stdout.trim().is_empty();
        *precheck_stdout = outcome.stdout.clone();
    }
    let effective_exit =
        if is_probe && outcome.exit_code == 1 && !outcome.cancelled && !outcome.timed_out {
            0
        } else {
            outcome.exit_code
        };

    sr.exit_code = Some(effective_exit);
    sr.cancelled = outcome.cancelled;
    sr.timeout = outcome.timed_out;
    sr.ended_at = Some(now());
    attach_evidence(ctx, git, log, record, &mut sr);
    record.cancelled |= outcome.cancelled;
    record.timeout |= outcome.timed_out;
    record.steps.push(sr);
    write_record(dir, record)?;

    if effective_exit != 0 || outcome.cancelled || outcome.timed_out {
        *exit_code = if effective_exit != 0 { effective_exit } else { -1 };
        return Ok(StepEnd::EndRun);
    }
    finish_with_gate(ctx, dir, log, record, exit_code)
}

#[allow(clippy::too_many_arguments)]
fn run_executor_step(
    ctx: &RunContext<'_>,
    git: &Git,
    dir: &Path,
    log: &OutputLog,
    record: &mut RunRecord,
    index: usize,
    tool: crate::core::plan::ExecutorToolKind,
    instructions: &str,
    precheck_hit: bool,
    precheck_stdout: &str,
    exit_code: &mut i32,
) -> Result<StepEnd> {
    let mut sr = StepRecord::new(index, "executor");
    sr.tool = Some(tool.as_str().to_string());
    sr.instructions_length = Some(instructions.chars().count());
    sr.started_at = Some(now());

    if !policy::is_executor_tool_allowed(tool) || tool != ctx.tool.kind() {
        return block_step(
            ctx,
            git,
            dir,
            log,
            record,
            sr,
            "Executor tool not allowed by policy",
            exit_code,
        );
    }

    let baseline = match git.diff_name_only() {
        Ok(out) => evidence::parse_name_only(&out),
        Err(reason) => {
            emit_system(ctx.sink, log, ctx.run_id, &evidence::format_failed_block(&reason));
            Vec::new()
        }
    };

    let tool_ctx = ToolContext {
        run_id: ctx.run_id,
        workspace: ctx.workspace,
        cancel: ctx.cancel,
        sink: ctx.sink,
        log,
    };
    let outcome = run_two_phase(ctx.tool, &tool_ctx, instructions);

    attach_evidence(ctx, git, log, record, &mut sr);
    let current = sr
        .evidence
        .as_ref()
        .map(|e| evidence::parse_name_only(&e.git_diff_names))
        .unwrap_or_default();
    let changed = evaluate::changed_since(&baseline, &current);
    let mut evaluation = evaluate::classify(
        outcome.exit_code,
        changed,
        precheck_hit && ctx.config.no_op_detection,
    );

    if evaluation.no_op {
        // Skip the retry; surface what the probe already found.
        emit_system(
            ctx.sink,
            log,
            ctx.run_id,
            &format!(
                "Executor made no changes and the content probe already matched:\n{precheck_stdout}"
            ),
        );
    } else if evaluation.suspicious_no_change && !outcome.cancelled && !outcome.timed_out {
        emit_system(
            ctx.sink,
            log,
            ctx.run_id,
            "Executor exited 0 with no changes; retrying once with minimal-change instructions\n",
        );
        let retry_instructions =
            evaluate::retry_instructions(ctx.config.retry_focus_hint.as_deref());
        let retry_outcome = run_two_phase(ctx.tool, &tool_ctx, &retry_instructions);
        let retry_names = match git.diff_name_only() {
            Ok(out) => evidence::parse_name_only(&out),
            Err(_) => Vec::new(),
        };
        let retry_changed = evaluate::changed_since(&baseline, &retry_names);
        evaluation.retried = true;
        evaluation.retry_result = Some(RetryResult {
            has_changes: !retry_changed.is_empty(),
            changed_files: retry_changed,
        });
        if retry_outcome.exit_code != 0 {
            warn!(exit_code = retry_outcome.exit_code, "retry attempt failed");
        }
    }

    sr.exit_code = Some(outcome.exit_code);
    sr.cancelled = outcome.cancelled;
    sr.timeout = outcome.timed_out;
    sr.ended_at = Some(now());
    sr.evaluation = Some(evaluation);
    record.cancelled |= outcome.cancelled;
    record.timeout |= outcome.timed_out;
    record.steps.push(sr);
    write_record(dir, record)?;

    if outcome.exit_code != 0 || outcome.cancelled || outcome.timed_out {
        *exit_code = if outcome.exit_code != 0 { outcome.exit_code } else { -1 };
        return Ok(StepEnd::EndRun);
    }
    finish_with_gate(ctx, dir, log, record, exit_code)
}

/// Propose, then apply only when the proposal exited cleanly.
fn run_two_phase(
    tool: &dyn ExecutorTool,
    ctx: &ToolContext<'_>,
    instructions: &str,
) -> ChildOutcome {
    let exec = tool.exec(ctx, instructions);
    if exec.exit_code != 0 || exec.cancelled || exec.timed_out {
        return exec;
    }
    let apply = tool.apply(ctx);
    ChildOutcome {
        exit_code: apply.exit_code,
        cancelled: exec.cancelled || apply.cancelled,
        timed_out: exec.timed_out || apply.timed_out,
        stdout: format!("{}{}", exec.stdout, apply.stdout),
        stderr: format!("{}{}", exec.stderr, apply.stderr),
        error: apply.error,
    }
}

#[allow(clippy::too_many_arguments)]
fn block_step(
    ctx: &RunContext<'_>,
    git: &Git,
    dir: &Path,
    log: &OutputLog,
    record: &mut RunRecord,
    mut sr: StepRecord,
    reason: &str,
    exit_code: &mut i32,
) -> Result<StepEnd> {
    emit_system(ctx.sink, log, ctx.run_id, &format!("{reason}\n"));
    sr.blocked_by_policy = true;
    sr.exit_code = Some(-1);
    sr.ended_at = Some(now());
    attach_evidence(ctx, git, log, record, &mut sr);
    record.steps.push(sr);
    record.blocked_by_policy = true;
    *exit_code = -1;
    write_record(dir, record)?;
    // Offer the decision opportunity; the run ends blocked either way.
    if matches!(dependency_gate(ctx, dir, log, record)?, GateFlow::Pending) {
        record.decision_pending = true;
    }
    write_record(dir, record)?;
    Ok(StepEnd::EndRun)
}

/// Collect evidence, emit the block, and mirror it onto the step and run.
fn attach_evidence(
    ctx: &RunContext<'_>,
    git: &Git,
    log: &OutputLog,
    record: &mut RunRecord,
    sr: &mut StepRecord,
) {
    match git.collect_evidence() {
        Ok(ev) => {
            emit_system(ctx.sink, log, ctx.run_id, &ev.format_block());
            sr.evidence = Some(ev.clone());
            record.evidence = Some(ev);
        }
        Err(reason) => {
            emit_system(ctx.sink, log, ctx.run_id, &evidence::format_failed_block(&reason));
            sr.evidence_error = Some(reason);
        }
    }
}

/// Run the dependency gate after a successful step and translate its flow
/// into run termination state.
fn finish_with_gate(
    ctx: &RunContext<'_>,
    dir: &Path,
    log: &OutputLog,
    record: &mut RunRecord,
    exit_code: &mut i32,
) -> Result<StepEnd> {
    match dependency_gate(ctx, dir, log, record)? {
        GateFlow::Continue => Ok(StepEnd::Continue),
        GateFlow::Pending => {
            record.decision_pending = true;
            write_record(dir, record)?;
            Ok(StepEnd::EndRun)
        }
        GateFlow::Rejected => {
            record.cancelled_by_decision = true;
            *exit_code = -1;
            write_record(dir, record)?;
            Ok(StepEnd::EndRun)
        }
        GateFlow::CancelledWhileWaiting => {
            record.cancelled = true;
            *exit_code = -1;
            write_record(dir, record)?;
            Ok(StepEnd::EndRun)
        }
    }
}

fn dependency_gate(
    ctx: &RunContext<'_>,
    dir: &Path,
    log: &OutputLog,
    record: &mut RunRecord,
) -> Result<GateFlow> {
    let Some(ev) = &record.evidence else {
        return Ok(GateFlow::Continue);
    };
    let paths = evidence::changed_paths_sorted(&ev.git_diff_names);
    let files = evidence::dependency_files(&paths, &ctx.config.dependency_basenames);
    if files.is_empty() {
        return Ok(GateFlow::Continue);
    }

    ctx.sink.emit(Event::RunDecision {
        run_id: ctx.run_id.to_string(),
        files: files.clone(),
    });
    emit_system(
        ctx.sink,
        log,
        ctx.run_id,
        &format!(
            "Dependency files changed, awaiting approval: {}\n",
            files.join(", ")
        ),
    );

    match ctx.decision_mode {
        DecisionMode::Deferred => {
            ctx.decisions.register_pending(ctx.run_id, files, dir);
            Ok(GateFlow::Pending)
        }
        DecisionMode::Synchronous => {
            let rx = ctx.decisions.register_wait(ctx.run_id, files.clone(), dir);
            // A dropped sender means the process is tearing down; fail safe.
            let result = rx.recv().unwrap_or(DecisionResult::Rejected);
            record.decision = Some(DecisionRecord::dependency_change(
                result.as_str(),
                files,
                now(),
            ));
            write_record(dir, record)?;
            match result {
                DecisionResult::Approved => Ok(GateFlow::Continue),
                DecisionResult::Rejected => {
                    if ctx.cancel.load(Ordering::Relaxed) {
                        Ok(GateFlow::CancelledWhileWaiting)
                    } else {
                        Ok(GateFlow::Rejected)
                    }
                }
            }
        }
    }
}

fn outcome_from_record(record: &RunRecord) -> RunOutcome {
    let last_evaluation = record
        .steps
        .iter()
        .rev()
        .find_map(|step| step.evaluation.as_ref());
    RunOutcome {
        run_id: record.run_id.clone(),
        exit_code: record.exit_code.unwrap_or(-1),
        cancelled: record.cancelled,
        timed_out: record.timeout,
        blocked_by_policy: record.blocked_by_policy,
        cancelled_by_decision: record.cancelled_by_decision,
        decision_pending: record.decision_pending,
        no_op: last_evaluation.is_some_and(|e| e.no_op),
        suspicious_no_change: last_evaluation.is_some_and(|e| e.suspicious_no_change),
        retried: last_evaluation.is_some_and(|e| e.retried),
        retry_has_changes: last_evaluation
            .and_then(|e| e.retry_result.as_ref())
            .map(|r| r.has_changes),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
