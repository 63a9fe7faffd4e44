//! Planner client: prompt assembly, completion call, output extraction,
//! validation, and the single retry on forbidden operators.

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::{Environment, context};
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{Plan, PlanError, Step, parse_plan};
use crate::core::policy;
use crate::io::completion::{CompletionClient, CompletionError};
use crate::io::config::OrchestratorConfig;
use crate::io::run_store::{RunRecord, latest_record};

const USER_TEMPLATE: &str = include_str!("prompts/planner_user.md");

/// Truncation limit for the last-run summary fed back to the planner.
const SUMMARY_LIMIT: usize = 1200;

/// Fixed preamble describing what the orchestrator can execute, so the
/// planner only proposes plans this process can drive.
const CAPABILITY_CARD: &str = "\
## Orchestrator capabilities

You plan for an orchestrator with exactly three step types: `note`
(informational), `cmd` (a single git command, no shell operators), and
`executor` (the codex tool, invoked propose-then-apply against the
workspace). After every non-note step the orchestrator collects evidence:
`git status --porcelain`, `git diff --stat`, `git diff --name-only`.
Executor steps are evaluated against a pre-step diff baseline and record
`has_changes`, `suspicious_no_change`, `no_op`, and `retried`. Changes to
package manager files require explicit human approval. The orchestrator
never runs `git add`, `git commit`, or `git push`, and will reject plans
that try.";

const OPERATOR_REMINDER: &str = "\
Reminder: every cmd step must be a single git command. Do not use shell \
operators: ||, &&, |, >, <, ;, $( or backticks. Regenerate the plan.";

/// Planner failure kinds surfaced to the request caller.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("OPENAI_API_KEY is not set")]
    AuthMissing,
    #[error("planner system prompt not found (searched: {0})")]
    PromptMissing(String),
    #[error("planner returned empty output")]
    EmptyOutput,
    #[error("planner kept emitting forbidden shell operators after a retry")]
    ForbiddenShellOperators,
    #[error(transparent)]
    InvalidPlan(#[from] PlanError),
    #[error("{0}")]
    Upstream(String),
}

impl From<CompletionError> for PlannerError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::AuthMissing => PlannerError::AuthMissing,
            CompletionError::Upstream(message) => PlannerError::Upstream(message),
            CompletionError::Transport(message) | CompletionError::Malformed(message) => {
                PlannerError::Upstream(message)
            }
        }
    }
}

/// Default search paths for the packaged system prompt: next to the built
/// binary first, then the source tree.
pub fn default_system_prompt_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join("prompts").join("planner_system.md"));
        }
    }
    paths.push(
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("prompts")
            .join("planner_system.md"),
    );
    paths
}

/// Generates validated plans from free-text requirements.
pub struct PlannerClient<'a> {
    completion: &'a dyn CompletionClient,
    config: &'a OrchestratorConfig,
    runs_root: &'a Path,
    system_prompt_paths: Vec<PathBuf>,
}

impl<'a> PlannerClient<'a> {
    pub fn new(
        completion: &'a dyn CompletionClient,
        config: &'a OrchestratorConfig,
        runs_root: &'a Path,
    ) -> Self {
        Self {
            completion,
            config,
            runs_root,
            system_prompt_paths: default_system_prompt_paths(),
        }
    }

    pub fn with_system_prompt_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_prompt_paths = paths;
        self
    }

    /// Generate a plan for `requirement`.
    ///
    /// One completion call, plus at most one retry when the returned plan
    /// contains a forbidden shell operator in a `cmd` step.
    #[instrument(skip_all)]
    pub fn generate(&self, requirement: &str) -> Result<Plan, PlannerError> {
        let system = self.read_system_prompt()?;
        let summary = last_run_summary(self.runs_root);

        let mut reminder: Option<&str> = None;
        for attempt in 0..2 {
            let user = render_user_prompt(&summary, requirement, reminder);
            let content = self.completion.complete(&system, &user)?;
            if content.trim().is_empty() {
                return Err(PlannerError::EmptyOutput);
            }
            let raw = extract_json(&content);
            let plan = parse_plan(raw.trim(), self.config)?;

            if let Some(operator) = first_forbidden_operator(&plan) {
                if attempt == 0 {
                    warn!(operator, "plan contained a forbidden operator, retrying once");
                    reminder = Some(OPERATOR_REMINDER);
                    continue;
                }
                return Err(PlannerError::ForbiddenShellOperators);
            }

            info!(plan_name = %plan.name, steps = plan.steps.len(), "plan generated");
            return Ok(plan);
        }
        Err(PlannerError::ForbiddenShellOperators)
    }

    fn read_system_prompt(&self) -> Result<String, PlannerError> {
        for path in &self.system_prompt_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                debug!(path = %path.display(), "system prompt loaded");
                return Ok(contents);
            }
        }
        let searched = self
            .system_prompt_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(PlannerError::PromptMissing(searched))
    }
}

fn render_user_prompt(summary: &str, requirement: &str, reminder: Option<&str>) -> String {
    let mut env = Environment::new();
    env.add_template("planner_user", USER_TEMPLATE)
        .expect("planner template should be valid");
    let template = env.get_template("planner_user").expect("template exists");
    template
        .render(context! {
            capability_card => CAPABILITY_CARD,
            last_run_summary => summary,
            requirement => requirement,
            reminder => reminder,
        })
        .expect("planner template renders")
}

fn first_forbidden_operator(plan: &Plan) -> Option<&'static str> {
    plan.steps.iter().find_map(|step| match step {
        Step::Cmd { command } => policy::forbidden_operator(command),
        _ => None,
    })
}

/// Extract the JSON payload from assistant content: fenced block first,
/// else the substring between the first `{` and the last `}`, else the
/// content as-is (the validator reports the real failure).
pub fn extract_json(content: &str) -> &str {
    if let Some(fenced) = extract_fenced(content) {
        return fenced;
    }
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            return &content[start..=end];
        }
    }
    content
}

fn extract_fenced(content: &str) -> Option<&str> {
    let open = content.find("```")?;
    let after_fence = &content[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Planner-relevant digest of the most recent run, or a placeholder.
pub fn last_run_summary(runs_root: &Path) -> String {
    let Some(record) = latest_record(runs_root) else {
        return "No previous runs.".to_string();
    };
    truncate_utf8(&summarize_record(&record), SUMMARY_LIMIT)
}

// Field order is serialization order; run identity leads so it survives
// truncation.
#[derive(serde::Serialize)]
struct RunDigest<'a> {
    run_id: &'a str,
    plan: &'a crate::io::run_store::PlanSummary,
    exit_code: Option<i32>,
    cancelled: bool,
    timeout: bool,
    blocked_by_policy: bool,
    decision_pending: bool,
    steps: Vec<StepDigest<'a>>,
}

#[derive(serde::Serialize)]
struct StepDigest<'a> {
    step_index: usize,
    #[serde(rename = "type")]
    step_type: &'a str,
    exit_code: Option<i32>,
    blocked_by_policy: bool,
    evaluation: Option<&'a crate::core::evaluate::Evaluation>,
}

fn summarize_record(record: &RunRecord) -> String {
    let digest = RunDigest {
        run_id: &record.run_id,
        plan: &record.plan,
        exit_code: record.exit_code,
        cancelled: record.cancelled,
        timeout: record.timeout,
        blocked_by_policy: record.blocked_by_policy,
        decision_pending: record.decision_pending,
        steps: record
            .steps
            .iter()
            .map(|step| StepDigest {
                step_index: step.step_index,
                step_type: &step.step_type,
                exit_code: step.exit_code,
                blocked_by_policy: step.blocked_by_policy,
                evaluation: step.evaluation.as_ref(),
            })
            .collect(),
    };
    serde_json::to_string(&digest).unwrap_or_else(|_| format!("{{\"run_id\":{:?}}}", record.run_id))
}

fn truncate_utf8(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
