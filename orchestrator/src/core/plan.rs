//! Plan model and the strict validator applied to every plan the
//! orchestrator admits, whether user-edited or planner-generated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::policy;
use crate::io::config::OrchestratorConfig;

const PLAN_SCHEMA: &str = include_str!("../schemas/plan.schema.json");

/// A validated plan: a short, auditable sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<Step>,
}

/// One step of a plan. Exactly one variant; unknown tags fail validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    /// Informational only; never launches a process.
    Note { message: String },
    /// A single command line, subject to the command policy.
    Cmd { command: String },
    /// A request to mutate the workspace via an external tool.
    Executor {
        tool: ExecutorToolKind,
        instructions: String,
    },
}

impl Step {
    /// Step tag as it appears on the wire and in run records.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Note { .. } => "note",
            Step::Cmd { .. } => "cmd",
            Step::Executor { .. } => "executor",
        }
    }
}

/// Closed set of executor tools this orchestrator can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorToolKind {
    Codex,
}

impl ExecutorToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorToolKind::Codex => "codex",
        }
    }
}

/// Validation failure kinds. Schema problems carry a field path and reason;
/// policy problems describe the rule that was broken.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("invalid plan JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("plan schema violation:\n- {0}")]
    Schema(String),
    #[error("plan policy violation: {0}")]
    Policy(String),
}

/// Parse an untyped JSON string into a [`Plan`].
///
/// Runs the structural schema check first, then the semantic field checks,
/// then the policy checks, so callers always see the most specific failure.
pub fn parse_plan(raw: &str, config: &OrchestratorConfig) -> Result<Plan, PlanError> {
    let value: Value = serde_json::from_str(raw).map_err(PlanError::InvalidJson)?;
    validate_plan_value(&value, config)
}

/// Validate an already-parsed JSON value as a [`Plan`].
pub fn validate_plan_value(value: &Value, config: &OrchestratorConfig) -> Result<Plan, PlanError> {
    check_schema(value)?;

    let plan: Plan = serde_json::from_value(value.clone())
        .map_err(|err| PlanError::Schema(err.to_string()))?;

    if plan.name.trim().is_empty() {
        return Err(PlanError::Schema(
            "name: must be non-empty after trim".to_string(),
        ));
    }
    for (index, step) in plan.steps.iter().enumerate() {
        if let Step::Executor { instructions, .. } = step {
            if instructions.trim().is_empty() {
                return Err(PlanError::Schema(format!(
                    "steps[{index}].instructions: must be non-empty after trim"
                )));
            }
        }
    }

    check_policy(&plan, config)?;
    Ok(plan)
}

/// Serialize a plan to its canonical JSON form: pretty-printed, stable key
/// order, trailing newline.
pub fn to_canonical_json(plan: &Plan) -> String {
    let mut buf = serde_json::to_string_pretty(plan).expect("plan serializes");
    buf.push('\n');
    buf
}

fn check_schema(value: &Value) -> Result<(), PlanError> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).expect("packaged schema parses");
    let compiled = jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(&schema)
        .expect("packaged schema compiles");
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(PlanError::Schema(messages.join("\n- ")));
    }
    Ok(())
}

fn check_policy(plan: &Plan, config: &OrchestratorConfig) -> Result<(), PlanError> {
    if plan.steps.len() > config.max_plan_steps {
        return Err(PlanError::Policy(format!(
            "plan has {} steps (max {})",
            plan.steps.len(),
            config.max_plan_steps
        )));
    }
    if !plan.steps.iter().any(|s| matches!(s, Step::Note { .. })) {
        return Err(PlanError::Policy(
            "plan must contain at least one note step".to_string(),
        ));
    }
    for (index, step) in plan.steps.iter().enumerate() {
        if let Step::Cmd { command } = step {
            if command.trim().is_empty() {
                return Err(PlanError::Policy(format!("steps[{index}]: command is empty")));
            }
            if !policy::is_command_allowed(command, &config.command_allowlist) {
                return Err(PlanError::Policy(format!(
                    "steps[{index}]: command {command:?} does not match the allowlist"
                )));
            }
        }
    }
    Ok(())
}
