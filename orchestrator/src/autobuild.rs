//! Autobuild controller: a bounded plan → run → evaluate loop with a
//! closed stop taxonomy.
//!
//! The controller owns no process state of its own; planning and run
//! execution are injected so the loop logic stays deterministic and
//! testable without children or endpoints.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::plan::Plan;
use crate::io::events::{AutobuildPhase, Event, EventSink};
use crate::planner::PlannerError;
use crate::run::RunOutcome;

pub const DEFAULT_MAX_ITERATIONS: u32 = 2;

/// Why the autobuild loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PlanningFailed,
    Cancelled,
    NoOp,
    RetryNoChange,
    Failed,
    MaxIterationsReached,
    DecisionPending,
}

/// Summary of an autobuild invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutobuildOutcome {
    pub stop_reason: StopReason,
    pub iterations_run: u32,
}

/// Inputs to one autobuild session.
#[derive(Debug, Clone)]
pub struct AutobuildRequest {
    pub workspace: PathBuf,
    pub requirement: String,
    pub max_iterations: u32,
}

/// Drive the loop: plan, run (deferred-decision mode), classify, repeat.
///
/// `plan_fn` and `run_fn` receive the 1-based iteration number. Planner
/// failures degrade to a `planning_failed` stop instead of propagating.
#[instrument(skip_all, fields(max_iterations = request.max_iterations))]
pub fn run_autobuild<P, R>(
    request: &AutobuildRequest,
    cancel: &AtomicBool,
    sink: &dyn EventSink,
    mut plan_fn: P,
    mut run_fn: R,
) -> AutobuildOutcome
where
    P: FnMut(u32) -> Result<Plan, PlannerError>,
    R: FnMut(u32, &Plan) -> Result<RunOutcome>,
{
    let max = request.max_iterations.max(1);
    let mut iterations_run = 0u32;

    for iteration in 1..=max {
        if cancel.load(Ordering::Relaxed) {
            return finish(sink, StopReason::Cancelled, iterations_run);
        }

        emit_status(sink, iteration, AutobuildPhase::Planning, "Generating plan", None);
        let plan = match plan_fn(iteration) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(iteration, error = %err, "planning failed");
                emit_status(
                    sink,
                    iteration,
                    AutobuildPhase::Done,
                    &format!("Planning failed: {err}"),
                    None,
                );
                return finish(sink, StopReason::PlanningFailed, iterations_run);
            }
        };
        sink.emit(Event::AutobuildPlan {
            iteration,
            plan_name: plan.name.clone(),
            plan: plan.clone(),
        });

        if cancel.load(Ordering::Relaxed) {
            return finish(sink, StopReason::Cancelled, iterations_run);
        }

        emit_status(sink, iteration, AutobuildPhase::Running, "Executing plan", None);
        let outcome = match run_fn(iteration, &plan) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(iteration, error = %err, "run could not be executed");
                emit_status(
                    sink,
                    iteration,
                    AutobuildPhase::Done,
                    &format!("Run failed to start: {err}"),
                    None,
                );
                return finish(sink, StopReason::Failed, iterations_run);
            }
        };
        iterations_run = iteration;
        emit_status(
            sink,
            iteration,
            AutobuildPhase::Done,
            &format!("Iteration finished (exit {})", outcome.exit_code),
            Some(outcome.run_id.clone()),
        );

        // First matching rule wins.
        if outcome.decision_pending {
            return finish(sink, StopReason::DecisionPending, iterations_run);
        }
        if outcome.cancelled {
            return finish(sink, StopReason::Cancelled, iterations_run);
        }
        if outcome.no_op {
            return finish(sink, StopReason::NoOp, iterations_run);
        }
        if outcome.suspicious_no_change
            && outcome.retried
            && outcome.retry_has_changes == Some(false)
        {
            return finish(sink, StopReason::RetryNoChange, iterations_run);
        }
        if iteration == max {
            let reason = if outcome.exit_code != 0 {
                StopReason::Failed
            } else {
                StopReason::MaxIterationsReached
            };
            return finish(sink, reason, iterations_run);
        }
        info!(iteration, exit_code = outcome.exit_code, "continuing to next iteration");
    }

    finish(sink, StopReason::MaxIterationsReached, iterations_run)
}

fn emit_status(
    sink: &dyn EventSink,
    iteration: u32,
    phase: AutobuildPhase,
    message: &str,
    run_id: Option<String>,
) {
    sink.emit(Event::AutobuildStatus {
        iteration,
        phase,
        message: message.to_string(),
        run_id,
    });
}

fn finish(sink: &dyn EventSink, stop_reason: StopReason, iterations_run: u32) -> AutobuildOutcome {
    info!(?stop_reason, iterations_run, "autobuild stopped");
    sink.emit(Event::AutobuildDone {
        stop_reason,
        iterations_run,
    });
    AutobuildOutcome {
        stop_reason,
        iterations_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Step;
    use crate::test_support::CollectingSink;
    use anyhow::anyhow;

    fn note_plan() -> Plan {
        Plan {
            name: "p".to_string(),
            steps: vec![Step::Note {
                message: "n".to_string(),
            }],
        }
    }

    fn request(max: u32) -> AutobuildRequest {
        AutobuildRequest {
            workspace: PathBuf::from("/ws"),
            requirement: "do it".to_string(),
            max_iterations: max,
        }
    }

    fn clean_outcome(run_id: &str) -> RunOutcome {
        RunOutcome {
            run_id: run_id.to_string(),
            exit_code: 0,
            ..RunOutcome::default()
        }
    }

    #[test]
    fn planning_failure_degrades_to_stop() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Err(PlannerError::EmptyOutput),
            |_, _| Ok(clean_outcome("run-1")),
        );
        assert_eq!(outcome.stop_reason, StopReason::PlanningFailed);
        assert_eq!(outcome.iterations_run, 0);
        assert!(sink.events().iter().any(|event| matches!(
            event,
            Event::AutobuildStatus { phase: AutobuildPhase::Done, message, .. }
                if message.starts_with("Planning failed:")
        )));
        assert!(matches!(
            sink.events().last(),
            Some(Event::AutobuildDone { stop_reason: StopReason::PlanningFailed, .. })
        ));
    }

    #[test]
    fn no_op_stops_after_first_iteration() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |_, _| {
                Ok(RunOutcome {
                    no_op: true,
                    suspicious_no_change: true,
                    ..clean_outcome("run-1")
                })
            },
        );
        assert_eq!(outcome.stop_reason, StopReason::NoOp);
        assert_eq!(outcome.iterations_run, 1);
    }

    #[test]
    fn decision_pending_wins_over_everything() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |_, _| {
                Ok(RunOutcome {
                    decision_pending: true,
                    no_op: true,
                    exit_code: 0,
                    ..clean_outcome("run-1")
                })
            },
        );
        assert_eq!(outcome.stop_reason, StopReason::DecisionPending);
    }

    #[test]
    fn failed_retry_without_changes_stops() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |_, _| {
                Ok(RunOutcome {
                    suspicious_no_change: true,
                    retried: true,
                    retry_has_changes: Some(false),
                    ..clean_outcome("run-1")
                })
            },
        );
        assert_eq!(outcome.stop_reason, StopReason::RetryNoChange);
    }

    #[test]
    fn nonzero_exit_retries_then_fails_at_max() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let mut plan_calls = 0u32;
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| {
                plan_calls += 1;
                Ok(note_plan())
            },
            |iteration, _| {
                Ok(RunOutcome {
                    exit_code: 1,
                    ..clean_outcome(&format!("run-{iteration}"))
                })
            },
        );
        assert_eq!(plan_calls, 2);
        assert_eq!(outcome.stop_reason, StopReason::Failed);
        assert_eq!(outcome.iterations_run, 2);
    }

    #[test]
    fn clean_runs_reach_max_iterations() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |iteration, _| Ok(clean_outcome(&format!("run-{iteration}"))),
        );
        assert_eq!(outcome.stop_reason, StopReason::MaxIterationsReached);
        assert_eq!(outcome.iterations_run, 2);
    }

    #[test]
    fn cancel_before_planning_stops_without_planning() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(true);
        let mut plan_calls = 0u32;
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| {
                plan_calls += 1;
                Ok(note_plan())
            },
            |_, _| Ok(clean_outcome("run-1")),
        );
        assert_eq!(plan_calls, 0);
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.iterations_run, 0);
    }

    #[test]
    fn run_start_failure_stops_as_failed() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        let outcome = run_autobuild(
            &request(2),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |_, _| Err(anyhow!("another run is active")),
        );
        assert_eq!(outcome.stop_reason, StopReason::Failed);
        assert_eq!(outcome.iterations_run, 0);
    }

    #[test]
    fn iteration_events_are_totally_ordered() {
        let sink = CollectingSink::default();
        let cancel = AtomicBool::new(false);
        run_autobuild(
            &request(1),
            &cancel,
            &sink,
            |_| Ok(note_plan()),
            |_, _| Ok(clean_outcome("run-1")),
        );
        let events = sink.events();
        let position = |predicate: &dyn Fn(&Event) -> bool| {
            events.iter().position(|e| predicate(e)).expect("event present")
        };
        let planning = position(&|e| {
            matches!(e, Event::AutobuildStatus { phase: AutobuildPhase::Planning, .. })
        });
        let plan = position(&|e| matches!(e, Event::AutobuildPlan { .. }));
        let running = position(&|e| {
            matches!(e, Event::AutobuildStatus { phase: AutobuildPhase::Running, .. })
        });
        let done = position(&|e| {
            matches!(e, Event::AutobuildStatus { phase: AutobuildPhase::Done, .. })
        });
        let finished = position(&|e| matches!(e, Event::AutobuildDone { .. }));
        assert!(planning < plan && plan < running && running < done && done < finished);
    }
}
