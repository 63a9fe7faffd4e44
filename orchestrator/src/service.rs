//! Request surface for hosts.
//!
//! The [`Orchestrator`] owns the process-wide guards: the single active-run
//! slot, the single autobuild session, and the pending-decision map. All
//! state transitions happen here; the run executor itself never reaches
//! outside its [`crate::run::RunContext`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::autobuild::{AutobuildOutcome, AutobuildRequest, run_autobuild};
use crate::core::plan::Plan;
use crate::io::completion::{CompletionClient, OpenAiCompletion};
use crate::io::config::OrchestratorConfig;
use crate::io::decision::{DecisionMap, DecisionResult};
use crate::io::events::{Event, EventSink};
use crate::io::executor_tool::{CodexTool, ExecutorTool};
use crate::io::git::Git;
use crate::io::run_store::{default_runs_root, ensure_runs_root, generate_run_id};
use crate::planner::{PlannerClient, PlannerError};
use crate::run::{DecisionMode, RunContext, RunOutcome, execute_run};

/// Preflight failures reported synchronously to the request caller.
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("another run is already active")]
    AnotherRunActive,
    #[error("autobuild is already active")]
    AutobuildActive,
    #[error("workspace is not set")]
    WorkspaceUnset,
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("workspace is not a git repository")]
    NotARepository,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

struct ActiveRun {
    run_id: String,
    cancel: Arc<AtomicBool>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runs_root: PathBuf,
    sink: Arc<dyn EventSink>,
    decisions: DecisionMap,
    tool: Arc<dyn ExecutorTool>,
    /// Test seam; `None` builds the real client from the environment per
    /// request so a missing key fails the request, not construction.
    completion: Option<Arc<dyn CompletionClient>>,
    active: Mutex<Option<ActiveRun>>,
    autobuild_active: AtomicBool,
    autobuild_cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, sink: Arc<dyn EventSink>) -> anyhow::Result<Arc<Self>> {
        let runs_root = default_runs_root()?;
        Self::with_parts(config, runs_root, sink, Arc::new(CodexTool), None)
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        runs_root: PathBuf,
        sink: Arc<dyn EventSink>,
        tool: Arc<dyn ExecutorTool>,
        completion: Option<Arc<dyn CompletionClient>>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        ensure_runs_root(&runs_root)?;
        Ok(Arc::new(Self {
            config,
            runs_root,
            sink,
            decisions: DecisionMap::default(),
            tool,
            completion,
            active: Mutex::new(None),
            autobuild_active: AtomicBool::new(false),
            autobuild_cancel: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// The runs root, created if missing.
    pub fn runs_root(&self) -> anyhow::Result<PathBuf> {
        ensure_runs_root(&self.runs_root)?;
        Ok(self.runs_root.clone())
    }

    /// Generate a validated plan for a requirement.
    #[instrument(skip_all)]
    pub fn generate_plan(&self, requirement: &str) -> Result<Plan, PlannerError> {
        match &self.completion {
            Some(client) => self.plan_with(client.as_ref(), requirement),
            None => {
                let client = OpenAiCompletion::from_env(&self.config.model)?;
                self.plan_with(&client, requirement)
            }
        }
    }

    fn plan_with(
        &self,
        client: &dyn CompletionClient,
        requirement: &str,
    ) -> Result<Plan, PlannerError> {
        PlannerClient::new(client, &self.config, &self.runs_root).generate(requirement)
    }

    /// Admit and start a run in synchronous decision mode.
    ///
    /// Returns the run id immediately; execution proceeds on a background
    /// thread and reports through the event sink.
    #[instrument(skip_all, fields(workspace = %workspace.display()))]
    pub fn run_plan(
        self: &Arc<Self>,
        workspace: &Path,
        plan: Plan,
        requirement: Option<String>,
    ) -> Result<String, AdmitError> {
        self.preflight(workspace, &plan)?;
        let (run_id, cancel) = self.claim_slot()?;
        info!(run_id = %run_id, "run admitted");

        let this = Arc::clone(self);
        let workspace = workspace.to_path_buf();
        let thread_run_id = run_id.clone();
        std::thread::spawn(move || {
            let ctx = RunContext {
                config: &this.config,
                runs_root: &this.runs_root,
                workspace: &workspace,
                run_id: &thread_run_id,
                tool: this.tool.as_ref(),
                sink: this.sink.as_ref(),
                decisions: &this.decisions,
                cancel: cancel.as_ref(),
                decision_mode: DecisionMode::Synchronous,
            };
            if let Err(err) = execute_run(&ctx, &plan, requirement.as_deref()) {
                warn!(run_id = %thread_run_id, error = %err, "run failed");
            }
            this.release_slot(&thread_run_id);
        });
        Ok(run_id)
    }

    /// Start the autobuild loop on a background thread.
    #[instrument(skip_all, fields(workspace = %request.workspace.display()))]
    pub fn start_autobuild(self: &Arc<Self>, request: AutobuildRequest) -> Result<(), AdmitError> {
        if request.workspace.as_os_str().is_empty() {
            return Err(AdmitError::WorkspaceUnset);
        }
        if !Git::new(&request.workspace).is_repository() {
            return Err(AdmitError::NotARepository);
        }
        if self.lock_active().is_some() {
            return Err(AdmitError::AnotherRunActive);
        }
        if self.autobuild_active.swap(true, Ordering::SeqCst) {
            return Err(AdmitError::AutobuildActive);
        }
        self.autobuild_cancel.store(false, Ordering::SeqCst);

        let this = Arc::clone(self);
        std::thread::spawn(move || {
            let _ = this.drive_autobuild(&request);
            this.autobuild_active.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn drive_autobuild(&self, request: &AutobuildRequest) -> AutobuildOutcome {
        let requirement = request.requirement.clone();
        let workspace = request.workspace.clone();
        run_autobuild(
            request,
            &self.autobuild_cancel,
            self.sink.as_ref(),
            |_| self.generate_plan(&requirement),
            |_, plan| {
                self.run_admitted(
                    &workspace,
                    plan,
                    Some(&requirement),
                    DecisionMode::Deferred,
                )
                .map_err(|err| anyhow::anyhow!(err))
            },
        )
    }

    /// Admit and execute a run on the calling thread.
    fn run_admitted(
        &self,
        workspace: &Path,
        plan: &Plan,
        requirement: Option<&str>,
        decision_mode: DecisionMode,
    ) -> Result<RunOutcome, AdmitError> {
        self.preflight(workspace, plan)?;
        let (run_id, cancel) = self.claim_slot()?;
        let ctx = RunContext {
            config: &self.config,
            runs_root: &self.runs_root,
            workspace,
            run_id: &run_id,
            tool: self.tool.as_ref(),
            sink: self.sink.as_ref(),
            decisions: &self.decisions,
            cancel: cancel.as_ref(),
            decision_mode,
        };
        let result = execute_run(&ctx, plan, requirement);
        self.release_slot(&run_id);
        result.map_err(AdmitError::Io)
    }

    /// Cancel the active run. Returns false when `run_id` is not the
    /// active run.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let guard = self.lock_active();
        let Some(active) = guard.as_ref() else {
            return false;
        };
        if active.run_id != run_id {
            return false;
        }
        info!(run_id, "cancel requested");
        active.cancel.store(true, Ordering::SeqCst);
        self.decisions.reject_for_cancel(run_id);
        self.sink.emit(Event::RunCancelled {
            run_id: run_id.to_string(),
        });
        true
    }

    /// Cancel the autobuild session, and the active run with it.
    pub fn cancel_autobuild(&self) -> bool {
        self.autobuild_cancel.store(true, Ordering::SeqCst);
        let active_id = self.lock_active().as_ref().map(|a| a.run_id.clone());
        if let Some(run_id) = active_id {
            self.cancel_run(&run_id);
        }
        true
    }

    /// Deliver a dependency-gate decision. Returns false when nothing is
    /// pending for the run.
    pub fn submit_decision(&self, run_id: &str, result: DecisionResult) -> bool {
        self.decisions.submit(run_id, result)
    }

    fn preflight(&self, workspace: &Path, plan: &Plan) -> Result<(), AdmitError> {
        if workspace.as_os_str().is_empty() {
            return Err(AdmitError::WorkspaceUnset);
        }
        if plan.steps.is_empty() {
            return Err(AdmitError::EmptyPlan);
        }
        if !Git::new(workspace).is_repository() {
            return Err(AdmitError::NotARepository);
        }
        Ok(())
    }

    /// Compare-and-swap admission into the single active-run slot.
    fn claim_slot(&self) -> Result<(String, Arc<AtomicBool>), AdmitError> {
        let mut guard = self.lock_active();
        if guard.is_some() {
            return Err(AdmitError::AnotherRunActive);
        }
        let run_id = generate_run_id(Utc::now());
        let cancel = Arc::new(AtomicBool::new(false));
        *guard = Some(ActiveRun {
            run_id: run_id.clone(),
            cancel: Arc::clone(&cancel),
        });
        Ok((run_id, cancel))
    }

    fn release_slot(&self, run_id: &str) {
        let mut guard = self.lock_active();
        if guard.as_ref().is_some_and(|active| active.run_id == run_id) {
            *guard = None;
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
