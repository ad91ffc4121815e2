//! Plan orchestration
//!
//! A [`Session`] owns one install session: the step executor, the plan and
//! chain stores, and the session options. It runs plans in linear or DAG
//! mode, decides what happens when a step fails, pauses before anything
//! runs after a restart-requiring step, and checkpoints state at every step
//! boundary.
//!
//! Step failures are not errors. They come back inside [`PlanResult`]; the
//! `Err` side is reserved for invalid graphs and state directory problems.

mod dag;
mod escalation;
mod linear;

pub use escalation::{EscalationStep, InstallOutcome};

use crate::context::CommandExecutor;
use crate::error::{Error, Result};
use crate::executor::{DEFAULT_STEP_TIMEOUT, StepExecutor};
use crate::policy::{
    BuildDiagnosis, RestartNeeds, RollbackAction, analyze_build_failure, batch_restarts,
    detect_restart_needs, effective_risk, generate_rollback_plan,
};
use crate::state::{ExecutionMode, PlanState, PlanStatus};
use crate::store::{StateDirs, StateStore, validate_id};
use crate::chain::RemediationChain;
use crate::types::{Plan, Remediation, Risk, Step, StepKey, StepKind, StepResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Timeout for steps that do not declare their own.
    pub step_timeout: Duration,
    /// Depth bound for new remediation chains.
    pub max_chain_depth: usize,
    /// Move finished plans to `archive/` right away.
    pub archive_on_done: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_chain_depth: crate::chain::DEFAULT_MAX_DEPTH,
            archive_on_done: true,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// A medium-risk step's own rollback, run right after it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRollback {
    pub action: RollbackAction,
    pub result: StepResult,
}

/// Everything known about one failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: StepKey,
    pub name: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<BuildDiagnosis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback: Option<AutoRollback>,
    /// The step's own rollback, left for the user to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_rollback: Option<RollbackAction>,
}

impl StepFailure {
    /// A failure recorded by an earlier invocation of the same plan.
    fn earlier(key: StepKey, step: &Step) -> Self {
        Self {
            step: key,
            name: step.display_name(),
            error: "failed in an earlier run; resume the plan to retry it".to_string(),
            stderr: String::new(),
            diagnosis: None,
            remediation: None,
            auto_rollback: None,
            manual_rollback: None,
        }
    }
}

/// Result of one executed (or blocked) step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: StepKey,
    pub name: String,
    #[serde(flatten)]
    pub result: StepResult,
}

/// How a plan invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanOutcome {
    /// Every step completed.
    Done,
    /// Stopped after `step` until the caller resumes.
    Paused {
        step: StepKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_from: Option<StepKey>,
        reason: String,
    },
    /// Re-run with a sudo password; nothing after `step` ran.
    NeedsSudo { step: StepKey },
    /// At least one step failed.
    Failed { failures: Vec<StepFailure> },
}

/// What the caller gets back from a plan invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan_id: String,
    pub tool: String,
    pub outcome: PlanOutcome,
    /// Every completed step, including ones from earlier invocations.
    pub completed: Vec<StepKey>,
    /// Steps run (or blocked) in this invocation, in order.
    pub steps: Vec<StepReport>,
    /// Reverse actions for what has changed, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_plan: Vec<RollbackAction>,
    /// Cache keys the caller should refresh.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidates: Vec<String>,
    #[serde(default)]
    pub restart_needs: RestartNeeds,
    /// Restart and notification steps derived from `restart_needs`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart_steps: Vec<Step>,
}

impl PlanResult {
    pub fn is_done(&self) -> bool {
        matches!(self.outcome, PlanOutcome::Done)
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.outcome,
            PlanOutcome::Paused { .. } | PlanOutcome::NeedsSudo { .. }
        )
    }

    pub fn failures(&self) -> &[StepFailure] {
        match &self.outcome {
            PlanOutcome::Failed { failures } => failures,
            _ => &[],
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One install session: executor, state stores and options.
pub struct Session<E> {
    steps: StepExecutor<E>,
    plans: StateStore<PlanState>,
    chains: StateStore<RemediationChain>,
    options: SessionOptions,
}

impl<E: CommandExecutor> Session<E> {
    /// Create a session persisting under `dirs`.
    pub fn new(executor: E, dirs: &StateDirs, options: SessionOptions) -> Self {
        Self {
            steps: StepExecutor::new(executor, options.step_timeout),
            plans: StateStore::new(dirs.plans_dir()),
            chains: StateStore::new(dirs.chains_dir()),
            options,
        }
    }

    pub fn plans(&self) -> &StateStore<PlanState> {
        &self.plans
    }

    pub fn chains(&self) -> &StateStore<RemediationChain> {
        &self.chains
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn step_executor(&self) -> &StepExecutor<E> {
        &self.steps
    }

    /// The plan that finishes a persisted plan. See [`crate::store::resume`].
    pub fn resume(&self, plan_id: &str) -> Result<Plan> {
        crate::store::resume(&self.plans, plan_id)
    }

    /// Mark a persisted plan cancelled and archive it.
    ///
    /// Only affects the stored state; a step already running elsewhere is
    /// not interrupted.
    pub fn cancel_plan(&self, plan_id: &str) -> Result<PlanState> {
        let mut state = self.plans.get(plan_id)?;
        if state.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: state.status.to_string(),
                action: "cancel",
            });
        }
        state.status = PlanStatus::Cancelled;
        state.touch();
        self.plans.save(&state)?;
        self.plans.archive(plan_id)?;
        log::info!("Cancelled plan {plan_id}");
        Ok(state)
    }

    /// Run the stored rollback plan of a plan, newest change first.
    ///
    /// Stops at the first action that does not succeed.
    pub fn apply_rollback(
        &self,
        plan_id: &str,
        sudo_password: Option<&str>,
    ) -> Result<Vec<(RollbackAction, StepResult)>> {
        let state = match self.plans.load(plan_id)? {
            Some(state) => state,
            None => self
                .plans
                .load_archived(plan_id)?
                .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?,
        };

        let mut applied = Vec::new();
        for action in &state.rollback_plan {
            log::info!("Rolling back {}", action.label);
            let result = self.steps.run_rollback(action, sudo_password);
            let ok = result.is_ok();
            applied.push((action.clone(), result));
            if !ok {
                log::warn!("Rollback of {} did not succeed; stopping", action.label);
                break;
            }
        }
        Ok(applied)
    }

    /// Load or create the state for `plan` and mark it running.
    fn begin(&self, plan: &Plan, mode: ExecutionMode) -> Result<Run> {
        let mut plan = plan.clone();
        plan.ensure_id();
        validate_id(&plan.plan_id)?;

        let mut state = match self.plans.load(&plan.plan_id)? {
            Some(existing) if existing.mode == mode && !existing.status.is_terminal() => {
                log::debug!(
                    "Continuing {} ({} steps already completed)",
                    existing.plan_id,
                    existing.completed_steps.len()
                );
                existing
            }
            Some(existing) => {
                log::warn!(
                    "Plan {} was stored as {} {}; starting over",
                    existing.plan_id,
                    existing.status,
                    existing.mode
                );
                let mut fresh = PlanState::new(&plan, mode);
                fresh.created_at = existing.created_at;
                fresh
            }
            None => PlanState::new(&plan, mode),
        };

        if plan.resumed && state.status == PlanStatus::Failed && !state.failed_steps.is_empty() {
            log::info!(
                "Retrying {} failed step(s) of {}",
                state.failed_steps.len(),
                state.plan_id
            );
            state.failed_steps.clear();
        }

        state.status = PlanStatus::Running;
        state.pause_reason = None;
        state.resume_from = None;
        state.error = None;
        state.touch();
        self.plans.save(&state)?;

        Ok(Run::new(plan, state))
    }

    fn checkpoint(&self, run: &mut Run) -> Result<()> {
        run.state.rollback_plan = run.rollback_plan();
        run.state.touch();
        self.plans.save(&run.state)?;
        Ok(())
    }

    /// Diagnose a failed step and apply the rollback policy for its risk.
    fn handle_failure(
        &self,
        key: &StepKey,
        step: &Step,
        result: &StepResult,
        sudo_password: Option<&str>,
    ) -> StepFailure {
        let diagnosis = if matches!(step.kind, StepKind::Tool | StepKind::Build) {
            analyze_build_failure(&result.stderr)
        } else {
            None
        };
        if let Some(diagnosis) = &diagnosis {
            log::info!("Diagnosis for {}: {}", step.display_name(), diagnosis.suggestion);
        }

        let risk = effective_risk(step);
        let own = RollbackAction::for_step(key.clone(), step);
        let (auto_rollback, manual_rollback) = match own {
            Some(action) if risk == Risk::Medium => {
                log::info!("Rolling back {} automatically", step.display_name());
                let rollback = self.steps.run_rollback(&action, sudo_password);
                if !rollback.is_ok() {
                    log::warn!(
                        "Automatic rollback of {} did not succeed",
                        step.display_name()
                    );
                }
                (
                    Some(AutoRollback {
                        action,
                        result: rollback,
                    }),
                    None,
                )
            }
            Some(action) => {
                if risk == Risk::High {
                    log::warn!(
                        "{} is high risk; leaving its rollback to the user",
                        step.display_name()
                    );
                }
                (None, Some(action))
            }
            None => (None, None),
        };

        StepFailure {
            step: key.clone(),
            name: step.display_name(),
            error: result.error().unwrap_or("step failed").to_string(),
            stderr: result.stderr.clone(),
            diagnosis,
            remediation: result.remediation.clone(),
            auto_rollback,
            manual_rollback,
        }
    }

    /// Persist a pause and build the result.
    fn pause(
        &self,
        mut run: Run,
        resume_from: Option<StepKey>,
        reason: String,
        outcome: PlanOutcome,
    ) -> Result<PlanResult> {
        log::info!("Pausing {}: {reason}", run.state.plan_id);
        run.state.status = PlanStatus::Paused;
        run.state.pause_reason = Some(reason);
        run.state.resume_from = resume_from;
        self.checkpoint(&mut run)?;
        Ok(run.into_result(outcome))
    }

    fn finish_failed(
        &self,
        mut run: Run,
        resume_from: Option<StepKey>,
        failures: Vec<StepFailure>,
        blocked: usize,
    ) -> Result<PlanResult> {
        let mut messages: Vec<String> = failures
            .iter()
            .map(|f| format!("{}: {}", f.name, f.error))
            .collect();
        if blocked > 0 {
            messages.push(format!("{blocked} step(s) blocked by failed dependencies"));
        }
        run.state.status = PlanStatus::Failed;
        run.state.error = Some(messages.join("; "));
        run.state.resume_from = resume_from;
        self.checkpoint(&mut run)?;
        Ok(run.into_result(PlanOutcome::Failed { failures }))
    }

    fn finish_done(&self, mut run: Run) -> Result<PlanResult> {
        run.state.status = PlanStatus::Done;
        run.state.pause_reason = None;
        run.state.resume_from = None;
        self.checkpoint(&mut run)?;
        if self.options.archive_on_done {
            self.plans.archive(&run.state.plan_id)?;
        }
        log::info!("Plan {} done", run.state.plan_id);

        let tool = run.state.tool.clone();
        let mut result = run.into_result(PlanOutcome::Done);
        result.invalidates = vec!["tool_detection".to_string(), format!("tool:{tool}")];
        Ok(result)
    }
}

// ============================================================================
// Run bookkeeping
// ============================================================================

/// Mutable bookkeeping for one invocation.
struct Run {
    plan: Plan,
    state: PlanState,
    /// Steps that changed the system, in execution order.
    executed: Vec<(StepKey, Step)>,
    reports: Vec<StepReport>,
    /// A PATH-mutating step has succeeded, so `post_env` applies.
    path_mutated: bool,
}

impl Run {
    fn new(plan: Plan, state: PlanState) -> Self {
        let executed: Vec<(StepKey, Step)> = state
            .steps
            .iter()
            .enumerate()
            .filter_map(|(position, step)| {
                let key = state_key(state.mode, position, step);
                state
                    .completed_steps
                    .contains(&key)
                    .then(|| (key, step.clone()))
            })
            .collect();
        let path_mutated = executed.iter().any(|(_, step)| step.kind.mutates_path());

        Self {
            plan,
            state,
            executed,
            reports: Vec::new(),
            path_mutated,
        }
    }

    /// Environment overrides for `step`.
    fn env_for(&self, step: &Step) -> BTreeMap<String, String> {
        if self.path_mutated && step.kind.consumes_post_env() {
            self.plan.post_env.clone()
        } else {
            BTreeMap::new()
        }
    }

    fn report(&mut self, key: StepKey, step: &Step, result: StepResult) {
        self.reports.push(StepReport {
            step: key,
            name: step.display_name(),
            result,
        });
    }

    /// Record a succeeded or skipped step. Only successes count as changes.
    fn complete(&mut self, key: StepKey, step: &Step, result: StepResult) {
        let changed = result.is_ok();
        self.state.failed_steps.remove(&key);
        self.state.completed_steps.insert(key.clone());
        if changed {
            self.executed.push((key.clone(), step.clone()));
            if step.kind.mutates_path() {
                self.path_mutated = true;
            }
        }
        self.report(key, step, result);
    }

    fn fail(&mut self, key: StepKey, step: &Step, result: StepResult) {
        self.state.failed_steps.insert(key.clone());
        self.report(key, step, result);
    }

    fn rollback_plan(&self) -> Vec<RollbackAction> {
        let completed: Vec<(StepKey, &Step)> = self
            .executed
            .iter()
            .map(|(key, step)| (key.clone(), step))
            .collect();
        generate_rollback_plan(&completed)
    }

    fn into_result(self, outcome: PlanOutcome) -> PlanResult {
        let changed: Vec<&Step> = self.executed.iter().map(|(_, step)| step).collect();
        let restart_needs = detect_restart_needs(&self.plan, &changed);
        let restart_steps = batch_restarts(&restart_needs);

        PlanResult {
            plan_id: self.state.plan_id.clone(),
            tool: self.state.tool.clone(),
            outcome,
            completed: self.state.completed_steps.iter().cloned().collect(),
            steps: self.reports,
            rollback_plan: self.state.rollback_plan,
            invalidates: Vec::new(),
            restart_needs,
            restart_steps,
        }
    }
}

/// Key of a stored step: its original position (linear) or its id (DAG).
fn state_key(mode: ExecutionMode, position: usize, step: &Step) -> StepKey {
    match mode {
        ExecutionMode::Linear => StepKey::Index(step.source_index.unwrap_or(position)),
        ExecutionMode::Dag => StepKey::Id(step.id_str().to_string()),
    }
}

/// Name reported to progress callbacks.
fn progress_id(key: &StepKey, step: &Step) -> String {
    step.id.clone().unwrap_or_else(|| key.to_string())
}
