//! Sequential plan execution.

use super::{PlanOutcome, PlanResult, Session, progress_id};
use crate::context::{CommandExecutor, ProgressCallback, StepStatus};
use crate::error::Result;
use crate::state::ExecutionMode;
use crate::types::{Plan, StepKey, StepOutcome};

impl<E: CommandExecutor> Session<E> {
    /// Run `plan` one step at a time, starting at position `start_from`.
    ///
    /// Steps are keyed by their original index, so a resumed plan (whose
    /// steps carry `source_index`) continues the same persisted state. The
    /// run stops at the first failure, at a missing sudo password, and
    /// right after a restart-requiring step that is not the last one.
    pub fn execute_linear<P: ProgressCallback>(
        &self,
        plan: &Plan,
        sudo_password: Option<&str>,
        start_from: usize,
        progress: &mut P,
    ) -> Result<PlanResult> {
        let mut run = self.begin(plan, ExecutionMode::Linear)?;
        let steps = run.plan.steps.clone();
        let total = steps.len();
        log::info!(
            "Installing {} ({} steps, plan {})",
            run.plan.tool,
            total,
            run.plan.plan_id
        );

        for (position, step) in steps.iter().enumerate().skip(start_from) {
            let index = step.source_index.unwrap_or(position);
            let key = StepKey::Index(index);
            let id = progress_id(&key, step);

            progress.on_step(&id, StepStatus::Started);
            log::info!("[{}/{}] {}", position + 1, total, step.display_name());

            let env = run.env_for(step);
            let result = self.steps.execute(step, sudo_password, &env);

            match result.outcome.clone() {
                StepOutcome::Succeeded => {
                    progress.on_step(&id, StepStatus::Succeeded);
                    run.complete(key.clone(), step, result);

                    if step.restart_required.is_required() {
                        if position + 1 < total {
                            let next = StepKey::Index(index + 1);
                            let reason = format!(
                                "{} requires a {} restart before continuing",
                                step.display_name(),
                                step.restart_required
                            );
                            return self.pause(
                                run,
                                Some(next.clone()),
                                reason.clone(),
                                PlanOutcome::Paused {
                                    step: key,
                                    resume_from: Some(next),
                                    reason,
                                },
                            );
                        }
                        log::info!(
                            "{} requires a {} restart; it is the last step",
                            step.display_name(),
                            step.restart_required
                        );
                    }
                }
                StepOutcome::Skipped { reason } => {
                    log::info!("Skipped {}: {reason}", step.display_name());
                    progress.on_step(&id, StepStatus::Skipped);
                    run.complete(key, step, result);
                }
                StepOutcome::NeedsSudo => {
                    progress.on_step(&id, StepStatus::NeedsSudo);
                    run.report(key.clone(), step, result);
                    return self.pause(
                        run,
                        Some(key.clone()),
                        format!("{} needs a sudo password", step.display_name()),
                        PlanOutcome::NeedsSudo { step: key },
                    );
                }
                StepOutcome::Failed { error } => {
                    log::warn!("{} failed: {error}", step.display_name());
                    progress.on_step(&id, StepStatus::Failed);
                    let failure = self.handle_failure(&key, step, &result, sudo_password);
                    run.fail(key.clone(), step, result);
                    return self.finish_failed(run, Some(key), vec![failure], 0);
                }
            }

            self.checkpoint(&mut run)?;
        }

        self.finish_done(run)
    }
}
