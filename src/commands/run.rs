//! Plan execution and result reporting.

use super::{load_plan, open_session};
use crate::Context;
use crate::cli::RunArgs;
use crate::progress::StepProgress;
use crate::runner::SystemExecutor;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use installkit::policy::RestartNeeds;
use installkit::{ExecutionMode, Plan, PlanOutcome, PlanResult, Session, StepFailure, StepKey};

/// Password prompts before giving up on a step that needs sudo.
const MAX_PASSWORD_ATTEMPTS: usize = 3;

/// Lines of stderr shown for a failed step.
const STDERR_TAIL: usize = 8;

pub fn run(ctx: &Context, args: &RunArgs) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let session = open_session(ctx)?;
    let mode = if args.dag {
        ExecutionMode::Dag
    } else {
        ExecutionMode::Linear
    };

    if !ctx.quiet {
        ui::header(&format!("Installing {}", plan.tool));
        ui::kv("Steps", &plan.steps.len().to_string());
        ui::kv("Mode", &mode.to_string());
        println!();
    }

    execute(ctx, &session, plan, mode, args.from)
}

/// Run a plan to completion, pause or failure, prompting for sudo as needed.
///
/// Each `NeedsSudo` pause asks for a password again and re-runs the plan,
/// which continues from its persisted state; a rejected password is never
/// retried silently.
pub fn execute(
    ctx: &Context,
    session: &Session<SystemExecutor>,
    mut plan: Plan,
    mode: ExecutionMode,
    mut start_from: usize,
) -> Result<()> {
    plan.ensure_id();
    let mut password: Option<String> = None;
    let mut attempts = 0;

    loop {
        let mut progress = StepProgress::new(ctx.quiet);
        let result = match mode {
            ExecutionMode::Linear => {
                session.execute_linear(&plan, password.as_deref(), start_from, &mut progress)
            }
            ExecutionMode::Dag => session.execute_dag(&plan, password.as_deref(), &mut progress),
        };
        progress.finish();
        let result = result?;

        let PlanOutcome::NeedsSudo { step } = &result.outcome else {
            return report(ctx, &result);
        };

        if attempts >= MAX_PASSWORD_ATTEMPTS {
            report(ctx, &result)?;
            bail!("No accepted sudo password after {MAX_PASSWORD_ATTEMPTS} attempts");
        }
        if password.is_some() {
            ui::warn("sudo rejected the password");
        }
        attempts += 1;
        password = Some(prompt_password(step)?);
        // Completed steps are skipped from persisted state; linear mode
        // also needs to start at the paused step.
        if let Some(position) = linear_position(&plan, step) {
            start_from = position;
        }
    }
}

fn linear_position(plan: &Plan, key: &StepKey) -> Option<usize> {
    plan.steps
        .iter()
        .enumerate()
        .position(|(position, step)| StepKey::Index(step.source_index.unwrap_or(position)) == *key)
}

fn prompt_password(step: &StepKey) -> Result<String> {
    dialoguer::Password::new()
        .with_prompt(format!("Sudo password (needed by step {step})"))
        .interact()
        .context("Failed to read password")
}

// ============================================================================
// Reporting
// ============================================================================

/// Print the outcome. Failed plans become an error so the exit code is set.
pub fn report(ctx: &Context, result: &PlanResult) -> Result<()> {
    if ctx.verbose > 0 {
        ui::section("Steps");
        for step in &result.steps {
            println!(
                "  {:<32} {}",
                ui::truncate(&step.name, 32),
                ui::format_elapsed(step.result.elapsed_ms).dimmed()
            );
        }
    }
    for step in &result.steps {
        for warning in &step.result.warnings {
            ui::warn(&format!("{}: {warning}", step.name));
        }
    }

    println!();
    match &result.outcome {
        PlanOutcome::Done => {
            ui::success(&format!(
                "{} installed ({} steps completed)",
                result.tool,
                result.completed.len()
            ));
            print_restart_needs(&result.restart_needs);
            Ok(())
        }
        PlanOutcome::Paused { reason, .. } => {
            ui::warn(reason);
            print_restart_needs(&result.restart_needs);
            println!();
            ui::hint(
                "After restarting, continue with",
                &format!("provision plans resume {}", result.plan_id),
            );
            Ok(())
        }
        PlanOutcome::NeedsSudo { step } => {
            ui::warn(&format!("Step {step} needs a sudo password"));
            ui::hint(
                "Continue with",
                &format!("provision plans resume {}", result.plan_id),
            );
            Ok(())
        }
        PlanOutcome::Failed { failures } => {
            for failure in failures {
                print_failure(failure);
            }
            if !result.rollback_plan.is_empty() {
                ui::section("Changes so far can be reverted");
                for action in &result.rollback_plan {
                    ui::dim(&action.to_string());
                }
                ui::hint(
                    "Revert with",
                    &format!("provision plans rollback {}", result.plan_id),
                );
            }
            ui::hint(
                "Retry with",
                &format!("provision plans resume {}", result.plan_id),
            );
            bail!(
                "Installing {} failed ({} step(s))",
                result.tool,
                failures.len()
            )
        }
    }
}

fn print_failure(failure: &StepFailure) {
    ui::error(&format!("{}: {}", failure.name, failure.error));

    let lines: Vec<&str> = failure.stderr.lines().collect();
    for line in &lines[lines.len().saturating_sub(STDERR_TAIL)..] {
        ui::dim(line);
    }

    if let Some(diagnosis) = &failure.diagnosis {
        ui::kv("Diagnosis", &diagnosis.suggestion);
        if !diagnosis.packages.is_empty() {
            ui::kv("Packages", &diagnosis.packages.join(", "));
        }
    }
    if let Some(remediation) = &failure.remediation {
        ui::kv("Cause", &remediation.reason);
        for option in &remediation.options {
            println!(
                "    {} {} {}",
                "→".cyan(),
                option.label,
                format!("[{}]", option.strategy).dimmed()
            );
        }
    }
    if let Some(auto) = &failure.auto_rollback {
        if auto.result.is_ok() {
            ui::info(&format!("Rolled back automatically: {}", auto.action));
        } else {
            ui::warn(&format!("Automatic rollback did not succeed: {}", auto.action));
        }
    }
    if let Some(manual) = &failure.manual_rollback {
        ui::kv("Manual rollback", &manual.to_string());
    }
}

fn print_restart_needs(needs: &RestartNeeds) {
    if needs.is_empty() {
        return;
    }
    ui::section("Restart needed");
    for reason in &needs.reasons {
        ui::dim(reason);
    }
    if !needs.service_restart.is_empty() {
        ui::kv("Services", &needs.service_restart.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use installkit::{Step, StepKind};

    fn plan() -> Plan {
        Plan::new(
            "demo",
            (0..3)
                .map(|i| Step::new(StepKind::Tool).with_command([format!("s{i}")]))
                .collect(),
        )
    }

    #[test]
    fn test_linear_position_plain_plan() {
        assert_eq!(linear_position(&plan(), &StepKey::Index(1)), Some(1));
        assert_eq!(linear_position(&plan(), &StepKey::Index(7)), None);
        assert_eq!(linear_position(&plan(), &StepKey::Id("s1".into())), None);
    }

    #[test]
    fn test_linear_position_resumed_plan() {
        let mut resumed = plan();
        resumed.steps.remove(0);
        resumed.steps[0].source_index = Some(1);
        resumed.steps[1].source_index = Some(2);
        assert_eq!(linear_position(&resumed, &StepKey::Index(2)), Some(1));
    }
}
