//! Persisted plan commands.

use super::open_session;
use super::run;
use crate::Context;
use crate::cli::PlansCommand;
use crate::runner::SystemExecutor;
use crate::ui;
use anyhow::{Context as _, Result, bail};
use colored::{ColoredString, Colorize};
use dialoguer::Confirm;
use installkit::{ExecutionMode, PlanState, PlanStatus, Session, StateStore, StepKey};

pub fn run(ctx: &Context, cmd: PlansCommand) -> Result<()> {
    let session = open_session(ctx)?;
    match cmd {
        PlansCommand::List { all } => list(&session, all),
        PlansCommand::Show { id, json } => show(&session, &id, json),
        PlansCommand::Resume { id } => resume(ctx, &session, &id),
        PlansCommand::Cancel { id } => {
            session.cancel_plan(&id)?;
            ui::success(&format!("Cancelled and archived {id}"));
            Ok(())
        }
        PlansCommand::Archive { id } => {
            let path = session.plans().archive(&id)?;
            ui::success(&format!("Archived {id}"));
            ui::dim(&path.display().to_string());
            Ok(())
        }
        PlansCommand::Rollback { id, yes } => rollback(&session, &id, yes),
    }
}

fn list(session: &Session<SystemExecutor>, all: bool) -> Result<()> {
    let mut plans = session.plans().list()?;
    if all {
        let archived = StateStore::<PlanState>::new(session.plans().archive_dir());
        plans.extend(archived.list()?);
    }

    if plans.is_empty() {
        ui::info("No install plans");
        return Ok(());
    }

    ui::header("Install Plans");
    for state in &plans {
        println!(
            "  {:<36} {:<16} {:<10} {:>3}/{:<3} {}",
            ui::truncate(&state.plan_id, 36),
            ui::truncate(&state.tool, 16),
            status_label(state.status),
            state.completed_steps.len(),
            state.total_steps(),
            state
                .updated_at
                .format("%Y-%m-%d %H:%M")
                .to_string()
                .dimmed()
        );
    }
    Ok(())
}

fn show(session: &Session<SystemExecutor>, id: &str, json: bool) -> Result<()> {
    let state = find(session, id)?;

    if json {
        let doc = serde_json::to_string_pretty(&state).context("Failed to encode plan state")?;
        println!("{doc}");
        return Ok(());
    }

    ui::header(&format!("Plan {}", state.plan_id));
    ui::kv("Tool", &state.tool);
    ui::kv("Status", &status_label(state.status).to_string());
    ui::kv("Mode", &state.mode.to_string());
    ui::kv(
        "Progress",
        &format!("{}/{}", state.completed_steps.len(), state.total_steps()),
    );
    ui::kv("Created", &state.created_at.to_rfc3339());
    ui::kv("Updated", &state.updated_at.to_rfc3339());
    if let Some(reason) = &state.pause_reason {
        ui::kv("Paused", reason);
    }
    if let Some(resume_from) = &state.resume_from {
        ui::kv("Resume from", &resume_from.to_string());
    }
    if let Some(error) = &state.error {
        ui::kv("Error", error);
    }

    ui::section("Steps");
    for (position, step) in state.steps.iter().enumerate() {
        let key = match state.mode {
            ExecutionMode::Linear => StepKey::Index(step.source_index.unwrap_or(position)),
            ExecutionMode::Dag => StepKey::Id(step.id_str().to_string()),
        };
        let mark = if state.is_completed(&key) {
            "✓".green()
        } else if state.failed_steps.contains(&key) {
            "✗".red()
        } else {
            "·".dimmed()
        };
        println!(
            "  {} {:<6} {} {}",
            mark,
            key.to_string(),
            step.display_name(),
            format!("[{}]", step.kind).dimmed()
        );
    }

    if !state.rollback_plan.is_empty() {
        ui::section("Rollback plan");
        for action in &state.rollback_plan {
            ui::dim(&action.to_string());
        }
    }
    Ok(())
}

fn resume(ctx: &Context, session: &Session<SystemExecutor>, id: &str) -> Result<()> {
    let state = session.plans().get(id)?;
    let plan = session.resume(id)?;
    if !ctx.quiet {
        ui::header(&format!("Resuming {}", state.tool));
        ui::kv(
            "Remaining",
            &format!("{} of {} steps", plan.steps.len(), state.total_steps()),
        );
        println!();
    }
    run::execute(ctx, session, plan, state.mode, 0)
}

fn rollback(session: &Session<SystemExecutor>, id: &str, yes: bool) -> Result<()> {
    let state = find(session, id)?;
    if state.rollback_plan.is_empty() {
        ui::info("Nothing to roll back");
        return Ok(());
    }

    ui::header(&format!("Rollback of {}", state.plan_id));
    for action in &state.rollback_plan {
        ui::dim(&action.to_string());
    }
    println!();

    if !yes
        && !Confirm::new()
            .with_prompt("Run these actions now?")
            .default(false)
            .interact()
            .context("Failed to read user input")?
    {
        ui::info("Rollback skipped");
        return Ok(());
    }

    let password = if state.rollback_plan.iter().any(|a| a.needs_sudo) {
        Some(
            dialoguer::Password::new()
                .with_prompt("Sudo password")
                .interact()
                .context("Failed to read password")?,
        )
    } else {
        None
    };

    let applied = session.apply_rollback(id, password.as_deref())?;
    for (action, result) in &applied {
        if result.is_ok() {
            ui::success(&action.label);
        } else {
            ui::error(&format!(
                "{}: {}",
                action.label,
                result.error().unwrap_or("needs sudo")
            ));
        }
    }

    if applied.len() < state.rollback_plan.len() || applied.iter().any(|(_, r)| !r.is_ok()) {
        bail!(
            "Rollback stopped after {} of {} actions",
            applied.len(),
            state.rollback_plan.len()
        );
    }
    Ok(())
}

/// A live plan, or an archived one
fn find(session: &Session<SystemExecutor>, id: &str) -> Result<PlanState> {
    if let Some(state) = session.plans().load(id)? {
        return Ok(state);
    }
    Ok(session
        .plans()
        .load_archived(id)?
        .ok_or_else(|| installkit::Error::PlanNotFound(id.to_string()))?)
}

fn status_label(status: PlanStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        PlanStatus::Done => text.green(),
        PlanStatus::Failed => text.red(),
        PlanStatus::Paused => text.yellow(),
        PlanStatus::Running => text.cyan(),
        PlanStatus::Pending | PlanStatus::Cancelled => text.dimmed(),
    }
}
