//! Offline plan checks. Nothing is executed.

use super::load_plan;
use crate::Context;
use crate::ui;
use anyhow::{Result, bail};
use installkit::policy::{
    check_version_constraint, find_placeholders, render_template, validate_inputs,
};
use installkit::{Plan, StepKind, dag};
use std::path::Path;

pub fn run(ctx: &Context, path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    let problems = check_plan(&plan);

    if problems.is_empty() {
        if !ctx.quiet {
            ui::success(&format!(
                "{} is valid ({} steps)",
                path.display(),
                plan.steps.len()
            ));
        }
        return Ok(());
    }

    for problem in &problems {
        ui::error(problem);
    }
    bail!("{} problem(s) in {}", problems.len(), path.display())
}

/// Everything wrong with a plan that can be known without running it.
pub fn check_plan(plan: &Plan) -> Vec<String> {
    let mut problems = Vec::new();
    if plan.steps.is_empty() {
        problems.push("plan has no steps".to_string());
        return problems;
    }

    let mut steps = plan.steps.clone();
    dag::assign_identity(&mut steps);
    problems.extend(dag::validate(&steps).iter().map(ToString::to_string));

    for step in &steps {
        let name = step.id_str();
        match &step.kind {
            StepKind::Unknown => problems.push(format!("{name}: unknown step type")),
            StepKind::Config {
                template, inputs, ..
            } => {
                problems.extend(
                    validate_inputs(inputs)
                        .into_iter()
                        .map(|e| format!("{name}: {e}")),
                );
                for placeholder in find_placeholders(&render_template(template, inputs)) {
                    problems.push(format!("{name}: no value for {{{placeholder}}}"));
                }
            }
            StepKind::GithubRelease {
                version: Some(version),
                constraint: Some(constraint),
                ..
            } => {
                let check = check_version_constraint(version, constraint);
                if !check.valid {
                    problems.push(format!("{name}: {}", check.message));
                }
            }
            StepKind::RepoSetup
            | StepKind::Tool
            | StepKind::PostInstall
            | StepKind::Verify
            | StepKind::Build
            | StepKind::Install
            | StepKind::Cleanup
                if step.command.is_empty() =>
            {
                problems.push(format!("{name}: {} step has no command", step.kind));
            }
            _ => {}
        }
    }
    problems
}
