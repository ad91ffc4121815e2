//! Dependency-aware plan execution.
//!
//! Each round computes the ready frontier, drops steps that would contend
//! for a package-manager lock, and runs what is left: inline for a single
//! step, on a rayon pool otherwise. The round joins before results are
//! processed, so progress for a round is reported after all of its steps
//! finished.

use super::{PlanOutcome, PlanResult, Session, StepFailure, progress_id};
use crate::context::{CommandExecutor, ProgressCallback, StepStatus};
use crate::dag::{assign_identity, enforce_parallel_safety, ready_set, validate};
use crate::error::{Error, Result};
use crate::state::ExecutionMode;
use crate::types::{Plan, Step, StepKey, StepOutcome, StepResult};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};

impl<E: CommandExecutor> Session<E> {
    /// Run `plan` as a dependency graph.
    ///
    /// Invalid graphs are rejected before any state is written. A failed
    /// step blocks everything that depends on it, while independent
    /// branches keep running. A successful restart-requiring step pauses
    /// the plan after its round.
    pub fn execute_dag<P: ProgressCallback>(
        &self,
        plan: &Plan,
        sudo_password: Option<&str>,
        progress: &mut P,
    ) -> Result<PlanResult> {
        let mut plan = plan.clone();
        assign_identity(&mut plan.steps);
        let errors = validate(&plan.steps);
        if !errors.is_empty() {
            return Err(Error::InvalidGraph { errors });
        }

        let mut run = self.begin(&plan, ExecutionMode::Dag)?;
        let steps = run.plan.steps.clone();

        let mut completed: HashSet<String> = run
            .state
            .completed_steps
            .iter()
            .filter_map(|key| match key {
                StepKey::Id(id) => Some(id.clone()),
                StepKey::Index(_) => None,
            })
            .collect();
        // Failures from an earlier invocation stay failed until the plan is
        // resumed explicitly.
        let mut failed: HashSet<String> = HashSet::new();
        let mut failures = Vec::new();
        for step in &steps {
            let key = StepKey::Id(step.id_str().to_string());
            if run.state.failed_steps.contains(&key) {
                log::info!("{} failed in an earlier run; not retrying", step.display_name());
                failed.insert(step.id_str().to_string());
                failures.push(StepFailure::earlier(key, step));
            }
        }
        let mut blocked = 0;

        let settled = |completed: &HashSet<String>, failed: &HashSet<String>| {
            steps
                .iter()
                .all(|s| completed.contains(s.id_str()) || failed.contains(s.id_str()))
        };

        while !settled(&completed, &failed) {
            let doomed: Vec<&Step> = steps
                .iter()
                .filter(|s| !completed.contains(s.id_str()) && !failed.contains(s.id_str()))
                .filter(|s| {
                    s.depends_on
                        .iter()
                        .flatten()
                        .any(|dep| failed.contains(dep))
                })
                .collect();
            if !doomed.is_empty() {
                for step in doomed {
                    log::warn!("Blocking {}: a dependency failed", step.display_name());
                    progress.on_step(step.id_str(), StepStatus::Blocked);
                    failed.insert(step.id_str().to_string());
                    blocked += 1;
                    run.report(
                        StepKey::Id(step.id_str().to_string()),
                        step,
                        StepResult::skipped("dependency failed"),
                    );
                }
                continue;
            }

            let ready = ready_set(&steps, &completed, &failed);
            if ready.is_empty() {
                log::warn!(
                    "No runnable steps left in {}; the rest are blocked",
                    run.plan.plan_id
                );
                break;
            }

            let batch = enforce_parallel_safety(ready);
            log::debug!(
                "Round: {}",
                batch.iter().map(|s| s.id_str()).collect::<Vec<_>>().join(", ")
            );
            for step in &batch {
                log::info!("Starting {}", step.display_name());
                progress.on_step(step.id_str(), StepStatus::Started);
            }

            let envs: Vec<BTreeMap<String, String>> =
                batch.iter().map(|step| run.env_for(step)).collect();
            let results = self.run_round(&batch, &envs, sudo_password);

            let mut sudo_pause = None;
            let mut restart_pause = None;
            for (step, result) in batch.iter().copied().zip(results) {
                let key = StepKey::Id(step.id_str().to_string());
                let id = progress_id(&key, step);

                match result.outcome.clone() {
                    StepOutcome::Succeeded => {
                        progress.on_step(&id, StepStatus::Succeeded);
                        completed.insert(step.id_str().to_string());
                        if step.restart_required.is_required() && restart_pause.is_none() {
                            restart_pause = Some((key.clone(), step));
                        }
                        run.complete(key, step, result);
                    }
                    StepOutcome::Skipped { reason } => {
                        log::info!("Skipped {}: {reason}", step.display_name());
                        progress.on_step(&id, StepStatus::Skipped);
                        completed.insert(step.id_str().to_string());
                        run.complete(key, step, result);
                    }
                    StepOutcome::NeedsSudo => {
                        progress.on_step(&id, StepStatus::NeedsSudo);
                        sudo_pause.get_or_insert_with(|| key.clone());
                        run.report(key, step, result);
                    }
                    StepOutcome::Failed { error } => {
                        log::warn!("{} failed: {error}", step.display_name());
                        progress.on_step(&id, StepStatus::Failed);
                        failures.push(self.handle_failure(&key, step, &result, sudo_password));
                        failed.insert(step.id_str().to_string());
                        run.fail(key, step, result);
                    }
                }
            }

            self.checkpoint(&mut run)?;

            // A failure in the plan takes precedence over either pause.
            if !failures.is_empty() && (sudo_pause.is_some() || restart_pause.is_some()) {
                break;
            }
            if let Some(key) = sudo_pause {
                return self.pause(
                    run,
                    Some(key.clone()),
                    format!("{key} needs a sudo password"),
                    PlanOutcome::NeedsSudo { step: key },
                );
            }
            if let Some((key, step)) = restart_pause
                && !settled(&completed, &failed)
            {
                let reason = format!(
                    "{} requires a {} restart before continuing",
                    step.display_name(),
                    step.restart_required
                );
                let resume_from = next_step(&steps, &completed, &failed);
                return self.pause(
                    run,
                    resume_from.clone(),
                    reason.clone(),
                    PlanOutcome::Paused {
                        step: key,
                        resume_from,
                        reason,
                    },
                );
            }
        }

        let unfinished = steps
            .iter()
            .filter(|s| !completed.contains(s.id_str()) && !failed.contains(s.id_str()))
            .count();
        if failures.is_empty() && blocked == 0 && unfinished == 0 {
            self.finish_done(run)
        } else {
            let resume_from = failures.first().map(|f| f.step.clone());
            self.finish_failed(run, resume_from, failures, blocked + unfinished)
        }
    }

    /// Execute one round and join. Results keep the order of `batch`.
    fn run_round(
        &self,
        batch: &[&Step],
        envs: &[BTreeMap<String, String>],
        sudo_password: Option<&str>,
    ) -> Vec<StepResult> {
        if let ([step], [env]) = (batch, envs) {
            return vec![self.steps.execute(step, sudo_password, env)];
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(batch.len())
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                log::warn!("Failed to create thread pool ({e}); running round sequentially");
                return batch
                    .iter()
                    .zip(envs)
                    .map(|(step, env)| self.steps.execute(step, sudo_password, env))
                    .collect();
            }
        };

        pool.install(|| {
            batch
                .par_iter()
                .zip(envs.par_iter())
                .map(|(step, env)| self.steps.execute(step, sudo_password, env))
                .collect()
        })
    }
}

/// First step the next invocation will run: the head of the ready
/// frontier, or else the first unfinished step in plan order.
fn next_step(
    steps: &[Step],
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> Option<StepKey> {
    ready_set(steps, completed, failed)
        .first()
        .copied()
        .or_else(|| {
            steps
                .iter()
                .find(|s| !completed.contains(s.id_str()) && !failed.contains(s.id_str()))
        })
        .map(|step| StepKey::Id(step.id_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::super::tests::session;
    use crate::context::{NoProgress, StepStatus};
    use crate::dag::GraphError;
    use crate::error::Error;
    use crate::orchestrator::PlanOutcome;
    use crate::state::PlanStatus;
    use crate::types::{Plan, RestartKind, Step, StepKey, StepKind};
    use tempfile::TempDir;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(StepKind::Tool)
            .with_id(id)
            .with_command([format!("run-{id}")])
            .depends_on(deps.iter().copied())
    }

    fn diamond() -> Plan {
        Plan::new(
            "demo",
            vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b", "c"]),
            ],
        )
        .with_id("demo-dag")
    }

    #[test]
    fn test_diamond_runs_in_dependency_order() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);

        let result = session.execute_dag(&diamond(), None, &mut NoProgress).unwrap();

        assert!(result.is_done());
        let order: Vec<String> = mock.calls().into_iter().map(|c| c.argv[0].clone()).collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "run-a");
        assert_eq!(order[3], "run-d");
        assert!(order[1..3].contains(&"run-b".to_string()));
        assert!(order[1..3].contains(&"run-c".to_string()));
    }

    #[test]
    fn test_failure_blocks_dependents_only() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        mock.fail_on(["run-b"], 1, "broken");
        let mut plan = diamond();
        plan.steps.push(step("e", &["c"]));

        let mut seen = Vec::new();
        let mut progress = |id: &str, status: StepStatus| seen.push((id.to_string(), status));
        let result = session.execute_dag(&plan, None, &mut progress).unwrap();

        assert!(!mock.ran(["run-d"]));
        assert!(mock.ran(["run-e"]));
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].step, StepKey::Id("b".into()));
        assert!(seen.contains(&("d".to_string(), StepStatus::Blocked)));

        let blocked = result
            .steps
            .iter()
            .find(|r| r.step == StepKey::Id("d".into()))
            .unwrap();
        assert!(blocked.result.is_skipped());

        let state = session.plans().get("demo-dag").unwrap();
        assert_eq!(state.status, PlanStatus::Failed);
        assert!(state.completed_steps.contains(&StepKey::Id("e".into())));
    }

    #[test]
    fn test_invalid_graph_is_rejected_before_running() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        let plan = Plan::new("demo", vec![step("a", &["b"]), step("b", &["a"])]).with_id("loop");

        let err = session.execute_dag(&plan, None, &mut NoProgress).unwrap_err();
        match err {
            Error::InvalidGraph { errors } => {
                assert!(matches!(errors[0], GraphError::Cycle(_)));
            }
            other => panic!("expected invalid graph, got {other}"),
        }
        assert!(mock.calls().is_empty());
        assert!(session.plans().load("loop").unwrap().is_none());
    }

    #[test]
    fn test_package_managers_never_share_a_round() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        let plan = Plan::new(
            "demo",
            vec![
                Step::new(StepKind::Tool)
                    .with_id("one")
                    .with_command(["apt-get", "install", "-y", "one"])
                    .depends_on(Vec::<String>::new()),
                Step::new(StepKind::Tool)
                    .with_id("two")
                    .with_command(["apt-get", "install", "-y", "two"])
                    .depends_on(Vec::<String>::new()),
            ],
        );

        let mut rounds = Vec::new();
        let mut progress = |id: &str, status: StepStatus| {
            if status == StepStatus::Started {
                rounds.push(id.to_string());
            }
        };
        let result = session.execute_dag(&plan, None, &mut progress).unwrap();

        assert!(result.is_done());
        assert_eq!(mock.count(["apt-get"]), 2);
        assert_eq!(rounds, vec!["one", "two"]);
    }

    #[test]
    fn test_restart_pauses_by_id() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        let mut plan = diamond();
        plan.steps[0] = step("a", &[]).with_restart(RestartKind::Shell);

        let result = session.execute_dag(&plan, None, &mut NoProgress).unwrap();

        assert!(matches!(
            &result.outcome,
            PlanOutcome::Paused { step, resume_from, .. }
                if *step == StepKey::Id("a".into())
                    && *resume_from == Some(StepKey::Id("b".into()))
        ));
        assert!(!mock.ran(["run-b"]));
        let state = session.plans().get("demo-dag").unwrap();
        assert_eq!(state.resume_from, Some(StepKey::Id("b".into())));

        let remaining = session.resume("demo-dag").unwrap();
        assert_eq!(remaining.steps.len(), 3);
        let result = session.execute_dag(&remaining, None, &mut NoProgress).unwrap();
        assert!(result.is_done());
        assert_eq!(mock.count(["run-a"]), 1);
        assert_eq!(result.completed.len(), 4);
    }

    #[test]
    fn test_needs_sudo_pauses_after_round() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        let mut plan = diamond();
        plan.steps[1] = step("b", &["a"]).with_sudo();

        let result = session.execute_dag(&plan, None, &mut NoProgress).unwrap();

        assert_eq!(
            result.outcome,
            PlanOutcome::NeedsSudo {
                step: StepKey::Id("b".into())
            }
        );
        assert!(mock.ran(["run-c"]));
        assert!(!mock.ran(["run-d"]));
        let state = session.plans().get("demo-dag").unwrap();
        assert_eq!(state.resume_from, Some(StepKey::Id("b".into())));
    }

    /// a, b -> a (fails), c -> a, d -> b, e -> c (needs sudo)
    fn failing_branch_with_sudo() -> Plan {
        Plan::new(
            "demo",
            vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]),
                step("d", &["b"]),
                step("e", &["c"]).with_sudo(),
            ],
        )
        .with_id("demo-branches")
    }

    #[test]
    fn test_failure_wins_over_sudo_pause() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        mock.fail_on(["run-b"], 1, "broken");

        let result = session
            .execute_dag(&failing_branch_with_sudo(), None, &mut NoProgress)
            .unwrap();

        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].step, StepKey::Id("b".into()));
        assert!(!mock.ran(["run-d"]));
        assert!(!mock.ran(["run-e"]));

        let state = session.plans().get("demo-branches").unwrap();
        assert_eq!(state.status, PlanStatus::Failed);
        assert!(state.error.is_some());
        assert_eq!(state.resume_from, Some(StepKey::Id("b".into())));
        assert!(state.failed_steps.contains(&StepKey::Id("b".into())));
    }

    #[test]
    fn test_failure_wins_over_restart_pause() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        mock.fail_on(["run-b"], 1, "broken");
        let plan = Plan::new(
            "demo",
            vec![
                step("a", &[]),
                step("b", &["a"]),
                step("c", &["a"]).with_restart(RestartKind::Shell),
                step("d", &["c"]),
            ],
        )
        .with_id("demo-restart");

        let result = session.execute_dag(&plan, None, &mut NoProgress).unwrap();

        assert_eq!(result.failures().len(), 1);
        assert!(!mock.ran(["run-d"]));
        let state = session.plans().get("demo-restart").unwrap();
        assert_eq!(state.status, PlanStatus::Failed);
        assert_eq!(state.resume_from, Some(StepKey::Id("b".into())));
    }

    #[test]
    fn test_rerun_does_not_retry_failed_step() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        mock.fail_on(["run-b"], 1, "broken");
        let plan = failing_branch_with_sudo();

        session.execute_dag(&plan, None, &mut NoProgress).unwrap();
        let result = session.execute_dag(&plan, Some("pw"), &mut NoProgress).unwrap();

        assert_eq!(mock.count(["run-b"]), 1);
        assert!(mock.ran(["run-e"]));
        assert!(!mock.ran(["run-d"]));
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].step, StepKey::Id("b".into()));
        assert!(result.failures()[0].error.contains("earlier run"));

        let state = session.plans().get("demo-branches").unwrap();
        assert!(state.completed_steps.contains(&StepKey::Id("e".into())));
        assert!(state.failed_steps.contains(&StepKey::Id("b".into())));
    }

    #[test]
    fn test_explicit_resume_retries_failed_step() {
        let tmp = TempDir::new().unwrap();
        let (mock, session) = session(&tmp);
        mock.fail_on(["run-b"], 1, "broken");

        session
            .execute_dag(&failing_branch_with_sudo(), None, &mut NoProgress)
            .unwrap();
        let remaining = session.resume("demo-branches").unwrap();
        session
            .execute_dag(&remaining, Some("pw"), &mut NoProgress)
            .unwrap();

        assert_eq!(mock.count(["run-b"]), 2);
        assert_eq!(mock.count(["run-a"]), 1);
        assert_eq!(mock.count(["run-c"]), 1);
    }
}
