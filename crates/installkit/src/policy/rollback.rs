//! Rollback plan derivation.

use crate::types::{Step, StepKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One reverse action in a rollback plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub step: StepKey,
    pub label: String,
    pub command: Vec<String>,
    pub needs_sudo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sudo = if self.needs_sudo { "sudo " } else { "" };
        write!(f, "{}: {}{}", self.label, sudo, self.command.join(" "))?;
        if let Some(description) = &self.description {
            write!(f, " ({description})")?;
        }
        Ok(())
    }
}

impl RollbackAction {
    /// The reverse action a step declares, if any.
    pub fn for_step(key: StepKey, step: &Step) -> Option<Self> {
        let rollback = step.rollback.as_ref()?;
        if rollback.command.is_empty() {
            return None;
        }
        Some(Self {
            step: key,
            label: step.display_name(),
            command: rollback.command.clone(),
            needs_sudo: rollback.needs_sudo || step.needs_sudo,
            description: rollback.description.clone(),
        })
    }
}

/// Collect declared rollbacks of completed steps, newest first.
///
/// `completed` is in execution order. Steps without a rollback are
/// irreversible and simply left out.
pub fn generate_rollback_plan(completed: &[(StepKey, &Step)]) -> Vec<RollbackAction> {
    completed
        .iter()
        .rev()
        .filter_map(|(key, step)| RollbackAction::for_step(key.clone(), step))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepKind;

    #[test]
    fn test_rollback_plan_is_reversed() {
        let steps: Vec<Step> = (0..5)
            .map(|i| {
                let step = Step::new(StepKind::Tool).with_id(format!("s{i}"));
                if i == 2 || i == 4 {
                    step.with_rollback(["undo", &i.to_string()])
                } else {
                    step
                }
            })
            .collect();
        let completed: Vec<(StepKey, &Step)> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (StepKey::Index(i), s))
            .collect();

        let plan = generate_rollback_plan(&completed);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].step, StepKey::Index(4));
        assert_eq!(plan[0].command, vec!["undo", "4"]);
        assert_eq!(plan[1].step, StepKey::Index(2));
    }

    #[test]
    fn test_rollback_inherits_step_sudo() {
        let step = Step::new(StepKind::Packages {
            packages: vec!["jq".into()],
            package_manager: Some("apt".into()),
        })
        .with_id("pkgs")
        .with_sudo()
        .with_rollback(["apt-get", "remove", "-y", "jq"]);

        let plan = generate_rollback_plan(&[(StepKey::Id("pkgs".into()), &step)]);
        assert!(plan[0].needs_sudo);
        assert_eq!(plan[0].to_string(), "pkgs: sudo apt-get remove -y jq");
    }

    #[test]
    fn test_empty_rollback_command_is_ignored() {
        let mut step = Step::new(StepKind::Tool).with_rollback(Vec::<String>::new());
        step.id = Some("x".into());
        assert!(generate_rollback_plan(&[(StepKey::Index(0), &step)]).is_empty());
    }
}
