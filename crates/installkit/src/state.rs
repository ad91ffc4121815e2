//! Persisted plan state.

use crate::policy::RollbackAction;
use crate::store::Persisted;
use crate::types::{Plan, REDACTED, Step, StepKey, StepKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of a persisted plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    /// Waiting for a restart or a sudo password.
    Paused,
    Done,
    /// A step failed. Still resumable.
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Terminal plans are archived and never resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// How a plan was executed. Decides whether completed steps are keyed by
/// position or by id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Linear,
    Dag,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Dag => write!(f, "dag"),
        }
    }
}

// ============================================================================
// PlanState
// ============================================================================

/// Everything needed to resume a plan after the process goes away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    pub plan_id: String,
    pub tool: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// The full step list of the original plan.
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub post_env: BTreeMap<String, String>,
    #[serde(default)]
    pub completed_steps: BTreeSet<StepKey>,
    /// Steps whose last attempt failed. A DAG run keeps them, and what
    /// depends on them, blocked until the plan is explicitly resumed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub failed_steps: BTreeSet<StepKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<StepKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_plan: Vec<RollbackAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanState {
    /// Fresh state for a plan about to run.
    pub fn new(plan: &Plan, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan.plan_id.clone(),
            tool: plan.tool.clone(),
            status: PlanStatus::Pending,
            mode,
            steps: plan.steps.clone(),
            post_env: plan.post_env.clone(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            pause_reason: None,
            resume_from: None,
            rollback_plan: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Number of steps in the original plan.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Whether the step at `index` (linear) or with this id (DAG) is done.
    pub fn is_completed(&self, key: &StepKey) -> bool {
        self.completed_steps.contains(key)
    }

    /// Replace every password-typed input value with [`REDACTED`].
    pub fn redact(&mut self) {
        redact_steps(&mut self.steps);
    }
}

impl Persisted for PlanState {
    const KIND: &'static str = "install plan";

    fn id(&self) -> &str {
        &self.plan_id
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn redact(&mut self) {
        PlanState::redact(self);
    }

    fn not_found(id: &str) -> crate::Error {
        crate::Error::PlanNotFound(id.to_string())
    }
}

/// Redact sensitive config inputs in place.
pub(crate) fn redact_steps(steps: &mut [Step]) {
    for step in steps {
        if let StepKind::Config { inputs, .. } = &mut step.kind {
            for input in inputs.iter_mut().filter(|i| i.is_sensitive()) {
                if input.value.is_some() {
                    input.value = Some(serde_json::Value::String(REDACTED.to_string()));
                }
                if input.default.is_some() {
                    input.default = Some(serde_json::Value::String(REDACTED.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputSpec, InputType, OutputFormat};
    use serde_json::json;

    fn config_plan() -> Plan {
        let step = Step::new(StepKind::Config {
            path: "/etc/app.ini".into(),
            template: "[auth]\ntoken = {token}\nuser = {user}\n".into(),
            format: OutputFormat::Ini,
            inputs: vec![
                InputSpec::new("token", InputType::Password).with_value(json!("s3cret")),
                InputSpec::new("user", InputType::Text).with_value(json!("alice")),
            ],
            restarts: None,
        })
        .with_id("cfg");
        Plan::new("app", vec![step]).with_id("app-1")
    }

    #[test]
    fn test_redact_only_passwords() {
        let mut state = PlanState::new(&config_plan(), ExecutionMode::Linear);
        state.redact();

        let StepKind::Config { inputs, .. } = &state.steps[0].kind else {
            panic!("expected config step");
        };
        assert_eq!(inputs[0].value, Some(json!(REDACTED)));
        assert_eq!(inputs[1].value, Some(json!("alice")));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PlanStatus::Done.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
        assert!(!PlanStatus::Failed.is_terminal());
        assert!(!PlanStatus::Paused.is_terminal());
    }

    #[test]
    fn test_serialization_keys() {
        let mut state = PlanState::new(&config_plan(), ExecutionMode::Dag);
        state.status = PlanStatus::Paused;
        state.resume_from = Some(StepKey::Id("cfg".into()));
        state.completed_steps.insert(StepKey::Index(0));

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "paused");
        assert_eq!(value["mode"], "dag");
        assert_eq!(value["resume_from"], "cfg");
        assert_eq!(value["completed_steps"], json!([0]));

        let back: PlanState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}
