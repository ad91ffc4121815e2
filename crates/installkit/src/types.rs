//! Core types for install plans.
//!
//! A [`Plan`] is an ordered list of [`Step`]s plus the environment delta the
//! steps produce. Each step carries a [`StepKind`], a closed set of step
//! kinds with their kind-specific arguments, so dispatch never has to
//! interpret free-form type strings.

use crate::policy::VersionConstraint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder written in place of sensitive values.
pub const REDACTED: &str = "***REDACTED***";

/// Danger level of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    /// Reversible, user-local changes.
    Low,
    /// System changes with a known reverse action.
    Medium,
    /// Changes that are unsafe to reverse blindly (disks, bootloader).
    High,
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{name}")
    }
}

/// What has to restart before later steps can observe a step's effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartKind {
    /// Nothing.
    #[default]
    None,
    /// The user's login shell.
    Shell,
    /// A system service.
    Service,
    /// The whole machine.
    Reboot,
}

impl RestartKind {
    /// Whether this step demands any restart.
    pub fn is_required(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for RestartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Shell => "shell",
            Self::Service => "service",
            Self::Reboot => "reboot",
        };
        write!(f, "{name}")
    }
}

/// Reverse action declared by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollback {
    /// Command that undoes the step.
    pub command: Vec<String>,
    /// Whether the reverse command needs elevated privileges.
    #[serde(default)]
    pub needs_sudo: bool,
    /// Human-readable explanation shown in manual instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Type of a user-supplied input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Select,
    Number,
    Text,
    Path,
    Boolean,
    Password,
}

/// Declared input of a config step, with its validation rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    /// Allowed values for `select`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Regular expression the whole value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl InputSpec {
    /// Create an input with no rules.
    pub fn new(name: impl Into<String>, input_type: InputType) -> Self {
        Self {
            name: name.into(),
            input_type,
            value: None,
            default: None,
            required: false,
            options: Vec::new(),
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
        }
    }

    /// Set the supplied value.
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    /// The supplied value, falling back to the declared default.
    pub fn effective_value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref().or(self.default.as_ref())
    }

    /// Whether this input must never be written to disk in clear.
    pub fn is_sensitive(&self) -> bool {
        self.input_type == InputType::Password
    }
}

/// Declared format of rendered config output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Yaml,
    Ini,
    #[default]
    Raw,
}

/// Kind of a step together with its kind-specific arguments.
///
/// Serialized inline with the step under the `type` key. Unrecognized type
/// strings decode to [`StepKind::Unknown`] so a plan from a newer resolver
/// still loads; the executor refuses to run such steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Install packages through the system package manager.
    Packages {
        #[serde(default)]
        packages: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_manager: Option<String>,
    },
    /// Add a package repository or key.
    RepoSetup,
    /// Run a tool's own installer.
    Tool,
    /// Post-install command (may load a kernel module).
    PostInstall,
    /// Check that the install works.
    Verify,
    /// Fetch a source tree.
    Source {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
    /// Compile from source.
    Build,
    /// Copy build output into place.
    Install,
    /// Remove temporary files.
    Cleanup,
    /// Download a file.
    Download { url: String, dest: String },
    /// Control a system service.
    Service {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    /// Render a template and install it as a config file.
    Config {
        path: String,
        template: String,
        #[serde(default)]
        format: OutputFormat,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<InputSpec>,
        /// Service that must restart to pick up the file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restarts: Option<String>,
    },
    /// Message for the user; never executes anything.
    Notification { message: String },
    /// Ensure a line is present in a shell startup file.
    ShellConfig { file: String, line: String },
    /// Download a binary from a GitHub release.
    GithubRelease {
        repo: String,
        asset: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        /// Checked against `version` before anything is downloaded.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constraint: Option<VersionConstraint>,
        dest: String,
    },
    /// A type this version does not know.
    #[serde(other)]
    Unknown,
}

impl StepKind {
    /// The serialized name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Packages { .. } => "packages",
            Self::RepoSetup => "repo_setup",
            Self::Tool => "tool",
            Self::PostInstall => "post_install",
            Self::Verify => "verify",
            Self::Source { .. } => "source",
            Self::Build => "build",
            Self::Install => "install",
            Self::Cleanup => "cleanup",
            Self::Download { .. } => "download",
            Self::Service { .. } => "service",
            Self::Config { .. } => "config",
            Self::Notification { .. } => "notification",
            Self::ShellConfig { .. } => "shell_config",
            Self::GithubRelease { .. } => "github_release",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that run with the plan's accumulated `post_env`.
    pub fn consumes_post_env(&self) -> bool {
        matches!(self, Self::Tool | Self::PostInstall | Self::Verify)
    }

    /// Kinds whose success can put new entries on PATH.
    pub fn mutates_path(&self) -> bool {
        matches!(
            self,
            Self::Tool | Self::Install | Self::ShellConfig { .. } | Self::GithubRelease { .. }
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within a plan; assigned as `step_<index>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// `None` means "depends on the previous step".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<Risk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Rollback>,
    #[serde(default)]
    pub restart_required: RestartKind,
    #[serde(default)]
    pub needs_sudo: bool,
    /// Path to copy aside before a high-risk step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Index of this step in the plan it was resumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_index: Option<usize>,
}

impl Step {
    /// Create a step with no command and default settings.
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            kind,
            label: None,
            depends_on: None,
            command: Vec::new(),
            risk: None,
            rollback: None,
            restart_required: RestartKind::None,
            needs_sudo: false,
            backup_before: None,
            timeout_secs: None,
            cwd: None,
            source_index: None,
        }
    }

    /// Set the step id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the command argv.
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set explicit dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    /// Declare the step's risk.
    pub fn with_risk(mut self, risk: Risk) -> Self {
        self.risk = Some(risk);
        self
    }

    /// Declare a reverse action.
    pub fn with_rollback<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rollback = Some(Rollback {
            command: command.into_iter().map(Into::into).collect(),
            needs_sudo: false,
            description: None,
        });
        self
    }

    /// Declare what must restart after this step.
    pub fn with_restart(mut self, restart: RestartKind) -> Self {
        self.restart_required = restart;
        self
    }

    /// Mark the step as needing elevated privileges.
    pub fn with_sudo(mut self) -> Self {
        self.needs_sudo = true;
        self
    }

    /// The step id, or an empty string before identity assignment.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Label for display: explicit label, then id, then the kind.
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| self.kind.name().to_string())
    }

    /// The binary this step runs, if any.
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }
}

/// An ordered install plan for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub tool: String,
    pub steps: Vec<Step>,
    /// Environment delta later steps need once a PATH-mutating step succeeded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub post_env: BTreeMap<String, String>,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<usize>,
}

impl Plan {
    /// Create a plan with a freshly generated id.
    pub fn new(tool: impl Into<String>, steps: Vec<Step>) -> Self {
        let tool = tool.into();
        let plan_id = generate_id(&tool);
        Self {
            tool,
            steps,
            post_env: BTreeMap::new(),
            plan_id,
            resumed: false,
            original_total: None,
            completed_count: None,
        }
    }

    /// Set the plan id.
    pub fn with_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = plan_id.into();
        self
    }

    /// Add an environment entry produced by the plan.
    pub fn with_post_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.post_env.insert(key.into(), value.into());
        self
    }

    /// Fill in a plan id when the resolver did not provide one.
    pub fn ensure_id(&mut self) {
        if self.plan_id.is_empty() {
            self.plan_id = generate_id(&self.tool);
        }
    }
}

/// Generate a file-name-safe id from a prefix and the current time.
pub fn generate_id(prefix: &str) -> String {
    let slug: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    if slug.is_empty() {
        format!("plan-{stamp}")
    } else {
        format!("{slug}-{stamp}")
    }
}

/// Identity of a step in persisted state.
///
/// Linear execution records positions, DAG execution records ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepKey {
    Index(usize),
    Id(String),
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{i}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// A fix the user (or a remediation chain) can choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOption {
    pub id: String,
    pub label: String,
    pub strategy: String,
    /// Tool that has to be installed first, for escalating options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dep: Option<String>,
}

/// Structured explanation of why a step was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub failure_id: String,
    pub reason: String,
    pub options: Vec<RemediationOption>,
}

/// How a single step ended. Exactly one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { error: String },
    NeedsSudo,
}

/// Uniform result of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(flatten)]
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub elapsed_ms: u64,
    /// Non-fatal problems, e.g. a backup that could not be taken.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl StepResult {
    fn with_outcome(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            warnings: Vec::new(),
            remediation: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::with_outcome(StepOutcome::Succeeded)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::with_outcome(StepOutcome::Skipped {
            reason: reason.into(),
        })
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::with_outcome(StepOutcome::Failed {
            error: error.into(),
        })
    }

    pub fn needs_sudo() -> Self {
        Self::with_outcome(StepOutcome::NeedsSudo)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StepOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { .. })
    }

    pub fn is_needs_sudo(&self) -> bool {
        matches!(self.outcome, StepOutcome::NeedsSudo)
    }

    /// The failure message, if the step failed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            StepOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_parses_inline_type() {
        let json = r#"{"id": "deps", "type": "packages", "packages": ["cmake"], "needs_sudo": true}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.id.as_deref(), Some("deps"));
        assert!(step.needs_sudo);
        assert_eq!(
            step.kind,
            StepKind::Packages {
                packages: vec!["cmake".into()],
                package_manager: None
            }
        );
        assert!(step.depends_on.is_none());
    }

    #[test]
    fn test_unknown_step_type_decodes() {
        let json = r#"{"type": "teleport", "command": ["beam", "up"]}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.kind, StepKind::Unknown);
        assert_eq!(step.command, vec!["beam", "up"]);
    }

    #[test]
    fn test_step_serializes_type_inline() {
        let step = Step::new(StepKind::Tool)
            .with_id("rustup")
            .with_command(["sh", "rustup.sh"]);
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "tool");
        assert_eq!(value["id"], "rustup");
        assert_eq!(value["restart_required"], "none");
    }

    #[test]
    fn test_step_key_untagged() {
        let keys: Vec<StepKey> = serde_json::from_str(r#"[0, "build", 3]"#).unwrap();
        assert_eq!(
            keys,
            vec![StepKey::Index(0), StepKey::Id("build".into()), StepKey::Index(3)]
        );
    }

    #[test]
    fn test_step_result_flags_are_exclusive() {
        let ok = StepResult::succeeded();
        assert!(ok.is_ok() && !ok.is_failed() && !ok.is_skipped() && !ok.is_needs_sudo());
        let failed = StepResult::failed("boom");
        assert_eq!(failed.error(), Some("boom"));
        assert!(!failed.is_ok());
    }

    #[test]
    fn test_generate_id_is_file_safe() {
        let id = generate_id("github.com/foo bar");
        assert!(id.starts_with("github.com-foo-bar-"));
        assert!(!id.contains('/'));
    }

    #[test]
    fn test_kind_env_classes() {
        assert!(StepKind::Verify.consumes_post_env());
        assert!(!StepKind::Build.consumes_post_env());
        assert!(StepKind::Install.mutates_path());
        assert!(!StepKind::Verify.mutates_path());
    }
}
