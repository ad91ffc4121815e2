//! Collaborator traits
//!
//! These traits let the orchestration core run without depending on a
//! particular process runner, recipe resolver, or progress display.

use crate::types::Plan;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A single command invocation handed to a [`CommandExecutor`].
#[derive(Clone)]
pub struct CommandRequest<'a> {
    pub argv: Vec<String>,
    pub needs_sudo: bool,
    /// Piped to `sudo -S` by the executor. Never logged or persisted.
    pub sudo_password: Option<&'a str>,
    pub timeout: Duration,
    /// Extra environment for the child process.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl<'a> CommandRequest<'a> {
    /// Create a request with no privileges, environment or working directory.
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            argv,
            needs_sudo: false,
            sudo_password: None,
            timeout,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Run with elevated privileges using the given password.
    pub fn with_sudo(mut self, needs_sudo: bool, password: Option<&'a str>) -> Self {
        self.needs_sudo = needs_sudo;
        self.sudo_password = password;
        self
    }

    /// Add environment overrides.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// The command line for display.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Debug for CommandRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRequest")
            .field("argv", &self.argv)
            .field("needs_sudo", &self.needs_sudo)
            .field(
                "sudo_password",
                &self.sudo_password.map(|_| "<redacted>"),
            )
            .field("timeout", &self.timeout)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// Output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
}

impl CommandOutput {
    /// A successful run with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// A failed run with the given stderr and exit code.
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }
}

/// Runs commands on behalf of the step executor.
///
/// Implementations own sudo-password piping, timeouts and output capture.
/// They must never log or persist `sudo_password`.
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion (or timeout).
    ///
    /// `Err` means the command could not be started at all; a command that
    /// ran and failed is `Ok` with `ok == false`.
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput> {
        (**self).run(request)
    }
}

/// Progress states reported for each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Succeeded,
    Skipped,
    Failed,
    NeedsSudo,
    /// Not executed because a dependency failed.
    Blocked,
}

/// Progress callback for plan execution
///
/// Implement this trait to stream step transitions to a UI, a log, or a
/// server-sent-events channel.
pub trait ProgressCallback: Send {
    /// Called whenever a step changes state.
    fn on_step(&mut self, step_id: &str, status: StepStatus);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_step(&mut self, _step_id: &str, _status: StepStatus) {}
}

impl<F> ProgressCallback for F
where
    F: FnMut(&str, StepStatus) + Send,
{
    fn on_step(&mut self, step_id: &str, status: StepStatus) {
        self(step_id, status);
    }
}

/// What the orchestrator knows about the host, as produced by detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub os: String,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub package_manager: Option<String>,
}

/// Answer of a [`Resolver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Plan(Plan),
    AlreadyInstalled,
    Error(String),
}

/// Turns a tool name into an install plan.
pub trait Resolver: Send + Sync {
    fn resolve(&self, tool: &str, profile: &SystemProfile) -> Result<Resolution>;
}
