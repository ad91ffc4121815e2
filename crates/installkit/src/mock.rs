//! Scripted command executor for tests.
//!
//! [`MockExecutor`] answers every command from a list of argv-prefix rules
//! and records each request, so tests can assert on exactly what ran.
//!
//! ```
//! use installkit::mock::MockExecutor;
//! use installkit::{CommandExecutor, CommandOutput, CommandRequest};
//! use std::time::Duration;
//!
//! let mock = MockExecutor::new();
//! mock.on(["mokutil", "--sb-state"], CommandOutput::success("SecureBoot disabled"));
//!
//! let request = CommandRequest::new(
//!     vec!["mokutil".into(), "--sb-state".into()],
//!     Duration::from_secs(5),
//! );
//! let output = mock.run(&request).unwrap();
//! assert!(output.stdout.contains("disabled"));
//! assert!(mock.ran(["mokutil"]));
//! ```

use crate::context::{CommandExecutor, CommandOutput, CommandRequest};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// A request as seen by the mock. The password itself is not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub argv: Vec<String>,
    pub needs_sudo: bool,
    pub had_password: bool,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    SpawnError(String),
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<String>,
    reply: Reply,
}

/// Mock executor for testing without spawning processes.
///
/// Commands that match no rule succeed with empty output. When several
/// rules match, the most recently added one wins.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockExecutor {
    /// Create a mock where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn on<I, S>(&self, prefix: I, output: CommandOutput) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_rule(prefix, Reply::Output(output))
    }

    /// Make commands starting with `prefix` fail with an exit code and stderr.
    pub fn fail_on<I, S>(&self, prefix: I, exit_code: i32, stderr: &str) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_rule(prefix, Reply::Output(CommandOutput::failure(exit_code, stderr)))
    }

    /// Make commands starting with `prefix` fail to start at all.
    pub fn error_on<I, S>(&self, prefix: I, message: &str) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_rule(prefix, Reply::SpawnError(message.to_string()))
    }

    /// Every request received so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any request started with `prefix`.
    pub fn ran<I, S>(&self, prefix: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.count(prefix) > 0
    }

    /// Number of requests that started with `prefix`.
    pub fn count<I, S>(&self, prefix: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        self.calls()
            .iter()
            .filter(|call| call.argv.starts_with(&prefix))
            .count()
    }

    fn push_rule<I, S>(&self, prefix: I, reply: Reply) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into_iter().map(Into::into).collect();
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule { prefix, reply });
        self
    }
}

impl CommandExecutor for MockExecutor {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                argv: request.argv.clone(),
                needs_sudo: request.needs_sudo,
                had_password: request.sudo_password.is_some(),
                env: request.env.clone(),
                cwd: request.cwd.clone(),
            });

        let rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let reply = rules
            .iter()
            .rev()
            .find(|rule| request.argv.starts_with(&rule.prefix))
            .map(|rule| rule.reply.clone());

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::SpawnError(message)) => anyhow::bail!(message),
            None => Ok(CommandOutput::success("")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(argv: &[&str]) -> CommandRequest<'static> {
        CommandRequest::new(
            argv.iter().map(ToString::to_string).collect(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_unmatched_commands_succeed() {
        let mock = MockExecutor::new();
        let output = mock.run(&request(&["true"])).unwrap();
        assert!(output.ok);
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn test_latest_rule_wins() {
        let mock = MockExecutor::new();
        mock.fail_on(["make"], 2, "first");
        mock.fail_on(["make", "install"], 3, "second");

        let output = mock.run(&request(&["make", "install"])).unwrap();
        assert_eq!(output.exit_code, Some(3));
        let output = mock.run(&request(&["make", "-j4"])).unwrap();
        assert_eq!(output.exit_code, Some(2));
    }

    #[test]
    fn test_spawn_error() {
        let mock = MockExecutor::new();
        mock.error_on(["missing"], "No such file or directory");
        assert!(mock.run(&request(&["missing", "--version"])).is_err());
    }

    #[test]
    fn test_records_password_presence_only() {
        let mock = MockExecutor::new();
        let req = request(&["apt-get", "install"]).with_sudo(true, Some("pw"));
        mock.run(&req).unwrap();
        let call = &mock.calls()[0];
        assert!(call.needs_sudo);
        assert!(call.had_password);
        assert_eq!(mock.count(["apt-get"]), 1);
    }
}
