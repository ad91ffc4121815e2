//! Error types for install orchestration.
//!
//! Errors are categorized so callers can tell a rejected plan apart from a
//! refused remediation or a broken state directory. Step execution failures
//! are *not* errors: they are recorded in [`crate::StepResult`] and surfaced
//! through [`crate::PlanResult`].

use crate::dag::GraphError;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for installkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of installkit errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The plan graph is invalid; nothing was executed.
    Structural,
    /// A remediation escalation violated the depth or cycle rules.
    Policy,
    /// Reading or writing persisted state failed.
    Persistence,
    /// An external collaborator (command runner, resolver) failed.
    Collaborator,
    /// A user-supplied value or identifier was rejected.
    Validation,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Structural => "Invalid install plan",
            Self::Policy => "Remediation refused",
            Self::Persistence => "State storage error",
            Self::Collaborator => "External command failure",
            Self::Validation => "Invalid input",
        }
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Structural => "Fix the step ids and depends_on entries in the plan",
            Self::Policy => "Resolve the blocking dependency manually, then retry the original goal",
            Self::Persistence => "Check permissions on the state directory",
            Self::Collaborator => "Check that the command runner is available and retry",
            Self::Validation => "Correct the value and try again",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during install orchestration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The step graph failed validation.
    #[error("invalid step graph: {}", format_graph_errors(.errors))]
    InvalidGraph {
        /// Every problem found by validation.
        errors: Vec<GraphError>,
    },

    /// Escalating would exceed the chain's maximum depth.
    #[error("remediation depth {depth} reached the limit of {max_depth}")]
    DepthExceeded {
        /// Current stack depth.
        depth: usize,
        /// Configured maximum depth.
        max_depth: usize,
    },

    /// Escalating would revisit a tool already in the chain.
    #[error("remediation cycle: {dep} is already part of this chain ({})", .path.join(" -> "))]
    CycleDetected {
        /// The dependency that was requested.
        dep: String,
        /// Tools visited so far, in order.
        path: Vec<String>,
    },

    /// The chain is not in a state that allows this action.
    #[error("cannot {action} a chain in state {from}")]
    InvalidTransition {
        /// Current chain status.
        from: String,
        /// Attempted action.
        action: &'static str,
    },

    /// De-escalation requested on an empty stack.
    #[error("escalation stack is empty")]
    EmptyStack,

    /// No persisted plan with this id.
    #[error("install plan not found: {0}")]
    PlanNotFound(String),

    /// No persisted chain with this id.
    #[error("remediation chain not found: {0}")]
    ChainNotFound(String),

    /// An id that cannot be used as a state file name.
    #[error("invalid state id: {0:?}")]
    InvalidId(String),

    /// IO error while touching the state directory.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved in the error.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A state document could not be encoded or decoded.
    #[error("invalid state document {path}: {source}")]
    Serialization {
        /// Path of the document.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A collaborator returned an error outside of step execution.
    #[error("collaborator failed: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl Error {
    /// Get the category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidGraph { .. } => ErrorCategory::Structural,
            Self::DepthExceeded { .. }
            | Self::CycleDetected { .. }
            | Self::InvalidTransition { .. }
            | Self::EmptyStack => ErrorCategory::Policy,
            Self::PlanNotFound(_)
            | Self::ChainNotFound(_)
            | Self::Io { .. }
            | Self::Serialization { .. } => ErrorCategory::Persistence,
            Self::Collaborator(_) => ErrorCategory::Collaborator,
            Self::InvalidId(_) => ErrorCategory::Validation,
        }
    }

    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_graph_errors(errors: &[GraphError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            Error::DepthExceeded {
                depth: 3,
                max_depth: 3
            }
            .category(),
            ErrorCategory::Policy
        );
        assert_eq!(
            Error::InvalidGraph { errors: vec![] }.category(),
            ErrorCategory::Structural
        );
        assert_eq!(
            Error::InvalidId("../x".into()).category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_cycle_message_shows_path() {
        let err = Error::CycleDetected {
            dep: "cmake".into(),
            path: vec!["neovim".into(), "cmake".into()],
        };
        assert_eq!(
            err.to_string(),
            "remediation cycle: cmake is already part of this chain (neovim -> cmake)"
        );
    }

    #[test]
    fn test_invalid_graph_message_lists_errors() {
        let err = Error::InvalidGraph {
            errors: vec![
                GraphError::DuplicateId("a".into()),
                GraphError::Cycle(vec!["b".into(), "c".into()]),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("duplicate step id: a"));
        assert!(msg.contains("dependency cycle"));
    }
}
