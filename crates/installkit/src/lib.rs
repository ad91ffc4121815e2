//! # Installkit
//!
//! Install-plan orchestration: schedule a graph of install steps, run them
//! through an injected command executor, recover from partial failure, and
//! persist enough state to survive shell restarts and reboots mid-install.
//!
//! ## Core Concepts
//!
//! - **Plan**: an ordered list of [`Step`]s for one tool, optionally forming
//!   a DAG through `depends_on`
//! - **StepExecutor**: turns one step into commands and interprets the result
//! - **Session**: runs plans linearly or as a DAG, applies rollback policy,
//!   pauses after restart-requiring steps and checkpoints [`PlanState`]
//! - **RemediationChain**: nested "fix the blocker, then retry" bookkeeping
//!   with depth and cycle guards
//!
//! ## Example
//!
//! ```ignore
//! use installkit::{NoProgress, Plan, Session, SessionOptions, StateDirs, Step, StepKind};
//!
//! let session = Session::new(my_executor, &StateDirs::resolve(None)?, SessionOptions::default());
//! let plan = Plan::new("ripgrep", vec![
//!     Step::new(StepKind::Tool).with_command(["cargo", "install", "ripgrep"]),
//! ]);
//!
//! let result = session.execute_linear(&plan, None, 0, &mut NoProgress)?;
//! if !result.is_done() {
//!     println!("{:?}", result.outcome);
//! }
//! ```
//!
//! ## Provider Traits
//!
//! - [`CommandExecutor`]: runs a command, piping a sudo password if needed
//! - [`Resolver`]: turns a tool name into a plan
//! - [`ProgressCallback`]: receives step transitions
//!
//! The crate never spawns processes itself, so it can be tested with
//! [`mock::MockExecutor`].

pub mod chain;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod mock;
pub mod orchestrator;
pub mod policy;
pub mod state;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use chain::{Breadcrumb, ChainStatus, EntryStatus, RemediationChain};
pub use context::{
    CommandExecutor, CommandOutput, CommandRequest, NoProgress, ProgressCallback, Resolution,
    Resolver, StepStatus, SystemProfile,
};
pub use dag::GraphError;
pub use error::{Error, ErrorCategory, Result};
pub use executor::StepExecutor;
pub use orchestrator::{
    EscalationStep, InstallOutcome, PlanOutcome, PlanResult, Session, SessionOptions,
    StepFailure, StepReport,
};
pub use state::{ExecutionMode, PlanState, PlanStatus};
pub use store::{StateDirs, StateStore};
pub use types::{
    InputSpec, InputType, OutputFormat, Plan, Remediation, RemediationOption, RestartKind, Risk,
    Step, StepKey, StepKind, StepOutcome, StepResult,
};
