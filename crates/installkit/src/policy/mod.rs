//! Pure policy and analysis functions
//!
//! Nothing in here performs I/O. The orchestrator consults these on step
//! failure, on restart-requiring steps and at plan completion; the
//! escalation chain uses the diagnoses to offer fixes.

pub mod build_failure;
pub mod restart;
pub mod risk;
pub mod rollback;
pub mod validation;
pub mod version;

pub use build_failure::{BuildDiagnosis, FailureCause, analyze_build_failure};
pub use restart::{RestartNeeds, batch_restarts, detect_restart_needs};
pub use risk::{effective_risk, infer_risk};
pub use rollback::{RollbackAction, generate_rollback_plan};
pub use validation::{
    find_placeholders, render_template, validate_input, validate_inputs, validate_output,
};
pub use version::{VersionCheck, VersionConstraint, check_version_constraint, parse_version};
