// Plan execution
pub mod run;

// Persisted state
pub mod chains;
pub mod plans;

// Offline checks
pub mod validate;

use crate::Context;
use crate::config::ProvisionConfig;
use crate::runner::SystemExecutor;
use anyhow::{Context as _, Result};
use installkit::{Plan, Session};
use std::fs;
use std::path::Path;

/// Read a plan file (JSON)
pub fn load_plan(path: &Path) -> Result<Plan> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid plan file: {}", path.display()))
}

/// Session over the configured state directory, running real processes
pub fn open_session(ctx: &Context) -> Result<Session<SystemExecutor>> {
    let config = ProvisionConfig::load()?;
    let dirs = config.state_dirs(ctx.project.as_deref())?;
    log::debug!("State directory: {}", dirs.root().display());
    Ok(Session::new(SystemExecutor, &dirs, config.session_options()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_plan() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plan.json");
        fs::write(
            &path,
            r#"{"tool": "jq", "steps": [{"type": "packages", "packages": ["jq"], "package_manager": "apt"}]}"#,
        )
        .unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.tool, "jq");
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn test_load_plan_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let err = load_plan(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
