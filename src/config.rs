use crate::paths;
use anyhow::{Context, Result};
use installkit::{SessionOptions, StateDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// provision.toml
// ============================================================================

/// Optional settings file. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout for steps that do not declare one
    pub step_timeout_secs: u64,
    pub max_chain_depth: usize,
    /// Archive plans as soon as they finish
    pub archive_on_done: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            step_timeout_secs: options.step_timeout.as_secs(),
            max_chain_depth: options.max_chain_depth,
            archive_on_done: options.archive_on_done,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// State directory; `~` and `$VARS` are expanded
    pub state_dir: Option<String>,
}

impl ProvisionConfig {
    /// Load `provision.toml` from the config directory, or defaults when absent
    pub fn load() -> Result<Self> {
        let path = paths::config_dir()?.join(paths::CONFIG_FILE);
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            step_timeout: Duration::from_secs(self.execution.step_timeout_secs),
            max_chain_depth: self.execution.max_chain_depth,
            archive_on_done: self.execution.archive_on_done,
        }
    }

    /// Where plan and chain state lives
    ///
    /// Priority: `--project`, then the environment, then `[paths] state_dir`,
    /// then the platform data directory.
    pub fn state_dirs(&self, project: Option<&Path>) -> Result<StateDirs> {
        if project.is_some() {
            return Ok(StateDirs::resolve(project)?);
        }
        if let Some(dir) = paths::state_dir_override() {
            return Ok(StateDirs::new(dir));
        }
        if let Some(dir) = &self.paths.state_dir {
            return Ok(StateDirs::new(paths::expand(dir)));
        }
        Ok(StateDirs::resolve(None)?)
    }
}
