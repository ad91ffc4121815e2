//! State persistence
//!
//! One pretty-printed JSON document per plan or chain:
//!
//! ```text
//! <state root>/
//!   install_plans/<plan_id>.json
//!   install_plans/archive/<plan_id>.json
//!   remediation_chains/<chain_id>.json
//!   remediation_chains/archive/<chain_id>.json
//! ```
//!
//! Every write replaces the whole file through a temp file in the same
//! directory, and redacts sensitive values first. A single writer per id is
//! assumed.

use crate::error::{Error, Result};
use crate::state::{ExecutionMode, PlanState};
use crate::types::{Plan, StepKey};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;

static VALID_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

const PLANS_DIR: &str = "install_plans";
const CHAINS_DIR: &str = "remediation_chains";
const ARCHIVE_DIR: &str = "archive";

/// A document the [`StateStore`] can hold.
pub trait Persisted: Serialize + DeserializeOwned + Clone {
    /// Human name used in log lines.
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn is_terminal(&self) -> bool;
    /// Remove sensitive values. Called on a copy before every write.
    fn redact(&mut self);
    /// The error for a missing document of this kind.
    fn not_found(id: &str) -> Error;
}

/// Reject ids that cannot be used as a plain file name.
pub fn validate_id(id: &str) -> Result<()> {
    if VALID_ID.is_match(id) && id != "." && id != ".." {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}

// ============================================================================
// StateDirs
// ============================================================================

/// Root of the state tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDirs {
    root: PathBuf,
}

impl StateDirs {
    /// Use an explicit root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<project>/.provision`, or the user's local data dir without a project.
    pub fn resolve(project_root: Option<&Path>) -> Result<Self> {
        if let Some(project) = project_root {
            return Ok(Self::new(project.join(".provision")));
        }
        let data = dirs::data_local_dir().ok_or_else(|| {
            Error::io(
                "~/.local/share",
                io::Error::new(io::ErrorKind::NotFound, "no local data directory"),
            )
        })?;
        Ok(Self::new(data.join("provision")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.root.join(PLANS_DIR)
    }

    pub fn chains_dir(&self) -> PathBuf {
        self.root.join(CHAINS_DIR)
    }
}

// ============================================================================
// StateStore
// ============================================================================

/// Directory of JSON documents keyed by id.
#[derive(Debug, Clone)]
pub struct StateStore<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Persisted> StateStore<T> {
    /// Store documents directly under `dir`. Created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _marker: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIR)
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Write a redacted copy of `value`, replacing any previous version.
    pub fn save(&self, value: &T) -> Result<PathBuf> {
        let path = self.path_for(value.id())?;
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;

        let mut redacted = value.clone();
        redacted.redact();
        let json = serde_json::to_vec_pretty(&redacted).map_err(|source| Error::Serialization {
            path: path.clone(),
            source,
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        write_synced(&mut tmp, &json).map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| Error::io(&path, e.error))?;

        log::debug!("Saved {} {} to {}", T::KIND, value.id(), path.display());
        Ok(path)
    }

    /// Load a document, `None` if it does not exist.
    pub fn load(&self, id: &str) -> Result<Option<T>> {
        let path = self.path_for(id)?;
        read_document(&path)
    }

    /// Load a document, failing if it does not exist.
    pub fn get(&self, id: &str) -> Result<T> {
        self.load(id)?.ok_or_else(|| T::not_found(id))
    }

    /// Load an archived document.
    pub fn load_archived(&self, id: &str) -> Result<Option<T>> {
        validate_id(id)?;
        read_document(&self.archive_dir().join(format!("{id}.json")))
    }

    /// Every live document, sorted by id. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<T>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut docs = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&self.dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_document::<T>(&path) {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable {} file: {e}", T::KIND),
            }
        }
        docs.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(docs)
    }

    /// Live documents whose status is not terminal.
    pub fn list_pending(&self) -> Result<Vec<T>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|doc| !doc.is_terminal())
            .collect())
    }

    /// Move a document into `archive/`. Nothing is deleted.
    pub fn archive(&self, id: &str) -> Result<PathBuf> {
        let source = self.path_for(id)?;
        if !source.exists() {
            return Err(T::not_found(id));
        }
        let archive = self.archive_dir();
        fs::create_dir_all(&archive).map_err(|e| Error::io(&archive, e))?;
        let target = archive.join(format!("{id}.json"));
        fs::rename(&source, &target).map_err(|e| Error::io(&source, e))?;
        log::debug!("Archived {} {id}", T::KIND);
        Ok(target)
    }
}

fn write_synced(file: &mut NamedTempFile, content: &[u8]) -> io::Result<()> {
    file.write_all(content)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| Error::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

// ============================================================================
// Resume
// ============================================================================

/// Build the plan that finishes a persisted, non-terminal plan.
///
/// Only steps not yet completed are kept. Each keeps its original position
/// in `source_index`; in DAG mode dependencies on completed steps are
/// dropped. The plan id is unchanged so execution continues the same state.
pub fn resume(store: &StateStore<PlanState>, plan_id: &str) -> Result<Plan> {
    let state = store.get(plan_id)?;
    if state.status.is_terminal() {
        return Err(Error::InvalidTransition {
            from: state.status.to_string(),
            action: "resume",
        });
    }
    Ok(resume_state(&state))
}

pub(crate) fn resume_state(state: &PlanState) -> Plan {
    let completed_ids: HashSet<&str> = state
        .completed_steps
        .iter()
        .filter_map(|key| match key {
            StepKey::Id(id) => Some(id.as_str()),
            StepKey::Index(_) => None,
        })
        .collect();

    let mut remaining = Vec::new();
    for (position, step) in state.steps.iter().enumerate() {
        let index = step.source_index.unwrap_or(position);
        let done = match state.mode {
            ExecutionMode::Linear => state.completed_steps.contains(&StepKey::Index(index)),
            ExecutionMode::Dag => completed_ids.contains(step.id_str()),
        };
        if done {
            continue;
        }

        let mut step = step.clone();
        step.source_index = Some(index);
        if state.mode == ExecutionMode::Dag
            && let Some(deps) = step.depends_on.as_mut()
        {
            deps.retain(|dep| !completed_ids.contains(dep.as_str()));
        }
        remaining.push(step);
    }

    let completed_count = state.steps.len() - remaining.len();
    log::debug!(
        "Resuming {} with {} of {} steps left",
        state.plan_id,
        remaining.len(),
        state.steps.len()
    );

    Plan {
        tool: state.tool.clone(),
        steps: remaining,
        post_env: state.post_env.clone(),
        plan_id: state.plan_id.clone(),
        resumed: true,
        original_total: Some(state.steps.len()),
        completed_count: Some(completed_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PlanStatus;
    use crate::types::{InputSpec, InputType, OutputFormat, REDACTED, Step, StepKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn plan(n: usize) -> Plan {
        let steps = (0..n)
            .map(|i| {
                Step::new(StepKind::Tool)
                    .with_id(format!("s{i}"))
                    .with_command(["echo", &i.to_string()])
            })
            .collect();
        Plan::new("demo", steps).with_id("demo-1")
    }

    fn store(tmp: &TempDir) -> StateStore<PlanState> {
        StateStore::new(StateDirs::new(tmp.path()).plans_dir())
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let state = PlanState::new(&plan(2), ExecutionMode::Linear);

        let path = store.save(&state).unwrap();
        assert!(path.ends_with("install_plans/demo-1.json"));
        assert_eq!(store.load("demo-1").unwrap(), Some(state));
        assert!(store.load("other").unwrap().is_none());
        assert!(matches!(store.get("other"), Err(Error::PlanNotFound(_))));
    }

    #[test]
    fn test_save_redacts_passwords() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let step = Step::new(StepKind::Config {
            path: "/etc/x.json".into(),
            template: "{}".into(),
            format: OutputFormat::Json,
            inputs: vec![InputSpec::new("pw", InputType::Password).with_value(json!("hunter2"))],
            restarts: None,
        });
        let state = PlanState::new(&Plan::new("x", vec![step]).with_id("x-1"), ExecutionMode::Linear);
        store.save(&state).unwrap();

        let raw = fs::read_to_string(store.dir().join("x-1.json")).unwrap();
        assert!(!raw.contains("hunter2"));

        let loaded = store.get("x-1").unwrap();
        let StepKind::Config { inputs, .. } = &loaded.steps[0].kind else {
            panic!("expected config step");
        };
        assert_eq!(inputs[0].value, Some(json!(REDACTED)));
        // The caller's copy is untouched.
        let StepKind::Config { inputs, .. } = &state.steps[0].kind else {
            panic!("expected config step");
        };
        assert_eq!(inputs[0].value, Some(json!("hunter2")));
    }

    #[test]
    fn test_list_pending_and_archive() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let mut paused = PlanState::new(&plan(1).with_id("a"), ExecutionMode::Linear);
        paused.status = PlanStatus::Paused;
        let mut done = PlanState::new(&plan(1).with_id("b"), ExecutionMode::Linear);
        done.status = PlanStatus::Done;
        store.save(&paused).unwrap();
        store.save(&done).unwrap();
        fs::write(store.dir().join("junk.json"), "not json").unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].plan_id, "a");

        let archived = store.archive("b").unwrap();
        assert!(archived.exists());
        assert!(store.load("b").unwrap().is_none());
        assert!(store.load_archived("b").unwrap().is_some());
        assert!(matches!(store.archive("b"), Err(Error::PlanNotFound(_))));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store: StateStore<PlanState> = StateStore::new(tmp.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!(validate_id("neovim-20240101T000000000").is_ok());
        assert!(matches!(validate_id("../etc/passwd"), Err(Error::InvalidId(_))));
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a b").is_err());
    }

    #[test]
    fn test_resolve_project_dir() {
        let dirs = StateDirs::resolve(Some(Path::new("/work/app"))).unwrap();
        assert_eq!(dirs.root(), Path::new("/work/app/.provision"));
        assert_eq!(dirs.chains_dir(), Path::new("/work/app/.provision/remediation_chains"));
    }

    #[test]
    fn test_resume_linear_skips_completed() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut state = PlanState::new(&plan(5), ExecutionMode::Linear);
        state.status = PlanStatus::Paused;
        state.completed_steps = (0..3).map(StepKey::Index).collect();
        store.save(&state).unwrap();

        let resumed = resume(&store, "demo-1").unwrap();
        let ids: Vec<_> = resumed.steps.iter().map(Step::id_str).collect();
        assert_eq!(ids, vec!["s3", "s4"]);
        assert_eq!(resumed.steps[0].source_index, Some(3));
        assert!(resumed.resumed);
        assert_eq!(resumed.original_total, Some(5));
        assert_eq!(resumed.completed_count, Some(3));
        assert_eq!(resumed.plan_id, "demo-1");
    }

    #[test]
    fn test_resume_dag_drops_satisfied_deps() {
        let steps = vec![
            Step::new(StepKind::Tool).with_id("a").depends_on(Vec::<String>::new()),
            Step::new(StepKind::Tool).with_id("b").depends_on(["a"]),
            Step::new(StepKind::Tool).with_id("c").depends_on(["a", "b"]),
        ];
        let mut state = PlanState::new(&Plan::new("t", steps).with_id("t-1"), ExecutionMode::Dag);
        state.completed_steps.insert(StepKey::Id("a".into()));

        let resumed = resume_state(&state);
        assert_eq!(resumed.steps.len(), 2);
        assert_eq!(resumed.steps[0].depends_on, Some(vec![]));
        assert_eq!(resumed.steps[1].depends_on, Some(vec!["b".to_string()]));
        assert_eq!(resumed.completed_count, Some(1));
    }

    #[test]
    fn test_resume_terminal_plan_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut state = PlanState::new(&plan(1), ExecutionMode::Linear);
        state.status = PlanStatus::Done;
        store.save(&state).unwrap();
        assert!(matches!(
            resume(&store, "demo-1"),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
