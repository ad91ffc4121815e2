//! Remediation escalation chains
//!
//! A chain records "installing X failed because Y is missing, and fixing Y
//! needs its own install". Entries are stacked deepest-first: index 0 of
//! `escalation_stack` is always the entry being worked on.
//!
//! Every operation takes `&self` and returns a new chain. A rejected
//! operation returns an error and leaves the original untouched, so a chain
//! loaded from disk can be passed around freely.
//!
//! ```text
//! pending -> escalating -> executing -> de_escalating -> ... -> ready_to_retry -> done
//!                              |
//!                              v
//!                            failed -> escalating (deeper fix)
//! ```

use crate::error::{Error, Result};
use crate::state::redact_steps;
use crate::store::Persisted;
use crate::types::{Plan, RemediationOption, generate_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Default bound on nested remediations.
pub const DEFAULT_MAX_DEPTH: usize = 3;

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// Status of a whole chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Pending,
    Escalating,
    Executing,
    DeEscalating,
    /// Every sub-fix is done; retry the original goal.
    ReadyToRetry,
    Done,
    Failed,
    Cancelled,
}

impl ChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Escalating => "escalating",
            Self::Executing => "executing",
            Self::DeEscalating => "de_escalating",
            Self::ReadyToRetry => "ready_to_retry",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Status of one stack entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting, either new or blocked on a deeper entry.
    #[default]
    Pending,
    Executing,
    /// The entry's own blocker was fixed; run it next.
    Ready,
    Done,
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Ready => "ready",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// The install the chain exists to unblock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalGoal {
    pub tool_id: String,
    pub plan: Plan,
    pub failed_step_idx: usize,
}

/// The chosen remediation option, copied so the chain stands alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDetail {
    pub label: String,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dep: Option<String>,
}

/// One nested remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    /// 1 for the first escalation.
    pub depth: usize,
    pub failure_id: String,
    pub chosen_option: String,
    pub option_detail: OptionDetail,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainEntry {
    fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// One element of the path from the original goal to the current fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// 0 for the original goal.
    pub depth: usize,
    pub label: String,
    pub status: String,
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.status)
    }
}

/// Nested "fix the blocker, then retry" bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationChain {
    pub chain_id: String,
    pub original_goal: OriginalGoal,
    /// Index 0 is the deepest, current entry.
    pub escalation_stack: Vec<ChainEntry>,
    /// Finished entries, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved: Vec<ChainEntry>,
    /// Tools already part of this chain, including the original goal.
    pub visited_tools: BTreeSet<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    pub status: ChainStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemediationChain {
    /// Start a chain for a failed install of `tool_id`.
    pub fn create(tool_id: impl Into<String>, plan: Plan, failed_step_idx: usize) -> Self {
        let tool_id = tool_id.into();
        let now = Utc::now();
        Self {
            chain_id: generate_id(&format!("{tool_id}-chain")),
            visited_tools: BTreeSet::from([tool_id.clone()]),
            original_goal: OriginalGoal {
                tool_id,
                plan,
                failed_step_idx,
            },
            escalation_stack: Vec::new(),
            resolved: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            status: ChainStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the depth bound.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The entry being worked on.
    pub fn current(&self) -> Option<&ChainEntry> {
        self.escalation_stack.first()
    }

    /// Number of open escalations.
    pub fn depth(&self) -> usize {
        self.escalation_stack.len()
    }

    /// Push a new remediation for `failure_id` using `option`.
    ///
    /// Rejected without any change when the stack is full or when
    /// `option.dep` is already part of the chain.
    pub fn escalate(&self, failure_id: &str, option: &RemediationOption) -> Result<Self> {
        self.ensure_open("escalate")?;

        if self.escalation_stack.len() >= self.max_depth {
            return Err(Error::DepthExceeded {
                depth: self.escalation_stack.len(),
                max_depth: self.max_depth,
            });
        }
        if let Some(dep) = &option.dep
            && self.visited_tools.contains(dep)
        {
            let mut path = self.tool_path();
            path.push(dep.clone());
            return Err(Error::CycleDetected {
                dep: dep.clone(),
                path,
            });
        }

        let mut next = self.clone();
        let now = Utc::now();
        if let Some(blocked) = next.escalation_stack.first_mut() {
            blocked.set_status(EntryStatus::Pending);
        }
        next.escalation_stack.insert(
            0,
            ChainEntry {
                depth: self.escalation_stack.len() + 1,
                failure_id: failure_id.to_string(),
                chosen_option: option.id.clone(),
                option_detail: OptionDetail {
                    label: option.label.clone(),
                    strategy: option.strategy.clone(),
                    dep: option.dep.clone(),
                },
                status: EntryStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        if let Some(dep) = &option.dep {
            next.visited_tools.insert(dep.clone());
        }
        next.set_status(ChainStatus::Escalating);

        log::info!(
            "Escalated {} to depth {} ({})",
            self.original_goal.tool_id,
            next.depth(),
            option.label
        );
        Ok(next)
    }

    /// The current entry is being executed.
    pub fn mark_executing(&self) -> Result<Self> {
        self.ensure_open("execute")?;
        let mut next = self.clone();
        let entry = next.escalation_stack.first_mut().ok_or(Error::EmptyStack)?;
        entry.set_status(EntryStatus::Executing);
        next.set_status(ChainStatus::Executing);
        Ok(next)
    }

    /// The current entry (or the original goal, with an empty stack) failed.
    pub fn mark_failed(&self) -> Result<Self> {
        self.ensure_open("fail")?;
        let mut next = self.clone();
        if let Some(entry) = next.escalation_stack.first_mut() {
            entry.set_status(EntryStatus::Failed);
        }
        next.set_status(ChainStatus::Failed);
        Ok(next)
    }

    /// Pop the current entry as done.
    ///
    /// With an empty stack afterwards the chain is `ready_to_retry`;
    /// otherwise the new current entry is `ready`.
    pub fn de_escalate(&self) -> Result<Self> {
        self.ensure_open("de-escalate")?;
        if self.escalation_stack.is_empty() {
            return Err(Error::EmptyStack);
        }

        let mut next = self.clone();
        let mut finished = next.escalation_stack.remove(0);
        finished.set_status(EntryStatus::Done);
        next.resolved.push(finished);

        match next.escalation_stack.first_mut() {
            Some(entry) => {
                entry.set_status(EntryStatus::Ready);
                next.set_status(ChainStatus::DeEscalating);
            }
            None => next.set_status(ChainStatus::ReadyToRetry),
        }
        Ok(next)
    }

    /// The original goal was retried successfully.
    pub fn complete(&self) -> Result<Self> {
        if self.status != ChainStatus::ReadyToRetry && !self.escalation_stack.is_empty() {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                action: "complete",
            });
        }
        self.ensure_open("complete")?;
        let mut next = self.clone();
        next.set_status(ChainStatus::Done);
        Ok(next)
    }

    /// Abandon the chain.
    pub fn cancel(&self) -> Result<Self> {
        self.ensure_open("cancel")?;
        let mut next = self.clone();
        next.set_status(ChainStatus::Cancelled);
        Ok(next)
    }

    /// Path from the original goal down to the current entry.
    ///
    /// Sub-fixes that were already resolved come right after the goal,
    /// oldest first, so the last crumb is always the current entry.
    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        let goal_status = match self.status {
            ChainStatus::Done => "done",
            ChainStatus::ReadyToRetry => "ready to retry",
            ChainStatus::Cancelled => "cancelled",
            _ => "blocked",
        };
        let mut crumbs = vec![Breadcrumb {
            depth: 0,
            label: format!(
                "Install {} (step #{} failed)",
                self.original_goal.tool_id, self.original_goal.failed_step_idx
            ),
            status: goal_status.to_string(),
        }];
        crumbs.extend(
            self.resolved
                .iter()
                .chain(self.escalation_stack.iter().rev())
                .map(|entry| Breadcrumb {
                    depth: entry.depth,
                    label: entry.option_detail.label.clone(),
                    status: entry.status.to_string(),
                }),
        );
        crumbs
    }

    /// Tools in escalation order, starting with the original goal.
    fn tool_path(&self) -> Vec<String> {
        std::iter::once(self.original_goal.tool_id.clone())
            .chain(
                self.escalation_stack
                    .iter()
                    .rev()
                    .filter_map(|entry| entry.option_detail.dep.clone()),
            )
            .collect()
    }

    fn ensure_open(&self, action: &'static str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                action,
            });
        }
        Ok(())
    }

    fn set_status(&mut self, status: ChainStatus) {
        log::debug!("Chain {}: {} -> {}", self.chain_id, self.status, status);
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl Persisted for RemediationChain {
    const KIND: &'static str = "remediation chain";

    fn id(&self) -> &str {
        &self.chain_id
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn redact(&mut self) {
        redact_steps(&mut self.original_goal.plan.steps);
    }

    fn not_found(id: &str) -> Error {
        Error::ChainNotFound(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(dep: &str) -> RemediationOption {
        RemediationOption {
            id: format!("install_{dep}"),
            label: format!("Install {dep}"),
            strategy: "install_dep".into(),
            dep: Some(dep.into()),
        }
    }

    fn chain() -> RemediationChain {
        RemediationChain::create("neovim", Plan::new("neovim", vec![]), 2)
    }

    #[test]
    fn test_create() {
        let chain = chain();
        assert_eq!(chain.status, ChainStatus::Pending);
        assert!(chain.escalation_stack.is_empty());
        assert!(chain.visited_tools.contains("neovim"));
        assert_eq!(chain.max_depth, 3);
        assert!(chain.chain_id.starts_with("neovim-chain-"));
    }

    #[test]
    fn test_escalate_pushes_deepest_first() {
        let chain = chain()
            .escalate("missing_cmake", &option("cmake"))
            .unwrap()
            .escalate("missing_compiler", &option("gcc"))
            .unwrap();

        assert_eq!(chain.depth(), 2);
        assert_eq!(chain.current().unwrap().option_detail.dep.as_deref(), Some("gcc"));
        assert_eq!(chain.current().unwrap().depth, 2);
        assert_eq!(chain.escalation_stack[1].depth, 1);
        assert_eq!(chain.status, ChainStatus::Escalating);
        assert!(chain.visited_tools.contains("cmake"));
        assert!(chain.visited_tools.contains("gcc"));
    }

    #[test]
    fn test_escalate_at_max_depth_is_rejected() {
        let full = chain()
            .with_max_depth(2)
            .escalate("a", &option("a"))
            .unwrap()
            .escalate("b", &option("b"))
            .unwrap();
        let err = full.escalate("c", &option("c")).unwrap_err();
        assert!(matches!(
            err,
            Error::DepthExceeded {
                depth: 2,
                max_depth: 2
            }
        ));
        assert_eq!(full.depth(), 2);
        assert!(!full.visited_tools.contains("c"));
    }

    #[test]
    fn test_escalate_cycle_is_rejected() {
        let chain = chain().escalate("x", &option("cmake")).unwrap();
        let before = chain.clone();

        let err = chain.escalate("y", &option("neovim")).unwrap_err();
        match err {
            Error::CycleDetected { dep, path } => {
                assert_eq!(dep, "neovim");
                assert_eq!(path, vec!["neovim", "cmake", "neovim"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(chain.escalate("z", &option("cmake")).is_err());
        assert_eq!(chain, before);
    }

    #[test]
    fn test_de_escalate_unwinds_to_retry() {
        let chain = chain()
            .escalate("a", &option("cmake"))
            .unwrap()
            .escalate("b", &option("gcc"))
            .unwrap()
            .mark_executing()
            .unwrap();

        let chain = chain.de_escalate().unwrap();
        assert_eq!(chain.status, ChainStatus::DeEscalating);
        assert_eq!(chain.current().unwrap().status, EntryStatus::Ready);
        assert_eq!(chain.resolved.len(), 1);
        assert_eq!(chain.resolved[0].status, EntryStatus::Done);

        let chain = chain.de_escalate().unwrap();
        assert_eq!(chain.status, ChainStatus::ReadyToRetry);
        assert!(chain.current().is_none());

        assert!(matches!(chain.de_escalate(), Err(Error::EmptyStack)));
        let done = chain.complete().unwrap();
        assert_eq!(done.status, ChainStatus::Done);
        assert!(matches!(
            done.cancel(),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_entry_can_escalate_deeper() {
        let chain = chain()
            .escalate("a", &option("cmake"))
            .unwrap()
            .mark_executing()
            .unwrap()
            .mark_failed()
            .unwrap();
        assert_eq!(chain.status, ChainStatus::Failed);
        assert_eq!(chain.current().unwrap().status, EntryStatus::Failed);

        let deeper = chain.escalate("b", &option("gcc")).unwrap();
        assert_eq!(deeper.escalation_stack[1].status, EntryStatus::Pending);
    }

    #[test]
    fn test_complete_requires_empty_stack() {
        let chain = chain().escalate("a", &option("cmake")).unwrap();
        assert!(matches!(
            chain.complete(),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_breadcrumbs_start_at_goal() {
        let chain = chain()
            .escalate("a", &option("cmake"))
            .unwrap()
            .escalate("b", &option("gcc"))
            .unwrap();
        let crumbs = chain.breadcrumbs();
        let labels: Vec<_> = crumbs.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["Install neovim (step #2 failed)", "Install cmake", "Install gcc"]
        );
        assert_eq!(crumbs[0].depth, 0);
        assert_eq!(crumbs[2].depth, 2);
    }

    #[test]
    fn test_breadcrumbs_keep_resolved_entries() {
        let chain = chain()
            .escalate("a", &option("cmake"))
            .unwrap()
            .escalate("b", &option("gcc"))
            .unwrap()
            .de_escalate()
            .unwrap();
        let crumbs: Vec<(String, String)> = chain
            .breadcrumbs()
            .into_iter()
            .map(|c| (c.label, c.status))
            .collect();
        assert_eq!(
            crumbs,
            vec![
                ("Install neovim (step #2 failed)".to_string(), "blocked".to_string()),
                ("Install gcc".to_string(), "done".to_string()),
                ("Install cmake".to_string(), "ready".to_string()),
            ]
        );
    }

    #[test]
    fn test_chain_serializes_statuses() {
        let chain = chain().escalate("a", &option("cmake")).unwrap();
        let value = serde_json::to_value(&chain).unwrap();
        assert_eq!(value["status"], "escalating");
        assert_eq!(value["escalation_stack"][0]["status"], "pending");
        let back: RemediationChain = serde_json::from_value(value).unwrap();
        assert_eq!(back, chain);
    }
}
