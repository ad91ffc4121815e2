//! Tool installs and the remediation chain driver.

use super::{PlanOutcome, PlanResult, Session};
use crate::chain::RemediationChain;
use crate::context::{CommandExecutor, ProgressCallback, Resolution, Resolver, SystemProfile};
use crate::error::{Error, Result};
use crate::types::{Plan, RemediationOption};

/// What happened when a tool was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    /// The resolver found the tool already present.
    AlreadyInstalled,
    /// The resolver could not produce a plan.
    Unresolved(String),
    /// A plan was executed.
    Executed(PlanResult),
}

impl InstallOutcome {
    /// Whether the tool is now present.
    pub fn is_satisfied(&self) -> bool {
        match self {
            Self::AlreadyInstalled => true,
            Self::Unresolved(_) => false,
            Self::Executed(result) => result.is_done(),
        }
    }
}

/// Result of driving one chain entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationStep {
    /// The chain after every transition was persisted.
    pub chain: RemediationChain,
    pub install: InstallOutcome,
}

impl<E: CommandExecutor> Session<E> {
    /// Resolve `tool` and, when there is something to do, run its plan in
    /// DAG mode.
    pub fn install_tool<R, P>(
        &self,
        tool: &str,
        profile: &SystemProfile,
        resolver: &R,
        sudo_password: Option<&str>,
        progress: &mut P,
    ) -> Result<InstallOutcome>
    where
        R: Resolver + ?Sized,
        P: ProgressCallback,
    {
        match resolver.resolve(tool, profile)? {
            Resolution::AlreadyInstalled => {
                log::info!("{tool} is already installed");
                Ok(InstallOutcome::AlreadyInstalled)
            }
            Resolution::Error(message) => {
                log::warn!("Could not resolve {tool}: {message}");
                Ok(InstallOutcome::Unresolved(message))
            }
            Resolution::Plan(plan) => self
                .execute_dag(&plan, sudo_password, progress)
                .map(InstallOutcome::Executed),
        }
    }

    /// Start a chain for a failed step of `plan` and persist it.
    pub fn start_chain(
        &self,
        tool_id: &str,
        plan: Plan,
        failed_step_idx: usize,
    ) -> Result<RemediationChain> {
        let chain = RemediationChain::create(tool_id, plan, failed_step_idx)
            .with_max_depth(self.options.max_chain_depth);
        self.chains.save(&chain)?;
        log::info!("Started remediation chain {}", chain.chain_id);
        Ok(chain)
    }

    /// Push a remediation onto `chain` and persist the result.
    ///
    /// Depth and cycle violations leave the stored chain untouched.
    pub fn escalate(
        &self,
        chain: &RemediationChain,
        failure_id: &str,
        option: &RemediationOption,
    ) -> Result<RemediationChain> {
        let next = chain.escalate(failure_id, option)?;
        self.chains.save(&next)?;
        Ok(next)
    }

    /// Install the dependency of the chain's current entry.
    ///
    /// On success the entry is popped; on failure the chain is marked
    /// failed. A plan that paused (restart or sudo) leaves the entry
    /// executing so the same call can be repeated later.
    pub fn run_escalation<R, P>(
        &self,
        chain: &RemediationChain,
        resolver: &R,
        profile: &SystemProfile,
        sudo_password: Option<&str>,
        progress: &mut P,
    ) -> Result<EscalationStep>
    where
        R: Resolver + ?Sized,
        P: ProgressCallback,
    {
        let entry = chain.current().ok_or(Error::EmptyStack)?;
        let Some(dep) = entry.option_detail.dep.clone() else {
            return Err(Error::InvalidTransition {
                from: entry.status.to_string(),
                action: "install a manual remediation for",
            });
        };

        let executing = chain.mark_executing()?;
        self.chains.save(&executing)?;
        log::info!(
            "Remediation depth {}: installing {dep}",
            executing.depth()
        );

        let install = match self.install_tool(&dep, profile, resolver, sudo_password, progress) {
            Ok(install) => install,
            Err(e) => {
                self.chains.save(&executing.mark_failed()?)?;
                return Err(e);
            }
        };

        let next = match &install {
            InstallOutcome::Executed(PlanResult {
                outcome: PlanOutcome::Paused { .. } | PlanOutcome::NeedsSudo { .. },
                ..
            }) => executing,
            outcome if outcome.is_satisfied() => executing.de_escalate()?,
            _ => executing.mark_failed()?,
        };
        self.chains.save(&next)?;

        Ok(EscalationStep {
            chain: next,
            install,
        })
    }
}
