//! Restart detection and batching
//!
//! Detection looks at what a plan changed; batching turns the result into
//! steps. Only service restarts ever become executable steps. Shell restarts
//! and reboots are emitted as notifications for the user to act on.

use crate::dag::package_manager_lock;
use crate::types::{Plan, RestartKind, Step, StepKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Package names that install or replace a GPU kernel driver.
static GPU_DRIVER_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(nvidia(-driver|-dkms|-open|-kernel)?(-\d[\w.]*)?|akmod-nvidia|kmod-nvidia[\w.-]*|cuda-drivers[\w.-]*|amdgpu(-pro|-dkms)?[\w.-]*|xf86-video-(nvidia|amdgpu)[\w.-]*)$",
    )
    .unwrap()
});

/// Installers that replace a GPU driver outside the package manager.
const GPU_DRIVER_PROGRAMS: &[&str] = &["nvidia-installer", "amdgpu-install", "ubuntu-drivers"];

/// Programs that load kernel modules.
const KERNEL_MODULE_PROGRAMS: &[&str] = &["modprobe", "insmod", "dkms"];

/// What has to restart after a plan, with one reason per trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartNeeds {
    pub shell_restart: bool,
    pub service_restart: Vec<String>,
    pub reboot_required: bool,
    /// A reboot would help but is not mandatory (e.g. module loaded live).
    #[serde(default)]
    pub reboot_suggested: bool,
    pub reasons: Vec<String>,
}

impl RestartNeeds {
    /// Whether nothing needs to restart.
    pub fn is_empty(&self) -> bool {
        !self.shell_restart
            && self.service_restart.is_empty()
            && !self.reboot_required
            && !self.reboot_suggested
    }

    fn add_service(&mut self, service: &str, reason: String) {
        if !self.service_restart.iter().any(|s| s == service) {
            self.service_restart.push(service.to_string());
        }
        self.reasons.push(reason);
    }
}

/// Work out which restarts the completed steps of a plan call for.
pub fn detect_restart_needs(plan: &Plan, completed: &[&Step]) -> RestartNeeds {
    let mut needs = RestartNeeds::default();

    for key in plan.post_env.keys() {
        needs.shell_restart = true;
        needs.reasons.push(format!("{key} changed for new shells"));
    }

    for step in completed {
        let name = step.display_name();

        match &step.kind {
            StepKind::Config {
                restarts: Some(service),
                path,
                ..
            } => needs.add_service(service, format!("{path} changed; {service} must reload it")),
            StepKind::ShellConfig { file, .. } => {
                needs.shell_restart = true;
                needs.reasons.push(format!("{file} updated by {name}"));
            }
            StepKind::Packages { packages, .. } => {
                if let Some(driver) = packages.iter().find(|p| GPU_DRIVER_PACKAGE.is_match(p)) {
                    needs.reboot_required = true;
                    needs
                        .reasons
                        .push(format!("GPU driver {driver} installed; reboot required"));
                }
            }
            _ => {}
        }

        if let Some(program) = program_name(step) {
            if KERNEL_MODULE_PROGRAMS.contains(&program) {
                needs.reboot_suggested = true;
                needs.reasons.push(format!(
                    "{name} loaded a kernel module; reboot suggested to confirm it loads at boot"
                ));
            } else if GPU_DRIVER_PROGRAMS.contains(&program) || installs_gpu_driver(step) {
                needs.reboot_required = true;
                needs
                    .reasons
                    .push(format!("{name} replaced the GPU driver; reboot required"));
            }
        }

        match step.restart_required {
            RestartKind::Shell if !needs.shell_restart => {
                needs.shell_restart = true;
                needs.reasons.push(format!("{name} requires a shell restart"));
            }
            RestartKind::Service => {
                if let StepKind::Service { service, .. } = &step.kind {
                    needs.add_service(service, format!("{name} requires {service} to restart"));
                }
            }
            RestartKind::Reboot if !needs.reboot_required => {
                needs.reboot_required = true;
                needs.reasons.push(format!("{name} requires a reboot"));
            }
            _ => {}
        }
    }

    needs
}

/// Package-manager commands that install a GPU driver package.
fn installs_gpu_driver(step: &Step) -> bool {
    program_name(step).and_then(package_manager_lock).is_some()
        && step.command.iter().any(|arg| GPU_DRIVER_PACKAGE.is_match(arg))
}

fn program_name(step: &Step) -> Option<&str> {
    step.command
        .iter()
        .map(String::as_str)
        .find(|arg| *arg != "sudo")
        .map(|p| p.rsplit('/').next().unwrap_or(p))
}

/// Turn restart needs into steps.
///
/// Service restarts become deduplicated `service` steps. Shell restarts and
/// reboots only ever become `notification` steps.
pub fn batch_restarts(needs: &RestartNeeds) -> Vec<Step> {
    let mut steps = Vec::new();

    let mut seen = Vec::new();
    for service in &needs.service_restart {
        if seen.contains(service) {
            continue;
        }
        seen.push(service.clone());

        let mut step = Step::new(StepKind::Service {
            service: service.clone(),
            action: Some("restart".to_string()),
        })
        .with_id(format!("restart_{service}"))
        .with_sudo();
        step.label = Some(format!("Restart {service}"));
        steps.push(step);
    }

    if needs.shell_restart {
        steps.push(notification(
            "notify_shell_restart",
            "Open a new terminal (or run `exec $SHELL -l`) so PATH changes take effect.",
        ));
    }

    if needs.reboot_required {
        steps.push(notification(
            "notify_reboot_required",
            "Reboot this machine to finish the installation.",
        ));
    } else if needs.reboot_suggested {
        steps.push(notification(
            "notify_reboot_suggested",
            "A reboot is recommended to confirm the new kernel module loads at boot.",
        ));
    }

    steps
}

fn notification(id: &str, message: &str) -> Step {
    Step::new(StepKind::Notification {
        message: message.to_string(),
    })
    .with_id(id)
}
