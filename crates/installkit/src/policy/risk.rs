//! Step risk classification.

use crate::types::{Risk, Step, StepKind};

/// Programs whose effects cannot be safely reversed automatically.
const HIGH_RISK_PROGRAMS: &[&str] = &[
    "dd",
    "fdisk",
    "sfdisk",
    "gdisk",
    "sgdisk",
    "parted",
    "wipefs",
    "cryptsetup",
    "efibootmgr",
    "grub-install",
    "grub-mkconfig",
    "update-grub",
    "bootctl",
    "flashrom",
];

/// Programs that change system state but have well-known reverse actions.
const MEDIUM_RISK_PROGRAMS: &[&str] = &[
    "modprobe",
    "insmod",
    "dkms",
    "systemctl",
    "update-alternatives",
    "ldconfig",
    "usermod",
    "groupadd",
    "useradd",
];

/// Risk of a step, honoring an explicit declaration.
pub fn effective_risk(step: &Step) -> Risk {
    step.risk.unwrap_or_else(|| infer_risk(step))
}

/// Classify a step's danger from its kind and command.
pub fn infer_risk(step: &Step) -> Risk {
    let program = step
        .command
        .iter()
        .map(String::as_str)
        .find(|arg| *arg != "sudo")
        .map(|p| p.rsplit('/').next().unwrap_or(p));

    if let Some(program) = program {
        if HIGH_RISK_PROGRAMS.contains(&program) || program.starts_with("mkfs") {
            return Risk::High;
        }
        if MEDIUM_RISK_PROGRAMS.contains(&program) {
            return Risk::Medium;
        }
    }

    match step.kind {
        StepKind::Packages { .. }
        | StepKind::RepoSetup
        | StepKind::Service { .. }
        | StepKind::Config { .. }
        | StepKind::ShellConfig { .. } => Risk::Medium,
        _ if step.needs_sudo => Risk::Medium,
        _ => Risk::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_tools_are_high_risk() {
        let step = Step::new(StepKind::Tool).with_command(["sudo", "mkfs.ext4", "/dev/sdb1"]);
        assert_eq!(infer_risk(&step), Risk::High);
        let step = Step::new(StepKind::Tool).with_command(["/usr/sbin/parted", "/dev/sda"]);
        assert_eq!(infer_risk(&step), Risk::High);
    }

    #[test]
    fn test_system_changes_are_medium_risk() {
        let step = Step::new(StepKind::PostInstall).with_command(["modprobe", "nvidia"]);
        assert_eq!(infer_risk(&step), Risk::Medium);

        let step = Step::new(StepKind::Packages {
            packages: vec!["git".into()],
            package_manager: Some("apt".into()),
        });
        assert_eq!(infer_risk(&step), Risk::Medium);

        let step = Step::new(StepKind::Build).with_command(["make", "install"]).with_sudo();
        assert_eq!(infer_risk(&step), Risk::Medium);
    }

    #[test]
    fn test_user_local_work_is_low_risk() {
        let step = Step::new(StepKind::Build).with_command(["make", "-j4"]);
        assert_eq!(infer_risk(&step), Risk::Low);
        let step = Step::new(StepKind::Verify).with_command(["rg", "--version"]);
        assert_eq!(infer_risk(&step), Risk::Low);
    }

    #[test]
    fn test_declared_risk_wins() {
        let step = Step::new(StepKind::Build)
            .with_command(["make"])
            .with_risk(Risk::High);
        assert_eq!(effective_risk(&step), Risk::High);
    }
}
