//! Version constraint checking
//!
//! Parsing is deliberately loose and checking fails open: a version that
//! cannot be parsed is reported as valid with `parse_error` set, so a
//! surprising version string never blocks an install on its own.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A constraint a selected version must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionConstraint {
    /// Same major, minor within `range` of the reference (kubectl vs cluster).
    MinorRange {
        reference: String,
        #[serde(default = "default_range")]
        range: u64,
    },
    /// At least the reference.
    Gte { reference: String },
    /// Equal to the reference, missing parts read as zero.
    Exact { reference: String },
    /// Same major, minor not below the reference. Patch is not compared.
    SemverCompat { reference: String },
}

fn default_range() -> u64 {
    1
}

impl VersionConstraint {
    fn reference(&self) -> &str {
        match self {
            Self::MinorRange { reference, .. }
            | Self::Gte { reference }
            | Self::Exact { reference }
            | Self::SemverCompat { reference } => reference,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinorRange { reference, range } => {
                write!(f, "within {range} minor version(s) of {reference}")
            }
            Self::Gte { reference } => write!(f, ">= {reference}"),
            Self::Exact { reference } => write!(f, "== {reference}"),
            Self::SemverCompat { reference } => write!(f, "compatible with {reference}"),
        }
    }
}

/// Outcome of a version check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCheck {
    pub valid: bool,
    pub message: String,
    /// Set when either version could not be parsed and the check was skipped.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parse_error: bool,
}

/// Parse `v1.2.3`, `1.2`, `1.30.0-rc.1+build` into (major, minor, patch).
///
/// Pre-release and build suffixes are ignored. Missing parts are zero.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let core = trimmed.split(['-', '+']).next()?;
    if core.is_empty() {
        return None;
    }

    let parts = core
        .split('.')
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    match parts.as_slice() {
        [major] => Some((*major, 0, 0)),
        [major, minor] => Some((*major, *minor, 0)),
        [major, minor, patch] => Some((*major, *minor, *patch)),
        _ => None,
    }
}

/// Check `version` against `constraint`.
pub fn check_version_constraint(version: &str, constraint: &VersionConstraint) -> VersionCheck {
    let reference = constraint.reference();
    let (Some(selected), Some(wanted)) = (parse_version(version), parse_version(reference))
    else {
        log::debug!("Could not compare versions {version:?} and {reference:?}; allowing");
        return VersionCheck {
            valid: true,
            message: format!("could not compare {version} with {reference}; not enforced"),
            parse_error: true,
        };
    };

    let valid = match constraint {
        VersionConstraint::MinorRange { range, .. } => {
            selected.0 == wanted.0 && selected.1.abs_diff(wanted.1) <= *range
        }
        VersionConstraint::Gte { .. } => selected >= wanted,
        VersionConstraint::Exact { .. } => selected == wanted,
        VersionConstraint::SemverCompat { .. } => selected.0 == wanted.0 && selected.1 >= wanted.1,
    };

    let message = if valid {
        format!("{version} satisfies {constraint}")
    } else {
        format!("{version} does not satisfy {constraint}")
    };

    VersionCheck {
        valid,
        message,
        parse_error: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minor_range(reference: &str, range: u64) -> VersionConstraint {
        VersionConstraint::MinorRange {
            reference: reference.into(),
            range,
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("v1.30"), Some((1, 30, 0)));
        assert_eq!(parse_version(" 2 "), Some((2, 0, 0)));
        assert_eq!(parse_version("1.30.0-rc.1+abc"), Some((1, 30, 0)));
        assert_eq!(parse_version("latest"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_minor_range() {
        let constraint = minor_range("1.29.0", 1);
        assert!(!check_version_constraint("1.31.0", &constraint).valid);
        assert!(check_version_constraint("1.30.0", &constraint).valid);
        assert!(check_version_constraint("1.28.5", &constraint).valid);
        assert!(!check_version_constraint("2.29.0", &constraint).valid);
    }

    #[test]
    fn test_gte_and_exact() {
        let gte = VersionConstraint::Gte {
            reference: "3.20".into(),
        };
        assert!(check_version_constraint("3.20.0", &gte).valid);
        assert!(check_version_constraint("4.0.0", &gte).valid);
        assert!(!check_version_constraint("3.19.9", &gte).valid);

        let exact = VersionConstraint::Exact {
            reference: "v1.2".into(),
        };
        assert!(check_version_constraint("1.2.0", &exact).valid);
        assert!(!check_version_constraint("1.2.1", &exact).valid);
    }

    #[test]
    fn test_semver_compat() {
        let constraint = VersionConstraint::SemverCompat {
            reference: "1.4.0".into(),
        };
        assert!(check_version_constraint("1.7.2", &constraint).valid);
        assert!(!check_version_constraint("1.3.9", &constraint).valid);
        assert!(!check_version_constraint("2.0.0", &constraint).valid);
    }

    #[test]
    fn test_semver_compat_ignores_patch() {
        let constraint = VersionConstraint::SemverCompat {
            reference: "1.4.5".into(),
        };
        assert!(check_version_constraint("1.4.3", &constraint).valid);
        assert!(check_version_constraint("1.4.0", &constraint).valid);
        assert!(!check_version_constraint("1.3.9", &constraint).valid);
    }

    #[test]
    fn test_unparseable_fails_open() {
        let check = check_version_constraint("nightly", &minor_range("1.29.0", 1));
        assert!(check.valid);
        assert!(check.parse_error);
    }

    #[test]
    fn test_constraint_deserializes_with_default_range() {
        let constraint: VersionConstraint =
            serde_json::from_str(r#"{"type": "minor_range", "reference": "1.29.0"}"#).unwrap();
        assert_eq!(constraint, minor_range("1.29.0", 1));
    }
}
