//! Step dependency graph - identity, validation and ready-set scheduling
//!
//! All functions here are pure. The orchestrator calls them once per
//! scheduling round; nothing in this module touches the system.

use crate::types::{Step, StepKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// A structural problem in a step graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Step at this position has no id.
    MissingId(usize),
    /// Two steps share an id.
    DuplicateId(String),
    /// A step depends on an id no step declares.
    UnknownDependency { step: String, dep: String },
    /// These steps could not be ordered.
    Cycle(Vec<String>),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId(index) => write!(f, "step #{index} has no id"),
            Self::DuplicateId(id) => write!(f, "duplicate step id: {id}"),
            Self::UnknownDependency { step, dep } => {
                write!(f, "step {step} depends on unknown step {dep}")
            }
            Self::Cycle(ids) => write!(f, "dependency cycle among: {}", ids.join(", ")),
        }
    }
}

/// Give every step an id and an explicit dependency list.
///
/// Missing ids become `step_<index>`; a missing `depends_on` becomes the
/// previous step (or nothing for the first step). Applying this twice
/// changes nothing.
pub fn assign_identity(steps: &mut [Step]) {
    for (index, step) in steps.iter_mut().enumerate() {
        if step.id.as_deref().is_none_or(str::is_empty) {
            step.id = Some(format!("step_{index}"));
        }
    }

    let mut previous: Option<String> = None;
    for step in steps.iter_mut() {
        if step.depends_on.is_none() {
            step.depends_on = Some(previous.iter().cloned().collect());
        }
        previous = step.id.clone();
    }
}

/// Check ids, references and acyclicity.
///
/// Cycle detection is skipped when id or reference errors were found.
pub fn validate(steps: &[Step]) -> Vec<GraphError> {
    let mut errors = Vec::new();
    let mut ids = HashSet::new();

    for (index, step) in steps.iter().enumerate() {
        match step.id.as_deref() {
            None | Some("") => errors.push(GraphError::MissingId(index)),
            Some(id) => {
                if !ids.insert(id) {
                    errors.push(GraphError::DuplicateId(id.to_string()));
                }
            }
        }
    }

    for step in steps {
        for dep in dependencies(step) {
            if !ids.contains(dep.as_str()) {
                errors.push(GraphError::UnknownDependency {
                    step: step.id_str().to_string(),
                    dep: dep.clone(),
                });
            }
        }
    }

    if !errors.is_empty() {
        return errors;
    }

    if let Some(cycle) = find_unordered(steps) {
        errors.push(GraphError::Cycle(cycle));
    }
    errors
}

/// Kahn's algorithm: returns the ids left over when no zero-in-degree node
/// remains, or `None` when every step could be ordered.
fn find_unordered(steps: &[Step]) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        let deps = dependencies(step);
        in_degree.insert(step.id_str(), deps.len());
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(step.id_str());
        }
    }

    let mut queue: VecDeque<&str> = steps
        .iter()
        .map(Step::id_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut processed = HashSet::new();

    while let Some(id) = queue.pop_front() {
        processed.insert(id);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if processed.len() == steps.len() {
        None
    } else {
        Some(
            steps
                .iter()
                .map(Step::id_str)
                .filter(|id| !processed.contains(id))
                .map(ToString::to_string)
                .collect(),
        )
    }
}

fn dependencies(step: &Step) -> &[String] {
    step.depends_on.as_deref().unwrap_or(&[])
}

/// Steps not yet completed or running whose dependencies are all completed.
pub fn ready_set<'a>(
    steps: &'a [Step],
    completed: &HashSet<String>,
    running: &HashSet<String>,
) -> Vec<&'a Step> {
    steps
        .iter()
        .filter(|step| !completed.contains(step.id_str()) && !running.contains(step.id_str()))
        .filter(|step| dependencies(step).iter().all(|dep| completed.contains(dep)))
        .collect()
}

/// Keep at most one step per mutually exclusive resource.
///
/// The first candidate for a resource wins; steps without an inferred
/// resource always pass.
pub fn enforce_parallel_safety<'a>(candidates: Vec<&'a Step>) -> Vec<&'a Step> {
    let mut claimed = HashSet::new();
    candidates
        .into_iter()
        .filter(|step| match infer_resource(step) {
            Some(resource) => {
                let first = claimed.insert(resource);
                if !first {
                    log::debug!(
                        "Deferring {} - {} lock already claimed this round",
                        step.id_str(),
                        resource
                    );
                }
                first
            }
            None => true,
        })
        .collect()
}

/// The package-manager lock a step would hold while running.
pub fn infer_resource(step: &Step) -> Option<&'static str> {
    if step.command.is_empty()
        && let StepKind::Packages {
            package_manager: Some(manager),
            ..
        } = &step.kind
    {
        return package_manager_lock(manager);
    }

    let program = step
        .command
        .iter()
        .map(String::as_str)
        .find(|arg| !matches!(*arg, "sudo" | "env" | "-E" | "nice"))?;
    package_manager_lock(program)
}

/// Map a package-manager binary (or path to one) to its lock group.
pub fn package_manager_lock(program: &str) -> Option<&'static str> {
    let name = program.rsplit('/').next().unwrap_or(program);
    match name {
        "apt-get" | "apt" | "dpkg" => Some("apt"),
        "dnf" | "yum" => Some("dnf"),
        "apk" => Some("apk"),
        "pacman" => Some("pacman"),
        "zypper" => Some("zypper"),
        "snap" => Some("snap"),
        "brew" => Some("brew"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(id: &str) -> Step {
        Step::new(StepKind::Tool).with_id(id)
    }

    fn ids(steps: &[&Step]) -> Vec<String> {
        steps.iter().map(|s| s.id_str().to_string()).collect()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_assign_identity_builds_linear_chain() {
        let mut steps = vec![
            Step::new(StepKind::Tool),
            Step::new(StepKind::Build),
            Step::new(StepKind::Verify),
        ];
        assign_identity(&mut steps);

        assert_eq!(steps[0].id.as_deref(), Some("step_0"));
        assert_eq!(steps[0].depends_on, Some(vec![]));
        assert_eq!(steps[1].depends_on, Some(vec!["step_0".to_string()]));
        assert_eq!(steps[2].depends_on, Some(vec!["step_1".to_string()]));
    }

    #[test]
    fn test_assign_identity_is_idempotent() {
        let mut steps = vec![
            Step::new(StepKind::Tool),
            tool("named"),
            Step::new(StepKind::Verify).depends_on(Vec::<String>::new()),
        ];
        assign_identity(&mut steps);
        let once = steps.clone();
        assign_identity(&mut steps);
        assert_eq!(steps, once);
        assert_eq!(steps[1].depends_on, Some(vec!["step_0".to_string()]));
        assert_eq!(steps[2].depends_on, Some(vec![]));
    }

    #[test]
    fn test_validate_accepts_diamond() {
        let steps = vec![
            tool("a").depends_on(Vec::<String>::new()),
            tool("b").depends_on(["a"]),
            tool("c").depends_on(["a"]),
            tool("d").depends_on(["b", "c"]),
        ];
        assert!(validate(&steps).is_empty());
    }

    #[test]
    fn test_validate_detects_cycle() {
        let steps = vec![
            tool("a").depends_on(Vec::<String>::new()),
            tool("b").depends_on(["c"]),
            tool("c").depends_on(["b"]),
        ];
        let errors = validate(&steps);
        assert_eq!(
            errors,
            vec![GraphError::Cycle(vec!["b".to_string(), "c".to_string()])]
        );
    }

    #[test]
    fn test_validate_detects_self_loop() {
        let steps = vec![tool("a").depends_on(["a"])];
        assert!(matches!(validate(&steps)[0], GraphError::Cycle(_)));
    }

    #[test]
    fn test_validate_short_circuits_cycle_check() {
        let steps = vec![
            tool("a").depends_on(["b"]),
            tool("b").depends_on(["a"]),
            tool("b").depends_on(["ghost"]),
        ];
        let errors = validate(&steps);
        assert!(errors.contains(&GraphError::DuplicateId("b".into())));
        assert!(errors.contains(&GraphError::UnknownDependency {
            step: "b".into(),
            dep: "ghost".into()
        }));
        assert!(!errors.iter().any(|e| matches!(e, GraphError::Cycle(_))));
    }

    #[test]
    fn test_validate_reports_missing_id() {
        let steps = vec![Step::new(StepKind::Tool)];
        assert_eq!(validate(&steps), vec![GraphError::MissingId(0)]);
    }

    #[test]
    fn test_ready_set() {
        let steps = vec![
            tool("a").depends_on(Vec::<String>::new()),
            tool("b").depends_on(["a"]),
            tool("c").depends_on(["a"]),
            tool("d").depends_on(["b", "c"]),
        ];

        assert_eq!(ids(&ready_set(&steps, &set(&[]), &set(&[]))), vec!["a"]);
        assert_eq!(
            ids(&ready_set(&steps, &set(&["a"]), &set(&[]))),
            vec!["b", "c"]
        );
        assert_eq!(
            ids(&ready_set(&steps, &set(&["a"]), &set(&["b"]))),
            vec!["c"]
        );
        assert_eq!(
            ids(&ready_set(&steps, &set(&["a", "b", "c"]), &set(&[]))),
            vec!["d"]
        );
    }

    #[test]
    fn test_parallel_safety_one_per_package_manager() {
        let a = tool("a").with_command(["apt-get", "install", "-y", "cmake"]);
        let b = tool("b").with_command(["sudo", "apt", "install", "ninja-build"]);
        let c = tool("c").with_command(["brew", "install", "jq"]);
        let d = tool("d").with_command(["curl", "-fsSL", "https://example.com"]);

        let passed = enforce_parallel_safety(vec![&a, &b, &c, &d]);
        assert_eq!(ids(&passed), vec!["a", "c", "d"]);

        let passed = enforce_parallel_safety(vec![&b, &a, &c]);
        assert_eq!(ids(&passed), vec!["b", "c"]);
    }

    #[test]
    fn test_infer_resource() {
        let dnf = tool("x").with_command(["/usr/bin/yum", "install", "gcc"]);
        assert_eq!(infer_resource(&dnf), Some("dnf"));

        let pkgs = Step::new(StepKind::Packages {
            packages: vec!["git".into()],
            package_manager: Some("pacman".into()),
        });
        assert_eq!(infer_resource(&pkgs), Some("pacman"));

        let plain = tool("y").with_command(["make"]);
        assert_eq!(infer_resource(&plain), None);
    }
}
