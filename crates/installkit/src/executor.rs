//! Step executor - dispatches one step to its kind handler
//!
//! Handlers only build argv and interpret output. Spawning, sudo password
//! piping and timeouts belong to the [`CommandExecutor`] collaborator.

use crate::context::{CommandExecutor, CommandOutput, CommandRequest};
use crate::policy::{
    RollbackAction, check_version_constraint, effective_risk, find_placeholders, render_template, validate_inputs,
    validate_output,
};
use crate::types::{
    InputSpec, OutputFormat, REDACTED, Remediation, RemediationOption, Risk, Step, StepKind,
    StepResult,
};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

const SECURE_BOOT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Appends `$1` to file `$2` unless an identical line is already there.
const APPEND_LINE_SCRIPT: &str =
    r#"grep -qxF -- "$1" "$2" 2>/dev/null || printf '%s\n' "$1" >> "$2""#;

/// Runs single steps through a [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct StepExecutor<E> {
    executor: E,
    timeout: Duration,
}

impl<E: CommandExecutor> StepExecutor<E> {
    /// Create an executor; `timeout` applies to steps without `timeout_secs`.
    pub fn new(executor: E, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// The underlying command executor.
    pub fn command_executor(&self) -> &E {
        &self.executor
    }

    /// Execute one step.
    ///
    /// Never returns an error: spawn failures and refusals are reported in
    /// the [`StepResult`].
    pub fn execute(
        &self,
        step: &Step,
        sudo_password: Option<&str>,
        env_overrides: &BTreeMap<String, String>,
    ) -> StepResult {
        let started = Instant::now();

        if step.needs_sudo && sudo_password.is_none() {
            log::debug!("{} needs sudo and no password was supplied", step.display_name());
            return StepResult::needs_sudo();
        }

        let mut warnings = Vec::new();
        if effective_risk(step) == Risk::High
            && let Some(path) = &step.backup_before
            && let Err(warning) = self.backup(step, path, sudo_password)
        {
            log::warn!("{warning}");
            warnings.push(warning);
        }

        let ctx = RunContext {
            step,
            password: sudo_password,
            env: env_overrides,
        };
        let mut result = self.dispatch(&ctx);

        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        result.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    /// Run one rollback action as a cleanup step.
    pub fn run_rollback(&self, action: &RollbackAction, sudo_password: Option<&str>) -> StepResult {
        let mut step = Step::new(StepKind::Cleanup).with_command(action.command.iter().cloned());
        step.needs_sudo = action.needs_sudo;
        step.label = Some(format!("rollback {}", action.label));
        self.execute(&step, sudo_password, &BTreeMap::new())
    }

    fn dispatch(&self, ctx: &RunContext<'_>) -> StepResult {
        match &ctx.step.kind {
            StepKind::Unknown => StepResult::failed("unknown step type"),
            StepKind::Notification { message } => {
                log::info!("{message}");
                let mut result = StepResult::succeeded();
                result.stdout.clone_from(message);
                result
            }
            StepKind::Packages {
                packages,
                package_manager,
            } if ctx.step.command.is_empty() => {
                self.install_packages(ctx, packages, package_manager.as_deref())
            }
            StepKind::Source {
                url: Some(url),
                dest: Some(dest),
            } => {
                let dest = expand_path(dest);
                if dest.exists() {
                    return StepResult::skipped(format!("{} already exists", dest.display()));
                }
                let argv =
                    argv(["git", "clone", "--depth", "1", url.as_str()]).chain_path(&dest);
                self.run(ctx, argv, ctx.step.needs_sudo)
            }
            StepKind::Download { url, dest } => {
                let dest = expand_path(dest);
                if dest.exists() {
                    return StepResult::skipped(format!("{} already exists", dest.display()));
                }
                self.download(ctx, url, &dest)
            }
            StepKind::GithubRelease {
                repo,
                asset,
                version,
                constraint,
                dest,
            } => {
                let mut warnings = Vec::new();
                if let (Some(version), Some(constraint)) = (version, constraint) {
                    let check = check_version_constraint(version, constraint);
                    if !check.valid {
                        return StepResult::failed(check.message);
                    }
                    if check.parse_error {
                        warnings.push(check.message);
                    }
                }

                let dest = expand_path(dest);
                if dest.exists() {
                    return StepResult::skipped(format!("{} already exists", dest.display()));
                }
                let url = release_url(repo, asset, version.as_deref());
                let result = self.download(ctx, &url, &dest);
                if !result.is_ok() {
                    return result;
                }
                let mut result = self.run(
                    ctx,
                    argv(["chmod", "+x"]).chain_path(&dest),
                    ctx.step.needs_sudo,
                );
                result.warnings.append(&mut warnings);
                result
            }
            StepKind::Service { service, action } => {
                let action = action.as_deref().unwrap_or("restart");
                self.run(
                    ctx,
                    argv(["systemctl", action, service.as_str()]),
                    ctx.step.needs_sudo,
                )
            }
            StepKind::Config {
                path,
                template,
                format,
                inputs,
                ..
            } => self.write_config(ctx, path, template, *format, inputs),
            StepKind::ShellConfig { file, line } => {
                let file = expand_path(file);
                let argv = argv(["sh", "-c", APPEND_LINE_SCRIPT, "sh", line.as_str()])
                    .chain_path(&file);
                self.run(ctx, argv, ctx.step.needs_sudo)
            }
            StepKind::PostInstall => {
                if let Some(blocked) = self.check_secure_boot(ctx.step) {
                    return blocked;
                }
                self.run_declared(ctx)
            }
            StepKind::Packages { .. }
            | StepKind::Source { .. }
            | StepKind::RepoSetup
            | StepKind::Tool
            | StepKind::Verify
            | StepKind::Build
            | StepKind::Install
            | StepKind::Cleanup => self.run_declared(ctx),
        }
    }

    fn run_declared(&self, ctx: &RunContext<'_>) -> StepResult {
        let (argv, sudo) = strip_sudo(&ctx.step.command, ctx.step.needs_sudo);
        if argv.is_empty() {
            return StepResult::failed(format!("{} step has no command", ctx.step.kind));
        }
        self.run(ctx, argv, sudo)
    }

    fn install_packages(
        &self,
        ctx: &RunContext<'_>,
        packages: &[String],
        manager: Option<&str>,
    ) -> StepResult {
        if packages.is_empty() {
            return StepResult::skipped("no packages to install");
        }
        let Some(manager) = manager else {
            return StepResult::failed("packages step has neither a command nor a package manager");
        };
        let Some((mut argv, sudo)) = install_argv(manager) else {
            return StepResult::failed(format!("unsupported package manager: {manager}"));
        };
        argv.extend(packages.iter().cloned());

        if matches!(manager, "apt" | "apt-get") {
            let mut env = ctx.env.clone();
            env.insert("DEBIAN_FRONTEND".into(), "noninteractive".into());
            let ctx = RunContext { env: &env, ..*ctx };
            return self.run(&ctx, argv, sudo);
        }
        self.run(ctx, argv, sudo)
    }

    fn download(&self, ctx: &RunContext<'_>, url: &str, dest: &Path) -> StepResult {
        let argv = argv(["curl", "-fsSL", "--create-dirs", "-o"])
            .chain_path(dest)
            .chain([url.to_string()]);
        self.run(ctx, argv, ctx.step.needs_sudo)
    }

    fn write_config(
        &self,
        ctx: &RunContext<'_>,
        path: &str,
        template: &str,
        format: OutputFormat,
        inputs: &[InputSpec],
    ) -> StepResult {
        if let Some(input) = inputs.iter().find(|input| {
            input.is_sensitive()
                && input.effective_value().and_then(|v| v.as_str()) == Some(REDACTED)
        }) {
            return StepResult::failed(format!(
                "input {} was redacted when the plan was saved; supply it again",
                input.name
            ));
        }

        let errors = validate_inputs(inputs);
        if !errors.is_empty() {
            return StepResult::failed(format!("invalid inputs: {}", errors.join("; ")));
        }

        let rendered = render_template(template, inputs);
        let leftover = find_placeholders(&rendered);
        if !leftover.is_empty() {
            return StepResult::failed(format!(
                "unsubstituted placeholders: {}",
                leftover.join(", ")
            ));
        }
        if let Err(e) = validate_output(&rendered, format) {
            return StepResult::failed(format!("rendered config is invalid: {e}"));
        }

        let staged = match stage(&rendered) {
            Ok(file) => file,
            Err(e) => return StepResult::failed(format!("could not stage config: {e}")),
        };
        let argv = argv(["install", "-D", "-m", "0644"])
            .chain_path(staged.path())
            .chain_path(&expand_path(path));
        self.run(ctx, argv, ctx.step.needs_sudo)
    }

    /// Refuse `modprobe` while Secure Boot would reject the module.
    fn check_secure_boot(&self, step: &Step) -> Option<StepResult> {
        let (argv, _) = strip_sudo(&step.command, false);
        if argv.first().map(|p| basename(p)) != Some("modprobe") {
            return None;
        }
        if !self.secure_boot_enabled() {
            return None;
        }

        let module = argv
            .iter()
            .skip(1)
            .find(|arg| !arg.starts_with('-'))
            .map_or("the module", String::as_str);
        log::warn!("Secure Boot is enabled; not loading {module}");

        let mut result = StepResult::failed(format!(
            "Secure Boot is enabled; the kernel will refuse to load unsigned module {module}"
        ));
        result.remediation = Some(Remediation {
            failure_id: "secure_boot_blocks_module".to_string(),
            reason: format!("Secure Boot rejects unsigned kernel modules such as {module}"),
            options: vec![
                RemediationOption {
                    id: "disable_secure_boot".into(),
                    label: "Disable Secure Boot in the firmware settings".into(),
                    strategy: "manual".into(),
                    dep: None,
                },
                RemediationOption {
                    id: "sign_with_mok".into(),
                    label: "Sign the module and enroll the key with `mokutil --import`".into(),
                    strategy: "manual".into(),
                    dep: None,
                },
                RemediationOption {
                    id: "use_dkms".into(),
                    label: "Build the module through DKMS so it is signed automatically".into(),
                    strategy: "install_dep".into(),
                    dep: Some("dkms".into()),
                },
            ],
        });
        Some(result)
    }

    /// Unknown or failed probes count as disabled.
    fn secure_boot_enabled(&self) -> bool {
        let request = CommandRequest::new(
            vec!["mokutil".into(), "--sb-state".into()],
            SECURE_BOOT_PROBE_TIMEOUT,
        );
        match self.executor.run(&request) {
            Ok(output) => {
                output.stdout.contains("SecureBoot enabled")
                    || output.stderr.contains("SecureBoot enabled")
            }
            Err(e) => {
                log::debug!("Secure Boot probe failed, assuming disabled: {e}");
                false
            }
        }
    }

    /// Copy `path` to `<path>.bak-<timestamp>`. Missing paths need no backup.
    fn backup(&self, step: &Step, path: &str, password: Option<&str>) -> Result<(), String> {
        let source = expand_path(path);
        if !source.exists() {
            log::debug!("Nothing to back up at {}", source.display());
            return Ok(());
        }
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let mut target = source.clone().into_os_string();
        target.push(format!(".bak-{stamp}"));

        let request = CommandRequest::new(
            argv(["cp", "-a"]).chain_path(&source).chain_path(Path::new(&target)),
            self.timeout,
        )
        .with_sudo(step.needs_sudo, password);

        match self.executor.run(&request) {
            Ok(output) if output.ok => {
                log::info!("Backed up {} before {}", source.display(), step.display_name());
                Ok(())
            }
            Ok(output) => Err(format!(
                "backup of {} failed: {}",
                source.display(),
                output.stderr.trim()
            )),
            Err(e) => Err(format!("backup of {} failed: {e}", source.display())),
        }
    }

    fn run(&self, ctx: &RunContext<'_>, argv: Vec<String>, sudo: bool) -> StepResult {
        if sudo && ctx.password.is_none() {
            return StepResult::needs_sudo();
        }

        let timeout = ctx
            .step
            .timeout_secs
            .map_or(self.timeout, Duration::from_secs);
        let request = CommandRequest::new(argv, timeout)
            .with_sudo(sudo, ctx.password)
            .with_env(expand_env(ctx.env))
            .with_cwd(ctx.step.cwd.as_deref().map(expand_path));

        log::debug!(
            "Running {}{}",
            if sudo { "sudo " } else { "" },
            request.display()
        );

        match self.executor.run(&request) {
            Ok(output) => interpret(output, sudo, &request),
            Err(e) => StepResult::failed(format!(
                "could not run {}: {e:#}",
                request.argv.first().map_or("command", String::as_str)
            )),
        }
    }
}

/// Borrowed inputs shared by the handlers of one step.
#[derive(Clone, Copy)]
struct RunContext<'a> {
    step: &'a Step,
    password: Option<&'a str>,
    env: &'a BTreeMap<String, String>,
}

fn interpret(output: CommandOutput, sudo: bool, request: &CommandRequest<'_>) -> StepResult {
    let mut result = if output.ok {
        StepResult::succeeded()
    } else if sudo && is_sudo_rejection(&output.stderr) {
        log::debug!("sudo rejected the supplied password");
        StepResult::needs_sudo()
    } else {
        let program = request.argv.first().map_or("command", String::as_str);
        match output.exit_code {
            Some(code) => StepResult::failed(format!("{program} exited with code {code}")),
            None => StepResult::failed(format!("{program} did not exit normally (timeout or signal)")),
        }
    };
    result.stdout = output.stdout;
    result.stderr = output.stderr;
    result
}

/// sudo's messages for a wrong or missing password.
fn is_sudo_rejection(stderr: &str) -> bool {
    ["incorrect password", "Sorry, try again", "a password is required"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Install argv prefix for a package manager, and whether it needs root.
fn install_argv(manager: &str) -> Option<(Vec<String>, bool)> {
    let (prefix, sudo): (&[&str], bool) = match manager {
        "apt" | "apt-get" => (&["apt-get", "install", "-y"], true),
        "dnf" => (&["dnf", "install", "-y"], true),
        "yum" => (&["yum", "install", "-y"], true),
        "apk" => (&["apk", "add"], true),
        "pacman" => (&["pacman", "-S", "--noconfirm", "--needed"], true),
        "zypper" => (&["zypper", "--non-interactive", "install"], true),
        "snap" => (&["snap", "install"], true),
        "brew" => (&["brew", "install"], false),
        _ => return None,
    };
    Some((prefix.iter().map(ToString::to_string).collect(), sudo))
}

fn release_url(repo: &str, asset: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => {
            format!("https://github.com/{repo}/releases/download/{version}/{asset}")
        }
        None => format!("https://github.com/{repo}/releases/latest/download/{asset}"),
    }
}

/// Drop a leading `sudo` from argv, turning it into the sudo flag.
fn strip_sudo(command: &[String], needs_sudo: bool) -> (Vec<String>, bool) {
    match command.split_first() {
        Some((first, rest)) if first == "sudo" => (rest.to_vec(), true),
        _ => (command.to_vec(), needs_sudo),
    }
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn stage(content: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("provision-config-")
        .tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Expand `~` and `$VAR` in override values against the current environment.
fn expand_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let expanded = shellexpand::full(value).map_or_else(|_| value.clone(), Cow::into_owned);
            (key.clone(), expanded)
        })
        .collect()
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

trait ArgvExt {
    fn chain_path(self, path: &Path) -> Self;
    fn chain<I: IntoIterator<Item = String>>(self, more: I) -> Self;
}

impl ArgvExt for Vec<String> {
    fn chain_path(mut self, path: &Path) -> Self {
        self.push(path.to_string_lossy().into_owned());
        self
    }

    fn chain<I: IntoIterator<Item = String>>(mut self, more: I) -> Self {
        self.extend(more);
        self
    }
}
