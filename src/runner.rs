//! Process-backed command executor

use anyhow::{Context, Result};
use installkit::{CommandExecutor, CommandOutput, CommandRequest};
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs step commands as child processes.
///
/// Privileged commands go through `sudo -S -p ''`, with the password written
/// to the child's stdin and never placed on the command line. Environment
/// overrides for privileged commands are passed through `env`, since sudo
/// resets the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(&self, request: &CommandRequest<'_>) -> Result<CommandOutput> {
        let start = Instant::now();
        let password = request.sudo_password.filter(|_| request.needs_sudo);

        let mut child = build_command(request, password.is_some())?
            .spawn()
            .with_context(|| format!("Failed to execute: {}", request.display()))?;

        if let (Some(mut stdin), Some(password)) = (child.stdin.take(), password) {
            // sudo may not read at all when credentials are cached
            if let Err(e) = writeln!(stdin, "{password}") {
                log::debug!("Could not write to sudo stdin: {e}");
            }
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_timeout(&mut child, request.timeout)?;
        let stdout = collect(stdout);
        let mut stderr = collect(stderr);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        Ok(match status {
            Some(status) => CommandOutput {
                ok: status.success(),
                stdout,
                stderr,
                exit_code: status.code(),
                elapsed_ms,
            },
            None => {
                stderr.push_str(&format!(
                    "\ntimed out after {}s",
                    request.timeout.as_secs()
                ));
                CommandOutput {
                    ok: false,
                    stdout,
                    stderr,
                    exit_code: None,
                    elapsed_ms,
                }
            }
        })
    }
}

fn build_command(request: &CommandRequest<'_>, pipe_password: bool) -> Result<Command> {
    let (program, args) = request
        .argv
        .split_first()
        .context("Cannot execute an empty command")?;

    let mut command = if request.needs_sudo {
        let mut command = Command::new("sudo");
        command.args(["-S", "-p", ""]);
        if !request.env.is_empty() {
            command.arg("env");
            command.args(request.env.iter().map(|(key, value)| format!("{key}={value}")));
        }
        command.arg(program).args(args);
        command
    } else {
        let mut command = Command::new(program);
        command.args(args).envs(&request.env);
        command
    };

    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    command
        .stdin(if pipe_password {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(command)
}

/// Read a pipe to the end on its own thread so the child never blocks on a
/// full pipe buffer.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Wait for the child; kill it once `timeout` passes. `None` means killed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for child")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            log::warn!("Command exceeded {}s, killing it", timeout.as_secs());
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
