// src/process.rs

//! External command execution
//!
//! Short commands (git, dch, quilt, apt-ftparchive, gpg) run to completion
//! with captured output. Builds run with their output sent to a log file,
//! under a wall-clock timeout, and stop early when cancellation is requested.
//! Children are placed in their own process group so that terminating a
//! build also terminates whatever it spawned.

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Lines of output logged when a command fails
pub const FAILURE_CONTEXT_LINES: usize = 20;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// How a long-running command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Exited(status) if status.success())
    }
}

/// Split a configured command line into arguments, shell-style
pub fn split_command(line: &str) -> Result<Vec<String>> {
    match shlex::split(line) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(Error::ConfigError(format!(
            "Cannot parse command line: {}",
            line
        ))),
    }
}

fn command_text<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter().map(|a| a.as_ref()).collect::<Vec<_>>().join(" ")
}

fn command_for<S: AsRef<str>>(cwd: &Path, argv: &[S], env: &[(&str, &str)]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::CommandFailed("Empty command".to_string()))?;
    let mut command = Command::new(program.as_ref());
    command
        .args(args.iter().map(|a| a.as_ref()))
        .envs(env.iter().copied())
        .current_dir(cwd)
        .stdin(Stdio::null());
    Ok(command)
}

/// Run a command and return its raw output, whatever the exit status
pub fn run_status<S: AsRef<str>>(cwd: &Path, argv: &[S]) -> Result<Output> {
    output_of(cwd, argv, &[])
}

fn output_of<S: AsRef<str>>(cwd: &Path, argv: &[S], env: &[(&str, &str)]) -> Result<Output> {
    debug!("Running in {}: {}", cwd.display(), command_text(argv));
    command_for(cwd, argv, env)?
        .output()
        .map_err(|e| {
            Error::CommandFailed(format!("Failed to execute {}: {}", command_text(argv), e))
        })
}

/// Run a command, failing unless it exits successfully; returns stdout
pub fn run_checked<S: AsRef<str>>(cwd: &Path, argv: &[S]) -> Result<String> {
    run_checked_env(cwd, argv, &[])
}

/// [`run_checked`] with extra environment variables
pub fn run_checked_env<S: AsRef<str>>(
    cwd: &Path,
    argv: &[S],
    env: &[(&str, &str)],
) -> Result<String> {
    let output = output_of(cwd, argv, env)?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{}{}", stdout, stderr);
    log_failure(&command_text(argv), &combined);
    Err(Error::CommandFailed(format!(
        "{} exited with {}: {}",
        command_text(argv),
        describe_status(&output.status),
        last_line(&stderr).or_else(|| last_line(&stdout)).unwrap_or("no output")
    )))
}

/// Run a long command with its output written to `log_path`
///
/// The command is polled once per second; on timeout or cancellation its
/// process group receives SIGTERM, then SIGKILL after a grace period.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
    cancel: &CancelFlag,
    log_path: &Path,
) -> Result<RunOutcome> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log = File::create(log_path)?;
    let log_err = log.try_clone()?;
    command
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err)
        .process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| Error::CommandFailed(format!("Failed to spawn {:?}: {}", command, e)))?;
    let started = Instant::now();

    loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
            return Ok(RunOutcome::Exited(status));
        }
        if cancel.is_cancelled() {
            warn!("Cancellation requested, terminating {:?}", command.get_program());
            terminate(&mut child);
            return Ok(RunOutcome::Cancelled);
        }
        if started.elapsed() >= timeout {
            warn!(
                "{:?} exceeded its timeout of {:?}, terminating",
                command.get_program(),
                timeout
            );
            terminate(&mut child);
            return Ok(RunOutcome::TimedOut);
        }
    }
}

fn terminate(child: &mut Child) {
    let group = Pid::from_raw(child.id() as i32);
    let _ = killpg(group, Signal::SIGTERM);
    if let Ok(Some(_)) = child.wait_timeout(TERMINATE_GRACE) {
        return;
    }
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

/// Log the tail of a failed command's output
pub fn log_failure(what: &str, output: &str) {
    error!(
        "Failure while running {}: (last {} lines)",
        what, FAILURE_CONTEXT_LINES
    );
    for line in tail(output, FAILURE_CONTEXT_LINES) {
        error!("  {}", line);
    }
}

/// Last `count` lines of a log file, empty if it cannot be read
pub fn tail_file(path: &Path, count: usize) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => tail(&String::from_utf8_lossy(&bytes), count)
            .into_iter()
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn tail(output: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().collect();
    lines[lines.len().saturating_sub(count)..].to_vec()
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().find(|l| !l.trim().is_empty())
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}
