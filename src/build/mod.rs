// src/build/mod.rs

//! Per-architecture binary package builds
//!
//! A build runs `debuild -b -us -uc` in the packaging working tree, either
//! directly on the host or through a wrapper that provides an isolated or
//! emulated environment (`<wrapper> -- debuild ...`). Builds are never
//! retried here; a failed, timed-out or cancelled build is reported as a
//! failure attempt and the caller decides what happens next.

use crate::cancel::CancelFlag;
use crate::deb822::{changes_files, parse_stanzas};
use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::prepare::actions::{self, Step};
use crate::process::{
    FAILURE_CONTEXT_LINES, RunOutcome, log_failure, run_checked, run_with_timeout, split_command,
    tail_file,
};
use crate::state::{AutoRefs, BuildAttempt};
use crate::version::UpstreamVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const BUILD_COMMAND: &[&str] = &["debuild", "-b", "-us", "-uc"];

/// Where a build runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionContext {
    /// On the host
    Direct,
    /// Through a wrapper command, e.g. an emulated builder
    Isolated { wrapper: String },
}

impl ExecutionContext {
    /// Full command line for `base` in this context
    pub fn command_line(&self, base: &[&str]) -> Result<Vec<String>> {
        let mut argv = match self {
            ExecutionContext::Direct => Vec::new(),
            ExecutionContext::Isolated { wrapper } => {
                let mut argv = split_command(wrapper)?;
                argv.push("--".to_string());
                argv
            }
        };
        argv.extend(base.iter().map(|s| s.to_string()));
        Ok(argv)
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Direct => write!(f, "direct"),
            ExecutionContext::Isolated { wrapper } => write!(f, "isolated ({})", wrapper),
        }
    }
}

/// Everything needed to build one architecture
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub version: UpstreamVersion,
    pub full_version: String,
    pub arch: String,
    pub execution_context: ExecutionContext,
    pub refs: AutoRefs,
    pub timeout: Duration,
}

/// Capability to build one architecture
pub trait Builder {
    /// Run the build; any problem yields a failure attempt, never an error
    fn build(&self, request: &BuildRequest) -> BuildAttempt;
}

/// Builder running debuild in the packaging working tree
///
/// debuild writes its output next to the tree, so artifacts are collected
/// from the parent directory.
pub struct DebuildBuilder {
    repo: GitRepo,
    output_dir: PathBuf,
    log_dir: PathBuf,
    cancel: CancelFlag,
}

impl DebuildBuilder {
    pub fn new(work_dir: &Path, log_dir: &Path, cancel: CancelFlag) -> Self {
        let output_dir = work_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(".."))
            .to_path_buf();
        Self {
            repo: GitRepo::new(work_dir),
            output_dir,
            log_dir: log_dir.to_path_buf(),
            cancel,
        }
    }

    fn clean(&self) -> Result<()> {
        actions::run(Step::Clean, self.repo.work_dir(), &BTreeMap::new())
    }

    fn log_path(&self, request: &BuildRequest) -> PathBuf {
        self.log_dir
            .join(format!("build_{}_{}.log", request.full_version, request.arch))
    }

    fn run_build(&self, request: &BuildRequest) -> std::result::Result<Vec<PathBuf>, String> {
        self.repo
            .checkout_reset(&request.refs.branch, &request.refs.commit)
            .map_err(|e| format!("checkout failed: {}", e))?;
        self.clean().map_err(|e| format!("clean failed: {}", e))?;

        let argv = request
            .execution_context
            .command_line(BUILD_COMMAND)
            .map_err(|e| e.to_string())?;
        let log_path = self.log_path(request);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(self.repo.work_dir());

        info!(
            "Building {} for {} ({}), timeout {:?}",
            request.full_version, request.arch, request.execution_context, request.timeout
        );
        let outcome = run_with_timeout(&mut command, request.timeout, &self.cancel, &log_path)
            .map_err(|e| e.to_string())?;

        match outcome {
            RunOutcome::Exited(status) if status.success() => {}
            RunOutcome::Exited(status) => {
                let output = tail_file(&log_path, FAILURE_CONTEXT_LINES).join("\n");
                log_failure(&argv.join(" "), &output);
                return Err(match status.code() {
                    Some(code) => format!("debuild exited with code {}", code),
                    None => "debuild was killed by a signal".to_string(),
                });
            }
            RunOutcome::TimedOut => {
                return Err(format!("timed out after {:?}", request.timeout));
            }
            RunOutcome::Cancelled => return Err("cancelled".to_string()),
        }

        self.collect_artifacts().map_err(|e| e.to_string())
    }

    /// Files listed by `dpkg-genchanges -b`: the .deb packages and the
    /// build log matching the .buildinfo
    fn collect_artifacts(&self) -> Result<Vec<PathBuf>> {
        let changes = run_checked(self.repo.work_dir(), &["dpkg-genchanges", "-b"])?;
        let stanzas = parse_stanzas(&changes)?;
        let stanza = stanzas
            .first()
            .ok_or_else(|| Error::ParseError("dpkg-genchanges printed nothing".to_string()))?;

        let mut artifacts = Vec::new();
        for name in changes_files(stanza)? {
            let name = if let Some(stem) = name.strip_suffix(".buildinfo") {
                format!("{}.build", stem)
            } else if name.ends_with(".deb") {
                name
            } else {
                continue;
            };

            let path = self.output_dir.join(&name);
            if path.exists() {
                artifacts.push(path);
            } else if name.ends_with(".deb") {
                return Err(Error::NotFound(format!(
                    "Package {} listed by dpkg-genchanges is missing",
                    path.display()
                )));
            } else {
                warn!("Build log {} is missing", path.display());
            }
        }

        if !artifacts.iter().any(|p| p.extension().is_some_and(|e| e == "deb")) {
            return Err(Error::NotFound("Build produced no .deb package".to_string()));
        }
        debug!("Collected {} artifacts", artifacts.len());
        Ok(artifacts)
    }
}

impl Builder for DebuildBuilder {
    fn build(&self, request: &BuildRequest) -> BuildAttempt {
        let context = request.execution_context.clone();
        match self.run_build(request) {
            Ok(artifacts) => {
                info!("Build of {} for {} succeeded", request.full_version, request.arch);
                BuildAttempt::success(&request.arch, context, &request.refs.commit, artifacts)
            }
            Err(detail) => {
                error!(
                    "Build of {} for {} failed: {}",
                    request.full_version, request.arch, detail
                );
                BuildAttempt::failure(&request.arch, context, &request.refs.commit, detail)
            }
        }
    }
}
