// src/pipeline/mod.rs

//! Packaging pipeline orchestration
//!
//! One run drives at most one upstream version forward:
//!
//! 1. A version already in flight (preparing, building or built) is resumed.
//! 2. Otherwise a version that failed blocks the pipeline until an operator
//!    retries or rewinds it.
//! 3. Otherwise the oldest pending version without a terminal state starts.
//!
//! Every step goes through the [`StateStore`]; nothing is inferred from git
//! refs or files on disk. Builds run in the configured architecture order
//! and stop at the first failure.

mod detect;

pub use detect::{detection_report, refresh_detection};

use crate::build::{BuildRequest, Builder, ExecutionContext};
use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{Dispatcher, Mark, Message, PipelineReport, ReportLine};
use crate::prepare::Preparer;
use crate::publish::Publisher;
use crate::state::{Event, Outcome, PackagingState, PreparationFailure, StateStore, Status};
use crate::version::UpstreamVersion;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Name of the pipeline in failure reports
pub const PIPELINE_OPERATION: &str = "Packaging pipeline";

/// One entry of the gated build sequence
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub arch: String,
    pub execution_context: ExecutionContext,
    pub timeout: Duration,
}

/// Static inputs of the orchestrator
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub builds: Vec<BuildPlan>,
    pub version_suffix: String,

    /// Published pool URL used for links in reports
    pub files_url: String,

    /// Version of the reference packages, for debdiff links
    pub reference_version: Option<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let builds = config
            .builds
            .iter()
            .map(|b| {
                Ok(BuildPlan {
                    arch: b.arch.clone(),
                    execution_context: b.execution_context(),
                    timeout: b.timeout()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            builds,
            version_suffix: config.git.version_suffix.clone(),
            files_url: config.ppa.suite_url(),
            reference_version: None,
        })
    }
}

/// What a pipeline run ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Nothing to do
    Idle,
    Published(UpstreamVersion),
    /// Preparation or a build failed during this run
    Failed(UpstreamVersion),
    /// A version failed earlier and waits for an operator
    Blocked(UpstreamVersion),
    /// Built, but staging or pushing failed; retried on the next run
    PublishFailed(UpstreamVersion),
    /// Cancellation was requested before the next build started
    Interrupted(UpstreamVersion),
}

impl PipelineOutcome {
    /// Whether an operator has to look at something
    pub fn needs_attention(&self) -> bool {
        !matches!(self, PipelineOutcome::Idle | PipelineOutcome::Published(_))
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Idle => write!(f, "nothing to do"),
            PipelineOutcome::Published(v) => write!(f, "{} published", v),
            PipelineOutcome::Failed(v) => write!(f, "{} failed", v),
            PipelineOutcome::Blocked(v) => write!(f, "{} is failed and needs an operator", v),
            PipelineOutcome::PublishFailed(v) => write!(f, "{} built but not published", v),
            PipelineOutcome::Interrupted(v) => write!(f, "{} interrupted", v),
        }
    }
}

/// Drives versions through preparation, gated builds and publication
pub struct PipelineOrchestrator<'a> {
    store: &'a mut StateStore,
    preparer: &'a dyn Preparer,
    builder: &'a dyn Builder,
    publisher: &'a dyn Publisher,
    dispatcher: &'a Dispatcher,
    settings: PipelineSettings,
    cancel: CancelFlag,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(
        store: &'a mut StateStore,
        preparer: &'a dyn Preparer,
        builder: &'a dyn Builder,
        publisher: &'a dyn Publisher,
        dispatcher: &'a Dispatcher,
        settings: PipelineSettings,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            store,
            preparer,
            builder,
            publisher,
            dispatcher,
            settings,
            cancel,
        }
    }

    /// Pending versions from the last detection, oldest first
    pub fn pending(&self) -> Result<Vec<UpstreamVersion>> {
        let mut pending = self
            .store
            .detection()
            .map(|d| d.pending.clone())
            .unwrap_or_default()
            .iter()
            .map(|v| UpstreamVersion::parse(v))
            .collect::<Result<Vec<_>>>()?;
        pending.sort();
        Ok(pending)
    }

    /// Pick the version this run works on
    fn select(&self, pending: &[UpstreamVersion]) -> Selection {
        let status = |v: &UpstreamVersion| self.store.read(v).map(|s| s.status);

        if let Some(v) = pending.iter().find(|v| {
            matches!(
                status(v),
                Some(Status::Preparing | Status::Building | Status::Built)
            )
        }) {
            return Selection::Resume(v.clone());
        }
        if let Some(v) = pending.iter().find(|v| status(v) == Some(Status::Failed)) {
            return Selection::Blocked(v.clone());
        }
        match pending
            .iter()
            .find(|v| matches!(status(v), None | Some(Status::Pending)))
        {
            Some(v) => Selection::Start(v.clone()),
            None => Selection::Idle,
        }
    }

    /// Run the pipeline for the next version
    pub fn run_next(&mut self) -> Result<PipelineOutcome> {
        let pending = match self.preparer.check().and_then(|()| self.pending()) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Pipeline cannot start: {}", e);
                self.dispatcher.report_failure(PIPELINE_OPERATION, &e);
                return Err(e);
            }
        };
        match self.select(&pending) {
            Selection::Idle => {
                info!("No pending version to process");
                Ok(PipelineOutcome::Idle)
            }
            Selection::Blocked(version) => {
                let stage = self
                    .store
                    .read(&version)
                    .and_then(|s| s.failure.as_ref())
                    .map(|f| f.stage.to_string())
                    .unwrap_or_default();
                warn!(
                    "{} failed at {}, retry or rewind it to continue",
                    version, stage
                );
                Ok(PipelineOutcome::Blocked(version))
            }
            Selection::Start(version) | Selection::Resume(version) => self.drive(&version),
        }
    }

    /// Run versions until one does not publish
    pub fn run_all(&mut self) -> Result<PipelineOutcome> {
        let mut last = PipelineOutcome::Idle;
        loop {
            match self.run_next()? {
                PipelineOutcome::Idle => return Ok(last),
                outcome @ PipelineOutcome::Published(_) => {
                    if self.cancel.is_cancelled() {
                        return Ok(outcome);
                    }
                    last = outcome;
                }
                outcome => return Ok(outcome),
            }
        }
    }

    fn full_version(&self, version: &UpstreamVersion) -> String {
        format!("{}{}", version, self.settings.version_suffix)
    }

    fn drive(&mut self, version: &UpstreamVersion) -> Result<PipelineOutcome> {
        let mut report = PipelineReport::new(version.as_str(), &self.settings.files_url);
        report.reference_version = self.settings.reference_version.clone();

        let result = self.advance(version, &mut report);
        match &result {
            Ok(PipelineOutcome::Interrupted(_)) => {}
            Ok(outcome) => {
                report.success = matches!(outcome, PipelineOutcome::Published(_));
                self.dispatcher.dispatch(&Message::Pipeline(report));
            }
            Err(e) => {
                error!("Pipeline for {} stopped: {}", version, e);
                report.push(ReportLine::with_detail("pipeline", Mark::Failure, e.to_string()));
                self.dispatcher.dispatch(&Message::Pipeline(report));
            }
        }
        result
    }

    fn advance(
        &mut self,
        version: &UpstreamVersion,
        report: &mut PipelineReport,
    ) -> Result<PipelineOutcome> {
        let mut state = match self.store.read(version) {
            Some(state) => state.clone(),
            None => self.store.transition(version, Event::Detected)?,
        };

        if matches!(state.status, Status::Pending | Status::Preparing) {
            state = self.prepare(version, report)?;
            if state.status == Status::Failed {
                return Ok(PipelineOutcome::Failed(version.clone()));
            }
        } else if let Some(refs) = &state.auto_ref {
            report.push(ReportLine::with_detail("prepare", Mark::Success, refs.tag.clone()));
        }

        if state.status == Status::Building {
            state = match self.build(version, state)? {
                Some(state) => state,
                None => return Ok(PipelineOutcome::Interrupted(version.clone())),
            };
        }
        push_build_lines(&state, report);
        if state.status == Status::Failed {
            return Ok(PipelineOutcome::Failed(version.clone()));
        }

        if state.status == Status::Built {
            return self.publish(version, &state, report);
        }

        Err(Error::InvalidTransition {
            version: version.to_string(),
            detail: format!("cannot continue a {} version", state.status),
        })
    }

    fn prepare(
        &mut self,
        version: &UpstreamVersion,
        report: &mut PipelineReport,
    ) -> Result<PackagingState> {
        self.store.transition(version, Event::PreparationStarted)?;
        match self.preparer.prepare(version) {
            Ok(refs) => {
                report.push(ReportLine::with_detail("prepare", Mark::Success, refs.tag.clone()));
                self.store.transition(version, Event::Prepared(refs))
            }
            Err(e) => {
                let kind = PreparationFailure::from_error(&e);
                error!("Preparation of {} failed: {}", version, e);
                report.push(ReportLine::with_detail("prepare", Mark::Failure, e.to_string()));
                self.store.transition(
                    version,
                    Event::PreparationFailed {
                        kind,
                        detail: e.to_string(),
                    },
                )
            }
        }
    }

    /// Build every remaining architecture in order, stopping at the first
    /// failure; `None` when cancelled between builds
    fn build(
        &mut self,
        version: &UpstreamVersion,
        mut state: PackagingState,
    ) -> Result<Option<PackagingState>> {
        let mut refs = state.auto_ref.clone().ok_or_else(|| Error::InvalidTransition {
            version: version.to_string(),
            detail: "building without an automated ref".to_string(),
        })?;

        let commit = self.preparer.resolve(&refs)?;
        if commit != refs.commit {
            state = self
                .store
                .transition(version, Event::RefMoved { commit: commit.clone() })?;
            refs.commit = commit;
        }

        while state.status == Status::Building {
            let Some(plan) = self.settings.builds.get(state.next_build_index()) else {
                break;
            };
            if self.cancel.is_cancelled() {
                warn!("Cancelled before building {} for {}", version, plan.arch);
                return Ok(None);
            }

            let request = BuildRequest {
                version: version.clone(),
                full_version: self.full_version(version),
                arch: plan.arch.clone(),
                execution_context: plan.execution_context.clone(),
                refs: refs.clone(),
                timeout: plan.timeout,
            };
            let attempt = self.builder.build(&request);
            state = self.store.transition(version, Event::BuildRecorded(attempt))?;
        }
        Ok(Some(state))
    }

    fn publish(
        &mut self,
        version: &UpstreamVersion,
        state: &PackagingState,
        report: &mut PipelineReport,
    ) -> Result<PipelineOutcome> {
        let staging = match self.publisher.stage(&state.artifacts()) {
            Ok(staging) => staging,
            Err(e) => {
                error!("Staging {} failed: {}", version, e);
                report.push(ReportLine::with_detail("publish", Mark::Failure, e.to_string()));
                return Ok(PipelineOutcome::PublishFailed(version.clone()));
            }
        };
        report.lines.extend(staging.debdiffs);
        report.lines.extend(staging.files);

        let refs = state.auto_ref.as_ref().ok_or_else(|| Error::InvalidTransition {
            version: version.to_string(),
            detail: "built without an automated ref".to_string(),
        })?;
        if let Err(e) = self.preparer.push(refs) {
            error!("Pushing {} failed: {}", version, e);
            report.push(ReportLine::with_detail("push", Mark::Failure, e.to_string()));
            return Ok(PipelineOutcome::PublishFailed(version.clone()));
        }
        report.push(ReportLine::new("push", Mark::Success));

        self.store.transition(version, Event::Published)?;
        Ok(PipelineOutcome::Published(version.clone()))
    }
}

enum Selection {
    Idle,
    Start(UpstreamVersion),
    Resume(UpstreamVersion),
    Blocked(UpstreamVersion),
}

fn push_build_lines(state: &PackagingState, report: &mut PipelineReport) {
    for attempt in &state.attempts {
        match attempt.outcome {
            Outcome::Success => {
                report.push(ReportLine::with_detail("build", Mark::Success, attempt.arch.clone()))
            }
            Outcome::Failure => report.push(ReportLine::with_detail(
                "build",
                Mark::Failure,
                format!(
                    "{}: {}",
                    attempt.arch,
                    attempt.detail.as_deref().unwrap_or("failed")
                ),
            )),
            Outcome::NotAttempted => {}
        }
    }
}
