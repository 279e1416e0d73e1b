// src/commands/pipeline.rs
//! Detection, reference refresh, pipeline runs and index refresh

use super::Context;
use anyhow::{Context as _, Result, anyhow};
use autodeb::StateStore;
use autodeb::build::DebuildBuilder;
use autodeb::http::HttpClient;
use autodeb::lock::ExclusiveLock;
use autodeb::notify::{Mark, Message, RefreshReport};
use autodeb::pipeline::{
    PIPELINE_OPERATION, PipelineOrchestrator, PipelineSettings, refresh_detection,
};
use autodeb::prepare::GitPreparer;
use autodeb::publish::{ReferenceDebs, StagingPublisher, refresh_index};
use autodeb::reference::{check_consistency, refresh_reference};
use tracing::{info, warn};

const DETECT_OPERATION: &str = "Version detection";
const REFERENCE_OPERATION: &str = "Reference refresh";
const INDEX_OPERATION: &str = "Index refresh";

/// Fetch, compare tags and report what changed
pub fn cmd_detect(ctx: &Context, fetch: bool) -> Result<bool> {
    ctx.reported(DETECT_OPERATION, detect(ctx, fetch))
}

fn detect(ctx: &Context, fetch: bool) -> Result<bool> {
    let _lock = ctx.lock_worktree()?;
    let mut store = ctx.open_state()?;

    let mut report = refresh_detection(&ctx.config.git, &mut store, fetch)
        .context("Failed to detect versions")?;
    let consistent = push_consistency(ctx, &store, &mut report, None);

    if let Some(detection) = store.detection() {
        info!(
            "Packaged {}, latest upstream {}, pending: {}",
            detection.packaged_upstream,
            detection.latest_upstream,
            if detection.pending.is_empty() {
                "none".to_string()
            } else {
                detection.pending.join(", ")
            }
        );
    }
    ctx.dispatcher.dispatch(&Message::Refresh(report));
    Ok(!consistent)
}

/// Download reference packages and report the cross-check
pub fn cmd_refresh_reference(ctx: &Context) -> Result<bool> {
    ctx.reported(REFERENCE_OPERATION, refresh_reference_debs(ctx))
}

fn refresh_reference_debs(ctx: &Context) -> Result<bool> {
    let config = ctx
        .config
        .reference
        .as_ref()
        .ok_or_else(|| anyhow!("No [reference] section in the configuration"))?;

    let _lock = ctx.lock_worktree()?;
    let mut store = ctx.open_state()?;
    let previous = store.reference().map(|r| r.version.clone());

    let client = HttpClient::new()?;
    let record = refresh_reference(config, &ctx.config.architectures(), &client)
        .context("Failed to refresh reference packages")?;
    store.set_reference(record)?;

    let mut report = RefreshReport::default();
    let consistent = push_consistency(ctx, &store, &mut report, previous.as_deref());
    ctx.dispatcher.dispatch(&Message::Refresh(report));
    Ok(!consistent)
}

/// Add the reference version and the consistency verdict to a refresh report
///
/// Returns whether git and the reference repository agree. Without a
/// `[reference]` section there is nothing to compare and the answer is yes.
fn push_consistency(
    ctx: &Context,
    store: &StateStore,
    report: &mut RefreshReport,
    previous_reference: Option<&str>,
) -> bool {
    if ctx.config.reference.is_none() {
        return true;
    }

    if let Some(reference) = store.reference() {
        let old = previous_reference.unwrap_or(reference.version.as_str());
        report.push_metadata("PPA package version", Some(old), &reference.version);
    }

    let result = check_consistency(store.detection(), store.reference());
    let mark = match &result {
        Ok(()) => Mark::Success.to_string(),
        Err(e) => {
            warn!("{}", e);
            Mark::Failure.to_string()
        }
    };
    // An inconsistency is reported on every refresh until it is fixed
    let old = result.is_ok().then_some(mark.as_str());
    report.push_metadata("Overall consistency", old, &mark);
    result.is_ok()
}

/// Lock, state and settings of a pipeline run
struct RunSetup {
    _lock: ExclusiveLock,
    store: StateStore,
    settings: PipelineSettings,
    reference: Option<ReferenceDebs>,
}

/// Everything that must hold before the orchestrator takes over
fn setup_run(ctx: &Context) -> Result<RunSetup> {
    let lock = ctx.lock_worktree()?;
    let store = ctx.open_state()?;
    let mut settings = PipelineSettings::from_config(&ctx.config)?;

    let reference = match &ctx.config.reference {
        Some(config) => {
            let record = store
                .reference()
                .cloned()
                .context("No reference version known, run refresh-reference")?;
            check_consistency(store.detection(), Some(&record))?;
            settings.reference_version = Some(record.version.clone());
            Some(ReferenceDebs {
                dir: config.work_dir.clone(),
                record,
            })
        }
        None => None,
    };

    Ok(RunSetup {
        _lock: lock,
        store,
        settings,
        reference,
    })
}

/// Run the pipeline for the next pending version, or all of them
///
/// Failures once the orchestrator runs are reported by the orchestrator.
pub fn cmd_run(ctx: &Context, all: bool) -> Result<bool> {
    let RunSetup {
        _lock,
        mut store,
        settings,
        reference,
    } = ctx.reported(PIPELINE_OPERATION, setup_run(ctx))?;

    let preparer = GitPreparer::new(&ctx.config.git);
    let builder = DebuildBuilder::new(
        &ctx.config.git.work_dir,
        &ctx.config.state.log_dir(),
        ctx.cancel.clone(),
    );
    let publisher = StagingPublisher::new(&ctx.config.ppa, reference);

    let mut orchestrator = PipelineOrchestrator::new(
        &mut store,
        &preparer,
        &builder,
        &publisher,
        &ctx.dispatcher,
        settings,
        ctx.cancel.clone(),
    );
    let outcome = if all {
        orchestrator.run_all()?
    } else {
        orchestrator.run_next()?
    };

    if outcome.needs_attention() {
        warn!("Pipeline: {}", outcome);
    } else {
        info!("Pipeline: {}", outcome);
    }
    Ok(outcome.needs_attention())
}

/// Regenerate and sign the staging index, then publish it
pub fn cmd_refresh_index(ctx: &Context) -> Result<bool> {
    ctx.reported(INDEX_OPERATION, refresh_staging_index(ctx))
}

fn refresh_staging_index(ctx: &Context) -> Result<bool> {
    let _lock = ctx.lock_worktree()?;
    refresh_index(&ctx.config.ppa).context("Failed to refresh the staging index")?;
    info!("Refreshed index of {}", ctx.config.ppa.suite_dir().display());
    Ok(false)
}
