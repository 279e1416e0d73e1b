// src/commands/monitor.rs
//! Drift monitoring pass

use super::Context;
use anyhow::{Context as _, Result};
use autodeb::http::HttpClient;
use autodeb::monitor::{
    DriftMonitor, MONITOR_OPERATION, MonitorRun, MonitoringTarget, SnapshotStore,
};
use tracing::{info, warn};

/// Check every monitored package once and report drift
///
/// Drift itself is not a failure; unreachable indices are.
pub fn cmd_monitor(ctx: &Context) -> Result<bool> {
    let targets = MonitoringTarget::from_config(&ctx.config.monitoring);
    if targets.is_empty() {
        info!("No monitored repositories configured");
        return Ok(false);
    }

    let run = ctx.reported(MONITOR_OPERATION, monitor_pass(ctx, &targets))?;
    for url in &run.failed_indices {
        warn!("Index unavailable: {}", url);
    }
    run.dispatch(&ctx.dispatcher);
    Ok(!run.is_complete())
}

fn monitor_pass(ctx: &Context, targets: &[MonitoringTarget]) -> Result<MonitorRun> {
    let snapshots = SnapshotStore::open(&ctx.config.monitoring.work_dir)
        .context("Failed to open the snapshot store")?;
    let client = HttpClient::new()?;
    let mut monitor = DriftMonitor::new(&client, snapshots);
    Ok(monitor.run(targets)?)
}
