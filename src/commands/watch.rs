// src/commands/watch.rs
//! Periodic pipeline and monitoring passes

use super::{Context, cmd_detect, cmd_monitor, cmd_refresh_reference, cmd_run};
use anyhow::Result;
use autodeb::config::parse_interval;
use autodeb::schedule::{Schedule, run_every};
use std::thread;
use tracing::{error, info, warn};

/// One pipeline pass: detect, refresh the reference when configured, then
/// run every pending version
fn pipeline_pass(ctx: &Context) -> Result<bool> {
    let mut attention = cmd_detect(ctx, true)?;
    if ctx.config.reference.is_some() {
        attention |= cmd_refresh_reference(ctx)?;
    }
    if attention {
        warn!("Skipping the pipeline run until the refresh is clean");
        return Ok(true);
    }
    cmd_run(ctx, true)
}

/// Run the pipeline and the monitor on independent threads until
/// SIGINT/SIGTERM
pub fn cmd_watch(ctx: &Context, pipeline_every: &str, monitor_every: &str) -> Result<bool> {
    let pipeline = Schedule::new("pipeline", parse_interval(pipeline_every)?);
    let monitor = Schedule::new("monitor", parse_interval(monitor_every)?);

    thread::scope(|s| {
        s.spawn(|| {
            run_every(pipeline, &ctx.cancel, || match pipeline_pass(ctx) {
                Ok(true) => warn!("Pipeline pass needs attention"),
                Ok(false) => {}
                Err(e) => error!("Pipeline pass failed: {:#}", e),
            })
        });
        s.spawn(|| {
            run_every(monitor, &ctx.cancel, || match cmd_monitor(ctx) {
                Ok(true) => warn!("Monitoring pass was incomplete"),
                Ok(false) => {}
                Err(e) => error!("Monitoring pass failed: {:#}", e),
            })
        });
    });

    info!("Stopped watching");
    Ok(false)
}
