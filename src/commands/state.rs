// src/commands/state.rs
//! Administrative state commands: rewind, retry and status

use super::Context;
use anyhow::Result;
use autodeb::state::{Outcome, PackagingState, StateDocument, StateStore, Status};
use autodeb::UpstreamVersion;
use tracing::info;

/// Reset the build of `arch` and every later architecture
pub fn cmd_rewind(ctx: &Context, version: &str, arch: &str, reason: Option<&str>) -> Result<bool> {
    let version = UpstreamVersion::parse(version)?;
    let _lock = ctx.lock_worktree()?;
    let mut store = ctx.open_state()?;

    store.rewind(&version, arch, reason)?;
    info!("Rewound {} at {}", version, arch);
    if let Some(state) = store.read(&version) {
        println!("{}: {}", version, describe(state, &ctx.config.architectures()));
    }
    Ok(false)
}

/// Clear the failure of a failed version
pub fn cmd_retry(ctx: &Context, version: &str, reason: Option<&str>) -> Result<bool> {
    let version = UpstreamVersion::parse(version)?;
    let _lock = ctx.lock_worktree()?;
    let mut store = ctx.open_state()?;

    store.retry(&version, reason)?;
    info!("Cleared failure of {}", version);
    if let Some(state) = store.read(&version) {
        println!("{}: {}", version, describe(state, &ctx.config.architectures()));
    }
    Ok(false)
}

/// Print every version; a failed version needs attention
pub fn cmd_status(ctx: &Context, json: bool) -> Result<bool> {
    let doc = StateStore::load(&ctx.config.state.path)?;
    let needs_attention = doc.versions.values().any(|s| s.status == Status::Failed);

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print_status(&doc, &ctx.config.architectures());
    }
    Ok(needs_attention)
}

fn print_status(doc: &StateDocument, architectures: &[String]) {
    match &doc.detection {
        Some(detection) => {
            println!("Latest upstream: {}", detection.latest_upstream);
            println!(
                "Packaged:        {} ({})",
                detection.packaged_upstream,
                detection.packaged_debian.as_deref().unwrap_or("unknown")
            );
            println!(
                "Pending:         {}",
                if detection.pending.is_empty() {
                    "none".to_string()
                } else {
                    detection.pending.join(", ")
                }
            );
        }
        None => println!("No detection yet, run 'autodeb detect'"),
    }
    if let Some(reference) = &doc.reference {
        println!("Reference:       {}", reference.version);
    }

    if doc.versions.is_empty() {
        println!("\nNo version processed yet.");
        return;
    }

    let mut versions: Vec<(UpstreamVersion, &PackagingState)> = doc
        .versions
        .iter()
        .filter_map(|(v, s)| UpstreamVersion::parse(v).ok().map(|v| (v, s)))
        .collect();
    versions.sort_by(|a, b| a.0.cmp(&b.0));

    println!();
    println!("{:12}  {:24}  BUILDS", "VERSION", "STATUS");
    println!("{}", "-".repeat(70));
    for (version, state) in &versions {
        let builds: Vec<String> = state
            .attempts
            .iter()
            .map(|a| format!("{}:{}", a.arch, a.outcome))
            .collect();
        println!(
            "{:12}  {:24}  {}",
            version.as_str(),
            describe(state, architectures),
            builds.join(" ")
        );
        if let Some(failure) = &state.failure {
            println!(
                "{:12}  {} at {}: {}",
                "",
                failure.stage,
                failure.at.format("%Y-%m-%d %H:%M"),
                failure.detail
            );
        }
    }
    println!();
    println!("Total: {} version(s)", versions.len());
}

/// Status with the architecture being built, e.g. `building(arm64)`
fn describe(state: &PackagingState, architectures: &[String]) -> String {
    match state.status {
        Status::Building => match architectures.get(state.next_build_index()) {
            Some(arch) => format!("building({})", arch),
            None => "building".to_string(),
        },
        Status::Failed => match state.attempts.iter().find(|a| a.outcome == Outcome::Failure) {
            Some(attempt) => format!("failed({})", attempt.arch),
            None => "failed".to_string(),
        },
        status => status.to_string(),
    }
}
