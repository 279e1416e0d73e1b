// src/cli/mod.rs
//! CLI definitions for autodeb
//!
//! The command implementations live in the `commands` module.
//!
//! Pipeline:
//! - `detect` - Compare upstream and packaging tags
//! - `refresh-reference` - Download the reviewed reference packages
//! - `run` - Drive the next pending version through build and staging
//! - `refresh-index` - Regenerate and sign the staging repository index
//!
//! Monitoring:
//! - `monitor` - Check external repositories for drift once
//! - `watch` - Run pipeline and monitor periodically
//!
//! Administration:
//! - `rewind`, `retry`, `status`

use autodeb::config::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autodeb")]
#[command(author = "autodeb Contributors")]
#[command(version)]
#[command(about = "Automated Debian packaging with gated multi-architecture builds", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Print notifications instead of sending them
    #[arg(long, global = true)]
    pub no_notify: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // =========================================================================
    // Pipeline
    // =========================================================================
    /// Detect new upstream versions and report metadata changes
    Detect {
        /// Use the tags already present in the working tree
        #[arg(long)]
        no_fetch: bool,
    },

    /// Download reference packages and check version consistency
    RefreshReference,

    /// Run the pipeline for the next pending version
    Run {
        /// Continue with the following versions while publication succeeds
        #[arg(long)]
        all: bool,
    },

    /// Regenerate, sign and publish the staging repository index
    RefreshIndex,

    // =========================================================================
    // Monitoring
    // =========================================================================
    /// Check monitored repositories for package drift
    Monitor,

    /// Run pipeline and monitor on their own schedules until interrupted
    Watch {
        /// Interval between pipeline passes (detect, refresh, run --all)
        #[arg(long, default_value = "1h")]
        pipeline_every: String,

        /// Interval between monitoring passes
        #[arg(long, default_value = "6h")]
        monitor_every: String,
    },

    // =========================================================================
    // Administration
    // =========================================================================
    /// Reset the build of an architecture and every later one
    Rewind {
        /// Upstream version, e.g. 16.4.8
        version: String,

        /// First architecture to build again
        arch: String,

        /// Recorded in the state document and audit journal
        #[arg(long)]
        reason: Option<String>,
    },

    /// Let a failed version run again
    Retry {
        /// Upstream version, e.g. 16.4.8
        version: String,

        /// Recorded in the audit journal
        #[arg(long)]
        reason: Option<String>,
    },

    /// Show the state of every known version
    Status {
        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },
}
