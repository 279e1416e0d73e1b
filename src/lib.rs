// src/lib.rs

//! autodeb: automated Debian packaging of a tracked upstream project
//!
//! New upstream releases are detected from git tags, merged into an
//! automated packaging branch, built for each configured architecture in
//! order (a later architecture is only built after every earlier one
//! succeeded) and staged into a package repository for review.
//! Independently, a drift monitor watches packages of external repositories
//! and reports version and dependency changes.
//!
//! # Architecture
//!
//! - State: one JSON document owned by [`state::StateStore`], changed only
//!   through audited transitions
//! - Capabilities: [`prepare::Preparer`], [`build::Builder`] and
//!   [`publish::Publisher`] wrap the external tooling so the orchestrator
//!   can run against substitutes
//! - Locking: one exclusive lock for the packaging working tree, another
//!   for the monitoring snapshots

pub mod build;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod deb822;
mod error;
pub mod git;
pub mod http;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod prepare;
pub mod process;
pub mod publish;
pub mod reference;
pub mod schedule;
pub mod state;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{DiffReport, DriftMonitor, MonitoringTarget};
pub use notify::{Dispatcher, Message};
pub use pipeline::{PipelineOrchestrator, PipelineOutcome, PipelineSettings};
pub use state::{PackagingState, StateStore, Status};
pub use version::UpstreamVersion;
