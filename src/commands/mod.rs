// src/commands/mod.rs
//! Command handlers for the autodeb CLI
//!
//! Every handler returns whether the outcome needs operator attention, which
//! `main` turns into the exit code.

mod monitor;
mod pipeline;
mod state;
mod watch;

pub use monitor::cmd_monitor;
pub use pipeline::{cmd_detect, cmd_refresh_index, cmd_refresh_reference, cmd_run};
pub use state::{cmd_retry, cmd_rewind, cmd_status};
pub use watch::cmd_watch;

use anyhow::{Context as _, Result};
use autodeb::cancel::CancelFlag;
use autodeb::lock::ExclusiveLock;
use autodeb::{Config, Dispatcher, Error, StateStore};
use std::path::Path;
use tracing::warn;

/// Everything a command needs, shared between `watch` threads
pub struct Context {
    pub config: Config,
    pub dispatcher: Dispatcher,
    pub cancel: CancelFlag,
}

impl Context {
    pub fn load(config_path: &Path, no_notify: bool) -> Result<Self> {
        let config = Config::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let dispatcher = Dispatcher::from_config(config.discord.as_ref(), no_notify)?;
        Ok(Self {
            config,
            dispatcher,
            cancel: CancelFlag::new(),
        })
    }

    /// Exclusive access to the packaging working tree and state document
    pub fn lock_worktree(&self) -> Result<ExclusiveLock> {
        Ok(ExclusiveLock::try_acquire(self.config.state.lock_path())?)
    }

    pub fn open_state(&self) -> Result<StateStore> {
        StateStore::open(&self.config.state, self.config.architectures())
            .context("Failed to open the state document")
    }

    /// Send a failure message when `result` is an error, then return it
    ///
    /// A held lock is only returned: the run holding it reports on its own.
    pub fn reported<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(e.downcast_ref::<Error>(), Some(Error::LockHeld(_))) {
                warn!("{} skipped: {}", operation, e);
            } else {
                self.dispatcher.report_failure(operation, format!("{:#}", e));
            }
        }
        result
    }
}
