// src/cancel.rs

//! Operator-initiated cancellation
//!
//! SIGINT and SIGTERM set a process-wide flag. Long-running work (builds)
//! polls a [`CancelFlag`] and stops at the next check; the build is then
//! recorded as a failure so it can always be redone.

use crate::error::{Error, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: nix::libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that trip every [`CancelFlag`]
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores into an atomic
        unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
            Error::IoError(format!("Failed to install {} handler: {}", sig, e))
        })?;
    }
    debug!("Installed cancellation signal handlers");
    Ok(())
}

/// Shared cancellation token
///
/// Cancelled when either [`CancelFlag::cancel`] was called on any clone or
/// the process received SIGINT/SIGTERM.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
