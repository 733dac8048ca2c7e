//! Operator interrupts. A signal sets a process-wide flag and cancels the
//! statement currently in flight; the next database call fails fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{ReorgError, Result};
use crate::session::Canceller;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static IN_CLEANUP: AtomicBool = AtomicBool::new(false);
static IN_FLIGHT: Mutex<Option<Arc<dyn Canceller>>> = Mutex::new(None);

/// Install the Ctrl-C / SIGTERM handler.
pub fn install_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(on_interrupt)?;
    Ok(())
}

/// What the signal handler does: raise the flag, cancel the running statement.
pub fn on_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
    let in_flight = IN_FLIGHT.lock().ok().and_then(|slot| slot.clone());
    if let Some(canceller) = in_flight {
        match canceller.cancel() {
            Ok(()) => warn!("cancel request sent"),
            Err(e) => warn!("could not send cancel request: {e}"),
        }
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail fast once interrupted, unless the cleanup sweep is running.
pub fn check() -> Result<()> {
    if is_interrupted() && !IN_CLEANUP.load(Ordering::SeqCst) {
        return Err(ReorgError::Interrupted);
    }
    Ok(())
}

/// Clear the flag. Only tests and a fresh run should need this.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Registers the canceller of the statement about to run; unregisters on drop.
pub(crate) struct InFlight;

impl InFlight {
    pub(crate) fn enter(canceller: Arc<dyn Canceller>) -> Self {
        if let Ok(mut slot) = IN_FLIGHT.lock() {
            *slot = Some(canceller);
        }
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut slot) = IN_FLIGHT.lock() {
            *slot = None;
        }
    }
}

/// While alive, database calls are allowed even after an interrupt.
pub(crate) struct CleanupScope {
    was_set: bool,
}

impl CleanupScope {
    pub(crate) fn enter() -> Self {
        let was_set = IN_CLEANUP.swap(true, Ordering::SeqCst);
        CleanupScope { was_set }
    }
}

impl Drop for CleanupScope {
    fn drop(&mut self) {
        IN_CLEANUP.store(self.was_set, Ordering::SeqCst);
    }
}
