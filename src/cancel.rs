//! Process-wide SIGINT observation (spec §5: "Cancellation (operator SIGINT)
//! is observed only between commands, never inside an elevated region").
//!
//! A single `AtomicBool` flipped from a signal handler is the whole
//! mechanism: the executor polls it between timeout-wait slices, and the
//! group executor polls it between commands.

use std::sync::atomic::{AtomicBool, Ordering};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Idempotent; call once from each binary's
/// `main`.
pub fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

#[must_use]
pub fn is_cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// Test-only: clear the flag between cases sharing the process-wide static.
#[cfg(test)]
pub fn reset_for_test() {
    CANCELLED.store(false, Ordering::SeqCst);
}
