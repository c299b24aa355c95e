//! Termination-signal handling for daemon run loops.
//!
//! SIGTERM and SIGINT set a flag that the run loop checks once per tick;
//! the loop then cleans up its instance directory and exits with code 0.
//! The flag is the only process-wide state: a signal handler has nowhere
//! else to put it.

use std::sync::atomic::{AtomicBool, Ordering};


static TERMINATE: AtomicBool = AtomicBool::new(false);


extern "C" fn on_terminate(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}


/// Install handlers for SIGTERM and SIGINT. Other signals keep their
/// default disposition.
pub fn install() {
    let handler = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}


/// True once a termination signal has been received.
pub fn termination_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_flag_starts_clear() {
        install();
        install();
        assert!(!termination_requested());
    }
}
