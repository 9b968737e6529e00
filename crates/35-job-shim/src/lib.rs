//! The submittable-program shim (spec.md §4.3/§6).
//!
//! Any program intended to be `submit`ted by the shell links this crate
//! and calls [`run_gated`] instead of writing its own `fn main`. Before
//! the program's real entry point runs, the shim:
//!
//! 1. blocks the two protocol signals so no signal can race the handler
//!    install below,
//! 2. installs handlers that flip an atomic `can_run` flag,
//! 3. unblocks the signals,
//! 4. busy-waits (yielding the timeslice between polls) until the
//!    scheduler's first `resume`,
//! 5. calls the real entry point.
//!
//! Protocol mapping (documented per spec.md §6): `resume` is `SIGUSR1`,
//! `pause` is `SIGUSR2`.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static CAN_RUN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_resume(_: nix::libc::c_int) {
    CAN_RUN.store(true, Ordering::SeqCst);
}

extern "C" fn on_pause(_: nix::libc::c_int) {
    CAN_RUN.store(false, Ordering::SeqCst);
}

/// Install the resume/pause handlers and block until the first resume.
/// Idempotent to call more than once, though a submittable program only
/// ever needs to call it — or [`run_gated`] — once, at startup.
pub fn gate() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGUSR2);
    mask.thread_block().expect("block resume/pause signals");

    let resume_action = SigAction::new(SigHandler::Handler(on_resume), SaFlags::empty(), SigSet::empty());
    let pause_action = SigAction::new(SigHandler::Handler(on_pause), SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGUSR1, &resume_action).expect("install resume handler");
        signal::sigaction(Signal::SIGUSR2, &pause_action).expect("install pause handler");
    }

    mask.thread_unblock().expect("unblock resume/pause signals");

    while !CAN_RUN.load(Ordering::SeqCst) {
        std::thread::yield_now();
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// Run `real_main` gated behind the scheduler's first `resume`. A
/// submittable program's entire `fn main` should be:
///
/// ```no_run
/// fn real_main() -> i32 {
///     // user code
///     0
/// }
///
/// fn main() {
///     std::process::exit(job_shim::run_gated(real_main));
/// }
/// ```
pub fn run_gated(real_main: impl FnOnce() -> i32) -> i32 {
    gate();
    real_main()
}

/// Exposed so the scheduler/shell crates can document and test against
/// the exact signal mapping without hardcoding raw integers elsewhere.
pub const RESUME_SIGNAL: Signal = Signal::SIGUSR1;
pub const PAUSE_SIGNAL: Signal = Signal::SIGUSR2;
