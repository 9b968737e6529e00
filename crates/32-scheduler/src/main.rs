//! The scheduler process (spec.md §4.2, §6).
//!
//! Launched by the shell as `scheduler <NCPU> <TSLICE_US> <SHMID>`.
//! Attaches the shared job table read-write, drives a periodic real
//! interval timer, and on every tick runs the schedule step (reap →
//! preempt → intake → dispatch → termination-check) from
//! `scheduler-core`, quantizing submitted jobs with the `resume`
//! (SIGUSR1) / `pause` (SIGUSR2) protocol signals.

use clap::{Parser, ValueEnum};
use job_table::AttachedSegment;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use scheduler_core::{Policy, ProcessControl, Scheduler, SignalOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "scheduler", about = "Priority round-robin scheduler for submitted jobs")]
struct Args {
    /// Number of logical CPUs (parallel running slots).
    ncpu: usize,
    /// Quantum length in microseconds.
    tslice_us: u64,
    /// System V shared-memory identifier created by the shell.
    shmid: i32,
    /// Scheduling policy: baseline FIFO, or the strict-priority
    /// conformance variant (spec.md §4.2/§9).
    #[arg(long, value_enum, default_value_t = PolicyArg::Fifo)]
    policy: PolicyArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Fifo,
    StrictPriority,
}

impl From<PolicyArg> for Policy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Fifo => Policy::Fifo,
            PolicyArg::StrictPriority => Policy::StrictPriority,
        }
    }
}

#[derive(Debug, Error)]
enum SetupError {
    #[error("invalid arguments: NCPU and TSLICE_US must be positive")]
    InvalidArgs,
    #[error(transparent)]
    Shm(#[from] job_table::ShmError),
    #[error("setitimer failed: {0}")]
    Timer(std::io::Error),
    #[error("sigaction failed: {0}")]
    Signal(#[from] nix::Error),
}

static TIMER_EXPIRED: AtomicBool = AtomicBool::new(false);
static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_: nix::libc::c_int) {
    TIMER_EXPIRED.store(true, Ordering::SeqCst);
}

extern "C" fn on_term(_: nix::libc::c_int) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Real process control backed by `kill`/`waitpid` — see
/// `scheduler_core::ProcessControl` for the contract this fulfils.
struct RealProcessControl;

impl RealProcessControl {
    fn send(&self, pid: i32, sig: Signal) -> SignalOutcome {
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) => SignalOutcome::Delivered,
            Err(_) => SignalOutcome::NoSuchProcess,
        }
    }
}

impl ProcessControl for RealProcessControl {
    fn resume(&mut self, pid: i32) -> SignalOutcome {
        self.send(pid, job_shim_signals::RESUME)
    }

    fn pause(&mut self, pid: i32) -> SignalOutcome {
        self.send(pid, job_shim_signals::PAUSE)
    }

    fn reap_all(&mut self) -> Vec<i32> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    reaped.push(pid.as_raw());
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(_) => break,
            }
        }
        reaped
    }
}

/// The protocol signal mapping, documented here rather than imported
/// from `job-shim` so the scheduler binary has no compile-time
/// dependency on the shim a submitted program happens to use.
mod job_shim_signals {
    use nix::sys::signal::Signal;
    pub const RESUME: Signal = Signal::SIGUSR1;
    pub const PAUSE: Signal = Signal::SIGUSR2;
}

fn install_signal_handlers() -> Result<(), SetupError> {
    let alarm_action = SigAction::new(SigHandler::Handler(on_alarm), SaFlags::empty(), SigSet::empty());
    let term_action = SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGALRM, &alarm_action)?;
        signal::sigaction(Signal::SIGTERM, &term_action)?;
    }
    Ok(())
}

fn start_timer(tslice_us: u64) -> Result<(), SetupError> {
    let value = libc::timeval {
        tv_sec: (tslice_us / 1_000_000) as libc::time_t,
        tv_usec: (tslice_us % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval { it_interval: value, it_value: value };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(SetupError::Timer(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn run(args: Args) -> Result<(), SetupError> {
    if args.ncpu == 0 || args.tslice_us == 0 {
        return Err(SetupError::InvalidArgs);
    }

    let mut segment = AttachedSegment::attach(args.shmid)?;
    install_signal_handlers()?;

    // Flip the shared-memory readiness flag once the segment is
    // attached and the signal handlers are in place — the last piece
    // of §3/§6's `SharedMemory` layout, published here since the
    // scheduler is the sole writer of `scheduler_ready`.
    job_table::SchedulerJobTable::new(segment.as_mut()).set_ready(true);

    let mut sched = Scheduler::new(args.ncpu, args.policy.into());
    let mut pc = RealProcessControl;
    start_timer(args.tslice_us)?;

    while !SHOULD_EXIT.load(Ordering::SeqCst) {
        if TIMER_EXPIRED.swap(false, Ordering::SeqCst) {
            let mut table = job_table::SchedulerJobTable::new(segment.as_mut());
            let outcome = sched.step(&mut table, &mut pc, now());
            if outcome.should_exit {
                break;
            }
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    // Leave any still-running job paused before detaching, whether we
    // got here via the normal termination check or via SIGTERM.
    for pid in sched.running_pids() {
        pc.pause(pid);
    }

    let mut table = job_table::SchedulerJobTable::new(segment.as_mut());
    table.set_ready(false);
    print_statistics(&sched, table.records(), args.tslice_us);

    Ok(())
}

fn print_statistics(sched: &Scheduler, records: &[job_table::JobRecord], tslice_us: u64) {
    let rows = scheduler_core::statistics_table(sched, records, tslice_us);
    if rows.is_empty() {
        return;
    }
    println!("scheduler: job statistics");
    println!("{:<24} {:>8} {:>9} {:>16} {:>16}", "name", "pid", "priority", "completion_us", "wait_us");
    for row in &rows {
        println!(
            "{:<24} {:>8} {:>9} {:>16.0} {:>16.0}",
            row.name, row.pid, row.priority, row.completion_time, row.wait_time
        );
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("scheduler: {e}");
        std::process::exit(1);
    }
}
