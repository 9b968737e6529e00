//! A minimal submittable program: spins for a fixed duration, printing
//! one line per second, then exits. Meant to be run as
//! `submit demos/spin-job/target/.../spin-job [priority]` from the
//! shell, to exercise the scheduler's resume/pause cycle end to end.

use clap::Parser;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "spin-job", about = "Spin-loop for a fixed duration to exercise the scheduler")]
struct Args {
    /// How long to spin before exiting.
    #[arg(long, default_value_t = 250)]
    millis: u64,
}

fn real_main() -> i32 {
    let args = Args::parse();
    let deadline = Instant::now() + Duration::from_millis(args.millis);
    let mut ticks = 0u64;
    while Instant::now() < deadline {
        ticks = ticks.wrapping_add(1);
    }
    println!("spin-job: done after {} busy-loop iterations", ticks);
    0
}

fn main() {
    std::process::exit(job_shim::run_gated(real_main));
}
