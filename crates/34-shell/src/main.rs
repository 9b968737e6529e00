//! The shell/submitter process (spec.md §4.1, §6).
//!
//! Owns the shared-memory segment, launches the scheduler child, accepts
//! `submit`/`history`/`exit` plus a small external-command surface
//! (plain commands, pipelines, `<`/`>` redirection, `&` backgrounding —
//! orthogonal POSIX plumbing per spec.md §1), and drives graceful
//! shutdown on `exit`/EOF/SIGINT. A `SIGCHLD` handler (spec.md §4.1's
//! "install a SIGCHLD handler that reaps any child in WNOHANG mode")
//! flags the main loop to run its `WNOHANG` reap sweep, so a submitted
//! job's exit is picked up on the loop's next pass rather than only
//! when the user happens to type another line.
//!
//! Process creation (`fork`/`execv`/pipes) goes through raw `libc` calls
//! rather than `nix`'s owned-fd wrappers, matching `job-table`'s own
//! choice to reach for `libc` directly wherever a primitive needs exact
//! control over file descriptors across a `fork`. Signal delivery and
//! reaping stay on `nix`, as in the `scheduler` binary.

use clap::Parser;
use job_table::{OwnedSegment, ShellJobTable};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use shell_core::{
    classify_line, is_submit_stage, resolve_program, validate_priority, CommandLogEntry, ExternalCommand, History,
    JobMirror, ParsedLine, PathProbe, SubmitError,
};
use std::ffi::CString;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "SimpleShell", about = "Interactive shell that submits jobs to the priority round-robin scheduler")]
struct Args {
    /// Number of logical CPUs handed to the scheduler.
    ncpu: usize,
    /// Quantum length in microseconds handed to the scheduler.
    tslice_us: u64,
}

#[derive(Debug, Error)]
enum SetupError {
    #[error("NCPU and TSLICE_US must be positive")]
    InvalidArgs,
    #[error(transparent)]
    Shm(#[from] job_table::ShmError),
    #[error(transparent)]
    Signal(#[from] nix::Error),
}

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGCHLD_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Async-signal-safe: only flips a flag. The actual `WNOHANG` reap
/// sweep (`Shell::reap_children`) runs on the main loop's next pass,
/// per spec.md §4.1's "Install a SIGCHLD handler that reaps any child
/// in WNOHANG mode" — the handler itself just marks that a reap is due
/// so the blocking `read_line` below doesn't sit on a zombie until the
/// next keypress.
extern "C" fn on_sigchld(_: nix::libc::c_int) {
    SIGCHLD_RECEIVED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGINT, &action)? };
    Ok(())
}

/// No `SA_RESTART`: a `SIGCHLD` arriving while `read_line` is blocked
/// on stdin interrupts that read with `EINTR` instead of silently
/// resuming it, so the main loop notices `SIGCHLD_RECEIVED` and reaps
/// promptly instead of waiting for the user's next line.
fn install_sigchld_handler() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::Handler(on_sigchld), SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGCHLD, &action)? };
    Ok(())
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct RealProbe;

impl PathProbe for RealProbe {
    fn is_executable(&self, path: &Path) -> bool {
        unistd::access(path, unistd::AccessFlags::X_OK).is_ok()
    }
}

fn path_dirs() -> Vec<PathBuf> {
    std::env::var_os("PATH").map(|p| std::env::split_paths(&p).collect()).unwrap_or_default()
}

/// The scheduler binary is expected to live alongside the shell binary,
/// matching the original's `execl("./s", ...)` sibling-path convention.
fn scheduler_binary_path() -> PathBuf {
    std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("scheduler"))).unwrap_or_else(|| PathBuf::from("./scheduler"))
}

fn to_cstring(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| CString::new("").unwrap())
}

/// `fork()` via raw `libc`. Returns `None` in the child (caller execs or
/// exits before returning), `Some(child_pid)` in the parent, or an error
/// if `fork` itself failed.
fn raw_fork() -> std::io::Result<Option<Pid>> {
    let rc = unsafe { libc::fork() };
    match rc {
        -1 => Err(std::io::Error::last_os_error()),
        0 => Ok(None),
        pid => Ok(Some(Pid::from_raw(pid))),
    }
}

fn raw_pipe() -> std::io::Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn raw_dup2(old: i32, new: i32) {
    unsafe { libc::dup2(old, new) };
}

fn raw_close(fd: i32) {
    unsafe { libc::close(fd) };
}

/// Never returns on success. Child-side exec helper shared by every
/// fork+exec site below.
fn raw_execv(path: &Path, argv0: &str) -> ! {
    let c_path = to_cstring(&path.to_string_lossy());
    let c_arg0 = to_cstring(argv0);
    let argv: [*const libc::c_char; 2] = [c_arg0.as_ptr(), std::ptr::null()];
    unsafe { libc::execv(c_path.as_ptr(), argv.as_ptr()) };
    eprintln!("shell: failed to execute {argv0}");
    std::process::exit(1);
}

fn raw_execvp(words: &[&str]) -> ! {
    let c_args: Vec<CString> = words.iter().map(|w| to_cstring(w)).collect();
    let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|c| c.as_ptr()).collect();
    argv.push(std::ptr::null());
    unsafe { libc::execvp(argv[0], argv.as_ptr()) };
    eprintln!("SimpleShell: {}: command not found", words[0]);
    std::process::exit(1);
}

struct Shell {
    segment: OwnedSegment,
    scheduler_pid: Pid,
    mirror: JobMirror,
    history: History,
    probe: RealProbe,
    search_dirs: Vec<PathBuf>,
}

impl Shell {
    fn launch_scheduler(shmid: i32, ncpu: usize, tslice_us: u64) -> std::io::Result<Pid> {
        let exe = scheduler_binary_path();
        match raw_fork()? {
            None => {
                let c_path = to_cstring(&exe.to_string_lossy());
                let c_args = [
                    to_cstring("scheduler"),
                    to_cstring(&ncpu.to_string()),
                    to_cstring(&tslice_us.to_string()),
                    to_cstring(&shmid.to_string()),
                ];
                let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|c| c.as_ptr()).collect();
                argv.push(std::ptr::null());
                unsafe { libc::execv(c_path.as_ptr(), argv.as_ptr()) };
                eprintln!("shell: failed to launch scheduler");
                std::process::exit(1);
            }
            Some(child) => Ok(child),
        }
    }

    fn submit(&mut self, program: &str, priority_raw: Option<&str>) -> Result<(), SubmitError> {
        if program.is_empty() {
            return Err(SubmitError::InvalidArgs);
        }
        let priority = validate_priority(priority_raw);
        let resolved =
            resolve_program(program, &self.search_dirs, &self.probe).ok_or_else(|| SubmitError::NotExecutable(program.to_string()))?;

        {
            let table = ShellJobTable::new(self.segment.as_mut());
            if table.is_full() {
                return Err(SubmitError::Full);
            }
        }

        let (read_fd, write_fd) = raw_pipe().map_err(|_| SubmitError::NotExecutable(program.to_string()))?;

        match raw_fork() {
            Ok(None) => {
                // Block resume before exec so the shim installs its own
                // handler without racing an early signal delivery.
                let mut mask = SigSet::empty();
                mask.add(Signal::SIGUSR1);
                let _ = mask.thread_block();

                raw_dup2(write_fd, 1);
                raw_dup2(write_fd, 2);
                raw_close(read_fd);
                raw_close(write_fd);
                raw_execv(&resolved, program);
            }
            Ok(Some(child)) => {
                raw_close(write_fd);
                let pid = child.as_raw();
                let start = now();

                {
                    let mut table = ShellJobTable::new(self.segment.as_mut());
                    table.publish(pid, program, priority, start).map_err(|_| SubmitError::Full)?;
                }

                println!("Submitted job: {program} with PID: {pid}, Priority: {priority}");
                spawn_output_pump(read_fd);

                self.mirror.push(pid, program, priority, start);
                self.history.push(CommandLogEntry {
                    line: format!("submit {program}"),
                    pid: Some(pid),
                    start_time: start,
                    end_time: None,
                    background: true,
                });
                Ok(())
            }
            Err(_) => {
                raw_close(read_fd);
                raw_close(write_fd);
                Err(SubmitError::NotExecutable(program.to_string()))
            }
        }
    }

    fn run_external(&mut self, cmd: &ExternalCommand) {
        if cmd.stages.len() > 1 && cmd.stages.iter().any(|s| is_submit_stage(s)) {
            println!("Error: submit is not allowed inside a pipeline");
            return;
        }
        if cmd.stages.is_empty() {
            return;
        }

        let start = now();
        let pid = if cmd.stages.len() > 1 {
            run_pipeline(&cmd.stages)
        } else {
            run_single_stage(&cmd.stages[0], cmd.redirect_in.as_deref(), cmd.redirect_out.as_deref())
        };

        let Some(pid) = pid else { return };

        if cmd.background {
            println!("[{}] {}", pid.as_raw(), cmd.raw);
            self.history.push(CommandLogEntry { line: cmd.raw.clone(), pid: Some(pid.as_raw()), start_time: start, end_time: None, background: true });
        } else {
            let _ = waitpid(pid, Some(WaitPidFlag::WUNTRACED));
            let end = now();
            self.history.push(CommandLogEntry { line: cmd.raw.clone(), pid: Some(pid.as_raw()), start_time: start, end_time: Some(end), background: false });
        }
    }

    /// Non-blocking sweep of every exited child — both submitted jobs
    /// (completing their shared-table record; see
    /// `ShellJobTable::mark_completed_by_pid`) and background/external
    /// commands (closing out their history entry).
    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    let raw = pid.as_raw();
                    if raw == self.scheduler_pid.as_raw() {
                        println!("shell: scheduler terminated");
                        continue;
                    }
                    let end = now();
                    let mut table = ShellJobTable::new(self.segment.as_mut());
                    let was_submitted = table.mark_completed_by_pid(raw, end);
                    drop(table);
                    if was_submitted {
                        self.mirror.mark_completed(raw);
                        println!("Job PID {raw} completed");
                    }
                    for entry in self.history.entries().iter() {
                        if entry.pid == Some(raw) && entry.end_time.is_none() {
                            println!("[{raw}] Done");
                            break;
                        }
                    }
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    /// Run termination (spec.md §4.1): `SIGTERM` the scheduler and wait
    /// for it, `SIGTERM` every still-incomplete submitted pid and wait
    /// for each, print the execution summary, then detach and destroy
    /// the shared segment. Consumes `self` since the segment cannot be
    /// used afterward.
    fn shutdown(mut self) {
        let _ = signal::kill(self.scheduler_pid, Signal::SIGTERM);
        let _ = waitpid(self.scheduler_pid, None);

        for pid in self.mirror.incomplete_pids() {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
            let _ = waitpid(Pid::from_raw(pid), None);
            let mut table = ShellJobTable::new(self.segment.as_mut());
            table.mark_completed_by_pid(pid, now());
        }

        print_execution_summary(&self.history);
        let _ = self.segment.destroy();
    }
}

fn spawn_output_pump(read_fd: i32) {
    use std::os::unix::io::FromRawFd;
    std::thread::spawn(move || {
        let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let mut buf = [0u8; 4096];
        loop {
            match file.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(&buf[..n]);
                    let _ = stdout.flush();
                }
            }
        }
    });
}

fn run_single_stage(stage: &str, redirect_in: Option<&str>, redirect_out: Option<&str>) -> Option<Pid> {
    let words: Vec<&str> = stage.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }
    match raw_fork() {
        Ok(None) => {
            if let Some(path) = redirect_in {
                let c_path = to_cstring(path);
                let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
                if fd >= 0 {
                    raw_dup2(fd, 0);
                    raw_close(fd);
                }
            }
            if let Some(path) = redirect_out {
                let c_path = to_cstring(path);
                let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644) };
                if fd >= 0 {
                    raw_dup2(fd, 1);
                    raw_close(fd);
                }
            }
            raw_execvp(&words);
        }
        Ok(Some(child)) => Some(child),
        Err(_) => {
            eprintln!("SimpleShell: fork failed");
            None
        }
    }
}

fn run_pipeline(stages: &[String]) -> Option<Pid> {
    let stage_words: Vec<Vec<&str>> = stages.iter().map(|s| s.split_whitespace().collect()).collect();
    match raw_fork() {
        Ok(None) => {
            let n = stage_words.len();
            let mut pipes = Vec::new();
            for _ in 0..n.saturating_sub(1) {
                match raw_pipe() {
                    Ok(p) => pipes.push(p),
                    Err(_) => std::process::exit(1),
                }
            }
            for (i, words) in stage_words.iter().enumerate() {
                match raw_fork() {
                    Ok(None) => {
                        if i > 0 {
                            raw_dup2(pipes[i - 1].0, 0);
                        }
                        if i < n - 1 {
                            raw_dup2(pipes[i].1, 1);
                        }
                        for (r, w) in &pipes {
                            raw_close(*r);
                            raw_close(*w);
                        }
                        raw_execvp(words);
                    }
                    Ok(Some(_)) => continue,
                    Err(_) => std::process::exit(1),
                }
            }
            for (r, w) in &pipes {
                raw_close(*r);
                raw_close(*w);
            }
            for _ in 0..n {
                let _ = waitpid(Pid::from_raw(-1), None);
            }
            std::process::exit(0);
        }
        Ok(Some(child)) => Some(child),
        Err(_) => {
            eprintln!("SimpleShell: fork failed");
            None
        }
    }
}

fn print_execution_summary(history: &History) {
    println!("\nCommand Execution Summary:");
    for entry in history.entries() {
        println!("Command: {}", entry.line);
        if let Some(pid) = entry.pid {
            println!("  PID: {pid}");
        }
        match entry.end_time {
            Some(end) => println!("  Duration: {} seconds", (end - entry.start_time).max(0)),
            None => println!("  (background process or terminated)"),
        }
        println!("  Background: {}", if entry.background { "Yes" } else { "No" });
    }
}

fn run(args: Args) -> Result<(), SetupError> {
    if args.ncpu == 0 || args.tslice_us == 0 {
        return Err(SetupError::InvalidArgs);
    }

    let mut segment = OwnedSegment::create()?;
    let shmid = segment.shmid();
    let scheduler_pid =
        Shell::launch_scheduler(shmid, args.ncpu, args.tslice_us).map_err(|e| SetupError::Signal(nix::Error::from_i32(e.raw_os_error().unwrap_or(0))))?;
    install_sigint_handler()?;
    install_sigchld_handler()?;

    let mut shell =
        Shell { segment, scheduler_pid, mirror: JobMirror::new(), history: History::new(), probe: RealProbe, search_dirs: path_dirs() };

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        if SIGINT_RECEIVED.load(Ordering::SeqCst) {
            shell.shutdown();
            return Ok(());
        }
        // The SIGCHLD handler only flips a flag (async-signal-safe); the
        // actual WNOHANG reap sweep happens here, so a submitted job
        // that exits is reaped every time the main loop comes back
        // around rather than only when the user types a line.
        if SIGCHLD_RECEIVED.swap(false, Ordering::SeqCst) {
            shell.reap_children();
        }

        print!("SimpleShell> ");
        let _ = std::io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!("\nExiting shell.");
                shell.shutdown();
                return Ok(());
            }
            Ok(_) => {}
            Err(_) => continue,
        }

        shell.reap_children();

        match classify_line(&line) {
            ParsedLine::Empty => continue,
            ParsedLine::Exit => {
                shell.shutdown();
                return Ok(());
            }
            ParsedLine::History => {
                for rendered in shell.history.render() {
                    println!("{rendered}");
                }
            }
            ParsedLine::Submit { program, priority_raw } => match shell.submit(&program, priority_raw.as_deref()) {
                Ok(()) => {}
                Err(e) => println!("{e}"),
            },
            ParsedLine::External(cmd) => shell.run_external(&cmd),
        }
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("shell: {e}");
        std::process::exit(1);
    }
}
