//! Shared-memory job table.
//!
//! One page of memory is the sole channel between the shell/submitter
//! process and the scheduler process. The shell appends `JobRecord`s and
//! flips `is_new`; the scheduler clears `is_new` on intake and sets
//! `completed`/`end_time` on reap. Every other field has exactly one
//! writer for the lifetime of the record, so no lock is needed — see
//! `ShellJobTable` and `SchedulerJobTable` below, which split the
//! read/write surface so the compiler enforces who may touch what.

use thiserror::Error;

/// Fixed capacity of the job table. Records are appended, never compacted.
pub const MAX_JOBS: usize = 100;
/// Highest numeric priority value; 1 is the highest-priority job.
pub const MAX_PRIORITY: i32 = 4;
/// Priority assigned when `submit`'s priority argument is absent or invalid.
pub const DEFAULT_PRIORITY: i32 = 1;

const NAME_LEN: usize = 256;

/// One submitted program's row in the shared job table.
///
/// `#[repr(C)]` and plain `i32`/`time_t` fields so the layout matches
/// spec.md's bit-exact description and is stable across the shell and
/// scheduler binaries (same ABI, same compiler, same target).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct JobRecord {
    pid: i32,
    name: [u8; NAME_LEN],
    priority: i32,
    is_new: i32,
    completed: i32,
    start_time: i64,
    end_time: i64,
}

impl JobRecord {
    const fn empty() -> Self {
        JobRecord {
            pid: 0,
            name: [0; NAME_LEN],
            priority: 0,
            is_new: 0,
            completed: 0,
            start_time: 0,
            end_time: 0,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..nul]).unwrap_or("")
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_new(&self) -> bool {
        self.is_new != 0
    }

    pub fn is_completed(&self) -> bool {
        self.completed != 0
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }
}

/// A scheduler-private copy of the fields needed to track a job outside
/// shared memory (the running slot / ready queue never hold shared-memory
/// pointers, only copies — see spec.md's Design Notes on the ready queue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSnapshot {
    pub pid: i32,
    pub name: String,
    pub priority: i32,
}

/// `#[repr(C)]` shared-memory layout: fixed job array, append cursor,
/// and a scheduler-readiness flag. Zero-initialized by the shell before
/// the scheduler is forked.
#[repr(C)]
pub struct SharedMemory {
    jobs: [JobRecord; MAX_JOBS],
    job_count: i32,
    scheduler_ready: i32,
}

impl SharedMemory {
    pub fn zeroed() -> Self {
        SharedMemory {
            jobs: [JobRecord::empty(); MAX_JOBS],
            job_count: 0,
            scheduler_ready: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("job table is full ({max} jobs)")]
    Full { max: usize },
}

/// The shell's view of the table: append new records, flip the
/// scheduler-readiness flag, and read back completion state for its
/// summary. The shell never clears `is_new` or sets `completed` itself
/// except during graceful shutdown's final sweep.
pub struct ShellJobTable<'a> {
    mem: &'a mut SharedMemory,
}

impl<'a> ShellJobTable<'a> {
    pub fn new(mem: &'a mut SharedMemory) -> Self {
        ShellJobTable { mem }
    }

    pub fn job_count(&self) -> usize {
        self.mem.job_count as usize
    }

    pub fn is_full(&self) -> bool {
        self.job_count() >= MAX_JOBS
    }

    /// Append a new record and mark it new. Writes the fields first,
    /// then increments `job_count` last, matching the single-writer
    /// publication order spec.md requires.
    pub fn publish(&mut self, pid: i32, name: &str, priority: i32, start_time: i64) -> Result<usize, PublishError> {
        if self.is_full() {
            return Err(PublishError::Full { max: MAX_JOBS });
        }
        let idx = self.mem.job_count as usize;
        let rec = &mut self.mem.jobs[idx];
        rec.pid = pid;
        rec.set_name(name);
        rec.priority = priority;
        rec.is_new = 1;
        rec.completed = 0;
        rec.start_time = start_time;
        rec.end_time = 0;
        self.mem.job_count += 1;
        Ok(idx)
    }

    pub fn record(&self, idx: usize) -> &JobRecord {
        &self.mem.jobs[idx]
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.mem.jobs[..self.job_count()]
    }

    /// Used only by shutdown: the shell marks a still-incomplete job
    /// completed after it has `SIGTERM`ed and reaped it itself, so the
    /// summary reflects every job exactly once even if the scheduler
    /// already exited.
    pub fn force_complete(&mut self, idx: usize, end_time: i64) {
        let rec = &mut self.mem.jobs[idx];
        if rec.completed == 0 {
            rec.completed = 1;
            rec.end_time = end_time;
        }
    }

    /// Mark a job completed from the shell's own `SIGCHLD` reap.
    ///
    /// Submitted programs are forked by the shell, so the shell — not
    /// the scheduler — is their real OS parent and the only process that
    /// can actually `waitpid` their exit. The scheduler's own reap
    /// attempt (`scheduler_core::ProcessControl::reap_all`) is harmless
    /// but will observe nothing in a live run; this is where `completed`
    /// actually gets set. No-op if already completed or pid unknown.
    pub fn mark_completed_by_pid(&mut self, pid: i32, end_time: i64) -> bool {
        let count = self.job_count();
        for rec in &mut self.mem.jobs[..count] {
            if rec.pid == pid {
                if rec.completed == 0 {
                    rec.completed = 1;
                    rec.end_time = end_time;
                    return true;
                }
                return false;
            }
        }
        false
    }
}

/// The scheduler's view of the table: observe new records, clear
/// `is_new` on intake, and set `completed`/`end_time` on reap. The
/// scheduler never appends records or touches `job_count`.
pub struct SchedulerJobTable<'a> {
    mem: &'a mut SharedMemory,
}

impl<'a> SchedulerJobTable<'a> {
    pub fn new(mem: &'a mut SharedMemory) -> Self {
        SchedulerJobTable { mem }
    }

    pub fn job_count(&self) -> usize {
        self.mem.job_count as usize
    }

    /// Scan `jobs[0..job_count)` for records with `is_new=1 && completed=0`,
    /// clearing `is_new` as each one is taken (the edge-triggered
    /// 1→0 handoff). Returns snapshots in table order (i.e. publication
    /// order), which is also ready-queue arrival order.
    pub fn take_new(&mut self) -> Vec<JobSnapshot> {
        let count = self.job_count();
        let mut out = Vec::new();
        for rec in &mut self.mem.jobs[..count] {
            if rec.is_new() && !rec.is_completed() {
                out.push(JobSnapshot {
                    pid: rec.pid,
                    name: rec.name().to_string(),
                    priority: rec.priority,
                });
                rec.is_new = 0;
            }
        }
        out
    }

    /// Mark the record for `pid` completed. No-op if already completed
    /// or if no record matches (the pid may belong to a job already
    /// reaped through another path).
    pub fn mark_completed(&mut self, pid: i32, end_time: i64) -> bool {
        let count = self.job_count();
        for rec in &mut self.mem.jobs[..count] {
            if rec.pid == pid {
                if rec.completed == 0 {
                    rec.completed = 1;
                    rec.end_time = end_time;
                    return true;
                }
                return false;
            }
        }
        false
    }

    pub fn is_completed(&self, pid: i32) -> Option<bool> {
        let count = self.job_count();
        self.mem.jobs[..count].iter().find(|r| r.pid == pid).map(|r| r.is_completed())
    }

    /// True once every published record is completed — used by the
    /// schedule step's termination check together with the ready queue
    /// and running-slot emptiness. Vacuously true when `job_count == 0`
    /// (no record to fail the `all`), so callers must separately guard
    /// against treating an empty, not-yet-submitted-to table as idle —
    /// see `scheduler_core::Scheduler::step`.
    pub fn all_completed(&self) -> bool {
        let count = self.job_count();
        self.mem.jobs[..count].iter().all(|r| r.is_completed())
    }

    /// Publish the scheduler-readiness flag: set once the scheduler has
    /// attached the segment and is ready to observe submissions, and
    /// cleared again as it detaches. The scheduler is the sole writer.
    pub fn set_ready(&mut self, ready: bool) {
        self.mem.scheduler_ready = ready as i32;
    }

    pub fn is_ready(&self) -> bool {
        self.mem.scheduler_ready != 0
    }

    pub fn records(&self) -> &[JobRecord] {
        let count = self.job_count();
        &self.mem.jobs[..count]
    }
}

#[cfg(unix)]
mod shm {
    use super::SharedMemory;
    use std::mem::size_of;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ShmError {
        #[error("shmget failed: {0}")]
        Get(std::io::Error),
        #[error("shmat failed: {0}")]
        Attach(std::io::Error),
        #[error("shmdt failed: {0}")]
        Detach(std::io::Error),
        #[error("shmctl(IPC_RMID) failed: {0}")]
        Remove(std::io::Error),
    }

    /// A shared-memory segment created and owned by the shell. Dropping
    /// it only detaches; `destroy()` additionally removes the segment
    /// from the kernel, matching the shell's exclusive ownership of the
    /// segment's lifetime (spec.md §6: "destroyed at shell exit").
    pub struct OwnedSegment {
        shmid: i32,
        ptr: *mut SharedMemory,
    }

    /// A shared-memory segment attached (not owned) by the scheduler.
    /// Detaches on drop; never removes the segment.
    pub struct AttachedSegment {
        ptr: *mut SharedMemory,
    }

    // Safety: the segment is shared by design; every field inside
    // `SharedMemory` has exactly one writer within its lifecycle phase
    // (see job_table's module docs), so concurrent access across
    // processes is sound without a lock. Sending the pointer across
    // threads within one process (e.g. to the I/O-pump thread, which
    // never touches it) is likewise fine because it is never actually
    // shared with that thread.
    unsafe impl Send for OwnedSegment {}
    unsafe impl Send for AttachedSegment {}

    impl OwnedSegment {
        /// Create a fresh, zero-initialized segment sized for one
        /// `SharedMemory`. Uses `IPC_PRIVATE` rather than `ftok` so
        /// concurrent shell instances never collide on a key derived
        /// from the current directory.
        pub fn create() -> Result<Self, ShmError> {
            let size = size_of::<SharedMemory>();
            let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o666) };
            if shmid == -1 {
                return Err(ShmError::Get(std::io::Error::last_os_error()));
            }
            let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
            if ptr as isize == -1 {
                return Err(ShmError::Attach(std::io::Error::last_os_error()));
            }
            let ptr = ptr as *mut SharedMemory;
            unsafe { ptr.write(SharedMemory::zeroed()) };
            Ok(OwnedSegment { shmid, ptr })
        }

        pub fn shmid(&self) -> i32 {
            self.shmid
        }

        pub fn as_mut(&mut self) -> &mut SharedMemory {
            unsafe { &mut *self.ptr }
        }

        /// Detach and remove the segment from the kernel. Consumes
        /// `self` so the segment cannot be used afterward.
        pub fn destroy(self) -> Result<(), ShmError> {
            let shmid = self.shmid;
            let ptr = self.ptr;
            std::mem::forget(self);
            if unsafe { libc::shmdt(ptr as *const _) } == -1 {
                return Err(ShmError::Detach(std::io::Error::last_os_error()));
            }
            if unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
                return Err(ShmError::Remove(std::io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl Drop for OwnedSegment {
        fn drop(&mut self) {
            unsafe { libc::shmdt(self.ptr as *const _) };
        }
    }

    impl AttachedSegment {
        pub fn attach(shmid: i32) -> Result<Self, ShmError> {
            let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
            if ptr as isize == -1 {
                return Err(ShmError::Attach(std::io::Error::last_os_error()));
            }
            Ok(AttachedSegment { ptr: ptr as *mut SharedMemory })
        }

        pub fn as_mut(&mut self) -> &mut SharedMemory {
            unsafe { &mut *self.ptr }
        }
    }

    impl Drop for AttachedSegment {
        fn drop(&mut self) {
            unsafe { libc::shmdt(self.ptr as *const _) };
        }
    }
}

#[cfg(unix)]
pub use shm::{AttachedSegment, OwnedSegment, ShmError};
