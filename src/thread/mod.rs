//! Thread abstraction: the unit of scheduling.
//!
//! A [`Thread`] here is pure data: the scheduler (`scheduler` submodule) owns
//! every `Thread` in an id-indexed arena and mutates it through `&mut`
//! methods, rather than through intrusive, self-referential `list_elem`
//! fields (which rely on `offset_of` arithmetic that has no safe Rust
//! equivalent).

pub mod process;
pub mod scheduler;

use crate::fixedpoint::Fixed17_14;
use crate::vm::VmTable;
use std::collections::BTreeSet;

/// Lowest legal priority.
pub const PRI_MIN: u8 = 0;
/// Default priority assigned to newly created threads.
pub const PRI_DEFAULT: u8 = 31;
/// Highest legal priority.
pub const PRI_MAX: u8 = 63;

/// Number of file-descriptor slots, including the two reserved stdio slots.
pub const FD_TABLE_SIZE: usize = 128;

/// A thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

/// An identifier for a [`crate::sync::Lock`], used to look up the current
/// holder when walking a priority-donation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u64);

/// The life-cycle states of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Currently executing on the (single) CPU.
    Running,
    /// Runnable, sitting in the scheduler's ready queue.
    Ready,
    /// Waiting on a semaphore, lock, or sleep deadline.
    Blocked,
    /// Exited, awaiting teardown of its kernel page.
    Dying,
}

/// A single open-file-descriptor slot.
///
/// The syscall dispatcher and file-object representation live outside
/// this crate; this crate only needs to know *that* a slot is occupied,
/// since the VM layer's `mmap` re-opens a file handle and the inode
/// layer's deny-write accounting is driven by open/close. The opaque
/// `u64` stands in for whatever handle type the embedding process layer
/// uses.
pub type FileHandle = u64;

/// A thread: the unit of scheduling.
#[derive(Debug)]
pub struct Thread {
    /// Stable identifier.
    pub tid: Tid,
    /// Name, used for exit-status termination messages and debugging.
    pub name: String,
    /// Effective priority, i.e. the priority actually used by the
    /// scheduler: `max(init_priority, donors' effective priorities)`.
    pub priority: u8,
    /// Baseline priority before any donation.
    pub init_priority: u8,
    /// Current life-cycle state.
    pub status: ThreadStatus,
    /// Parent thread, if any (the initial thread has none).
    pub parent: Option<Tid>,
    /// Children spawned by this thread.
    pub children: Vec<Tid>,
    /// Tick at which a sleeping thread should be woken; `None` otherwise.
    pub wakeup_tick: Option<u64>,
    /// Lock this thread is currently blocked waiting to acquire.
    pub wait_on_lock: Option<LockId>,
    /// Threads that have donated their priority to this one, in donation
    /// order. A `Vec` rather than an intrusive list, per the Design Notes.
    pub donations: Vec<Tid>,
    /// Exit status, set by `thread_exit`/the equivalent of `exit(status)`.
    pub exit_status: Option<i32>,
    /// Fixed-capacity file descriptor table; indices 0 and 1 are reserved
    /// for stdio by convention and left `None` here (stdio itself is
    /// provided by the embedding kernel).
    pub fd_table: [Option<FileHandle>; FD_TABLE_SIZE],
    /// This process's virtual address table.
    pub vm_table: VmTable,
    /// MLFQS niceness, user-settable, integer.
    pub nice: i32,
    /// MLFQS recent-CPU estimator, 17.14 fixed point.
    pub recent_cpu: Fixed17_14,
    /// Time-slice ticks consumed since this thread last started running,
    /// used by the round-robin preemption check (`TIME_SLICE`).
    pub(crate) slice_used: u32,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: impl Into<String>, priority: u8) -> Self {
        let priority = priority.clamp(PRI_MIN, PRI_MAX);
        Self {
            tid,
            name: name.into(),
            priority,
            init_priority: priority,
            status: ThreadStatus::Ready,
            parent: None,
            children: Vec::new(),
            wakeup_tick: None,
            wait_on_lock: None,
            donations: Vec::new(),
            exit_status: None,
            fd_table: [None; FD_TABLE_SIZE],
            vm_table: VmTable::new(),
            nice: 0,
            recent_cpu: Fixed17_14::ZERO,
            slice_used: 0,
        }
    }

    /// Returns the thread's current effective priority: always the donated
    /// value, never the baseline.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// `recent_cpu`, scaled by 100 and rounded, as reported by
    /// `thread_get_recent_cpu`.
    pub fn recent_cpu_percent(&self) -> i64 {
        self.recent_cpu.mul_int(100).round()
    }

    /// The donating threads whose priority currently feeds this thread's
    /// effective priority, i.e. `priority` should equal
    /// `max(init_priority, donors' effective priorities)`. Intended for
    /// test assertions, not hot paths.
    pub(crate) fn donation_set(&self) -> BTreeSet<Tid> {
        self.donations.iter().copied().collect()
    }
}
