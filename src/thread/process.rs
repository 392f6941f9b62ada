//! Process hierarchy: parent/child exec and exit synchronization.
//!
//! Grounded on `original_source/threads/thread.c`'s `sema_load`/`sema_wait`
//! fields and `userprog/process.c`'s `process_wait`/`process_exit`/
//! `start_process`: a child signals `sema_load` once its executable has
//! either loaded or failed to, letting a blocked `exec` return `-1` without
//! racing the child's first instruction; a child signals `sema_wait` once
//! in `thread_exit`, letting a blocked `wait` return promptly whether it
//! was already waiting or arrives after the child is long gone.
//!
//! Like [`crate::fs::Inode::extend_lock`], this state is kept out of
//! [`crate::thread::Thread`] itself rather than embedded in it: a
//! [`crate::sync::Semaphore`] operation needs `&mut Scheduler` to touch the
//! ready/blocked queues, which a field living inside a `Thread` the
//! `Scheduler` already owns cannot easily provide.

use crate::error::{KernelError, Result};
use crate::sync::{DownOutcome, Semaphore};
use crate::thread::scheduler::Scheduler;
use crate::thread::Tid;
use std::collections::BTreeMap;

struct ProcessSync {
    sema_load: Semaphore,
    sema_wait: Semaphore,
    /// `None` until the child's loader reports in; `Some(false)` on a bad
    /// ELF or other load failure.
    loaded: Option<bool>,
}

/// The result of [`ProcessTable::wait_for_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadWaitOutcome {
    /// The child had already reported in; `bool` is whether it loaded.
    Loaded(bool),
    /// The caller was blocked; call [`ProcessTable::finish_wait_for_load`]
    /// once the child has signalled and this thread is rescheduled.
    Blocked,
}

/// The result of [`ProcessTable::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child had already exited; carries its exit status.
    Done(i32),
    /// The caller was blocked; call [`ProcessTable::finish_wait`] once the
    /// child has exited and this thread is rescheduled.
    Blocked,
}

/// Tracks exec-load and exit-wait synchronization for every live
/// parent/child process pair, alongside [`Scheduler`]'s thread arena.
pub struct ProcessTable {
    procs: BTreeMap<Tid, ProcessSync>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
        }
    }

    /// Spawns `name` as a child of `parent`, registering parent/child
    /// bookkeeping and fresh `sema_load`/`sema_wait` state. Mirrors
    /// `process_execute`'s `thread_create` plus the child-list push in
    /// `thread_create`.
    pub fn spawn_child(
        &mut self,
        sched: &mut Scheduler,
        parent: Tid,
        name: impl Into<String>,
        priority: u8,
    ) -> Tid {
        let child = sched.spawn(name, priority);
        sched.thread_mut(child).parent = Some(parent);
        sched.thread_mut(parent).children.push(child);
        self.procs.insert(
            child,
            ProcessSync {
                sema_load: Semaphore::new(0),
                sema_wait: Semaphore::new(0),
                loaded: None,
            },
        );
        child
    }

    /// Called once the child's loader has run, successfully or not,
    /// matching `start_process`'s `sema_up(&sema_load)` right after setting
    /// `loaded`. Wakes a parent blocked in [`ProcessTable::wait_for_load`].
    pub fn signal_loaded(&mut self, sched: &mut Scheduler, child: Tid, success: bool) -> Result<bool> {
        let sync = self.procs.get_mut(&child).ok_or(KernelError::NoSuchEntry)?;
        sync.loaded = Some(success);
        Ok(sync.sema_load.up(sched))
    }

    /// A parent's blocking wait for `child`'s load outcome (the `exec`
    /// syscall's contract). Two-phase like every other blocking
    /// operation in this crate: call [`ProcessTable::finish_wait_for_load`]
    /// once `parent` is rescheduled after a `Blocked` result.
    pub fn wait_for_load(&mut self, sched: &mut Scheduler, parent: Tid, child: Tid) -> Result<LoadWaitOutcome> {
        let sync = self.procs.get_mut(&child).ok_or(KernelError::NoSuchEntry)?;
        match sync.sema_load.try_down(sched, parent) {
            DownOutcome::Acquired => Ok(LoadWaitOutcome::Loaded(sync.loaded.unwrap_or(false))),
            DownOutcome::Blocked => Ok(LoadWaitOutcome::Blocked),
        }
    }

    /// Reads back whether `child` loaded, once a previously `Blocked`
    /// [`ProcessTable::wait_for_load`] call has woken.
    pub fn finish_wait_for_load(&self, child: Tid) -> bool {
        self.procs.get(&child).and_then(|s| s.loaded).unwrap_or(false)
    }

    /// Records `tid`'s exit status and wakes any parent blocked in
    /// [`ProcessTable::wait`], matching `thread_exit`'s
    /// `sema_up(&sema_wait)`. The caller is
    /// responsible for actually transitioning the scheduler state
    /// (`Scheduler::exit_thread`) around this call.
    pub fn signal_exited(&mut self, sched: &mut Scheduler, tid: Tid, status: i32) -> bool {
        sched.thread_mut(tid).exit_status = Some(status);
        match self.procs.get_mut(&tid) {
            Some(sync) => sync.sema_wait.up(sched),
            None => false,
        }
    }

    /// A parent's blocking wait for `child` to exit (`process_wait`).
    /// Returns [`KernelError::NoSuchEntry`] if `child` is not
    /// (or is no longer) a live child of `parent` — the same condition
    /// `process_wait` reports as an immediate `-1` for an invalid tid, a
    /// non-child tid, or a tid already reaped by an earlier `wait`.
    pub fn wait(&mut self, sched: &mut Scheduler, parent: Tid, child: Tid) -> Result<WaitOutcome> {
        if !sched.thread(parent).children.contains(&child) {
            return Err(KernelError::NoSuchEntry);
        }
        let sync = self.procs.get_mut(&child).ok_or(KernelError::NoSuchEntry)?;
        match sync.sema_wait.try_down(sched, parent) {
            DownOutcome::Acquired => Ok(WaitOutcome::Done(self.finish_wait(sched, parent, child)?)),
            DownOutcome::Blocked => Ok(WaitOutcome::Blocked),
        }
    }

    /// Completes a previously `Blocked` [`ProcessTable::wait`] once `parent`
    /// is rescheduled: reads the child's exit status and reaps it
    /// (`remove_child_process`), so a second `wait` on the same tid reports
    /// `NoSuchEntry` rather than returning stale status again.
    pub fn finish_wait(&mut self, sched: &mut Scheduler, parent: Tid, child: Tid) -> Result<i32> {
        let status = sched.thread(child).exit_status.unwrap_or(-1);
        self.procs.remove(&child);
        sched.thread_mut(parent).children.retain(|&c| c != child);
        Ok(status)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_after_child_already_exited() {
        let mut sched = Scheduler::new(false);
        let mut procs = ProcessTable::new();
        let parent = sched.spawn("parent", 31);
        sched.next_to_run();
        let child = procs.spawn_child(&mut sched, parent, "child", 31);

        procs.signal_exited(&mut sched, child, 7);
        sched.exit_thread(child);

        match procs.wait(&mut sched, parent, child).unwrap() {
            WaitOutcome::Done(status) => assert_eq!(status, 7),
            WaitOutcome::Blocked => panic!("child already exited, wait should not block"),
        }
    }

    #[test]
    fn wait_blocks_until_child_exits_then_reaps_once() {
        let mut sched = Scheduler::new(false);
        let mut procs = ProcessTable::new();
        let parent = sched.spawn("parent", 31);
        sched.next_to_run();
        let child = procs.spawn_child(&mut sched, parent, "child", 31);

        assert_eq!(
            procs.wait(&mut sched, parent, child).unwrap(),
            WaitOutcome::Blocked
        );
        assert_eq!(sched.thread(parent).status, crate::thread::ThreadStatus::Blocked);

        let should_preempt = procs.signal_exited(&mut sched, child, 42);
        sched.exit_thread(child);
        assert!(should_preempt || sched.thread(parent).status == crate::thread::ThreadStatus::Ready);

        assert_eq!(procs.finish_wait(&mut sched, parent, child).unwrap(), 42);
        // A second wait on the same (now-reaped) child tid fails, matching
        // process_wait's "already successfully called" -1 case.
        assert_eq!(
            procs.wait(&mut sched, parent, child),
            Err(KernelError::NoSuchEntry)
        );
    }

    #[test]
    fn wait_on_non_child_is_rejected() {
        let mut sched = Scheduler::new(false);
        let mut procs = ProcessTable::new();
        let parent = sched.spawn("parent", 31);
        let stranger = sched.spawn("stranger", 31);
        assert_eq!(
            procs.wait(&mut sched, parent, stranger),
            Err(KernelError::NoSuchEntry)
        );
    }

    #[test]
    fn exec_load_failure_is_observed_by_parent() {
        let mut sched = Scheduler::new(false);
        let mut procs = ProcessTable::new();
        let parent = sched.spawn("parent", 31);
        sched.next_to_run();
        let child = procs.spawn_child(&mut sched, parent, "child", 31);

        assert_eq!(
            procs.wait_for_load(&mut sched, parent, child).unwrap(),
            LoadWaitOutcome::Blocked
        );
        procs.signal_loaded(&mut sched, child, false).unwrap();
        assert!(!procs.finish_wait_for_load(child));
    }
}
