//! Mutual-exclusion lock with priority donation.
//!
//! A lock is a binary semaphore plus a `holder` field. `acquire` records
//! the donation before blocking so that by the time the caller observes
//! `Blocked`, the holder's effective priority has already been raised.
//! `release` clears the donation and hands the underlying semaphore to the
//! next waiter.
//!
//! As with [`crate::sync::Semaphore`], acquisition is two-phase:
//! [`Lock::acquire`] either succeeds immediately or reports `Blocked`, and
//! [`Lock::finish_acquire`] must be called once the embedding kernel
//! actually resumes the waiting thread (i.e. once it is next scheduled),
//! finalizing the handoff.

use super::semaphore::{DownOutcome, Semaphore};
use crate::thread::scheduler::Scheduler;
use crate::thread::{LockId, Tid};

/// The result of attempting to acquire a [`Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free; `tid` now holds it.
    Acquired,
    /// The lock was held; `tid` was blocked and donation was propagated.
    /// The caller must invoke [`Lock::finish_acquire`] once `tid` is next
    /// scheduled.
    Blocked,
}

/// A mutual-exclusion lock supporting priority donation.
#[derive(Debug)]
pub struct Lock {
    id: LockId,
    sema: Semaphore,
}

impl Lock {
    /// Creates a new, initially-unheld lock, registering it with `sched` so
    /// donation-chain walks can find its holder.
    pub fn new(sched: &mut Scheduler) -> Self {
        Self {
            id: sched.new_lock_id(),
            sema: Semaphore::new(1),
        }
    }

    /// This lock's identifier, as stored in a blocked thread's
    /// `wait_on_lock`.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// The lock's current holder, if any.
    pub fn holder(&self, sched: &Scheduler) -> Option<Tid> {
        sched.lock_holder(self.id)
    }

    /// Returns whether `tid` currently holds this lock.
    pub fn is_held_by(&self, sched: &Scheduler, tid: Tid) -> bool {
        self.holder(sched) == Some(tid)
    }

    /// Attempts to acquire the lock on behalf of `tid`. `tid` must not
    /// already hold it (checked with `assert!`, matching
    /// `original_source`'s `ASSERT (!lock_held_by_current_thread (lock))`).
    pub fn acquire(&mut self, sched: &mut Scheduler, tid: Tid) -> LockOutcome {
        assert!(
            !self.is_held_by(sched, tid),
            "thread {:?} re-acquiring a lock it already holds",
            tid
        );
        if self.holder(sched).is_some() {
            sched.begin_wait(tid, self.id);
            let outcome = self.sema.try_down(sched, tid);
            debug_assert_eq!(outcome, DownOutcome::Blocked);
            LockOutcome::Blocked
        } else {
            let outcome = self.sema.try_down(sched, tid);
            debug_assert_eq!(outcome, DownOutcome::Acquired);
            sched.set_lock_holder(self.id, Some(tid));
            sched.thread_mut(tid).wait_on_lock = None;
            LockOutcome::Acquired
        }
    }

    /// Finalizes a previously `Blocked` acquisition once `tid` is actually
    /// scheduled again.
    pub fn finish_acquire(&mut self, sched: &mut Scheduler, tid: Tid) {
        sched.set_lock_holder(self.id, Some(tid));
        sched.thread_mut(tid).wait_on_lock = None;
    }

    /// Releases the lock, restoring the holder's priority and handing off
    /// to the next waiter, if any. Returns `true` if the newly-unblocked
    /// waiter should preempt the releasing thread.
    pub fn release(&mut self, sched: &mut Scheduler, tid: Tid) -> bool {
        assert!(
            self.is_held_by(sched, tid),
            "thread {:?} releasing a lock it does not hold",
            tid
        );
        sched.set_lock_holder(self.id, None);
        let waiters_donating_to_tid: Vec<Tid> = sched
            .thread(tid)
            .donations
            .iter()
            .copied()
            .filter(|&d| sched.thread(d).wait_on_lock == Some(self.id))
            .collect();
        for donor in waiters_donating_to_tid {
            sched.remove_donation(tid, donor);
        }
        self.sema.up(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::scheduler::Scheduler;

    #[test]
    fn simple_acquire_release_roundtrip() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 31);
        let mut lock = Lock::new(&mut s);
        assert_eq!(lock.acquire(&mut s, a), LockOutcome::Acquired);
        assert!(lock.is_held_by(&s, a));
        lock.release(&mut s, a);
        assert!(lock.holder(&s).is_none());
    }

    #[test]
    fn blocked_high_priority_waiter_donates_to_holder() {
        let mut s = Scheduler::new(false);
        let low = s.spawn("low", 31);
        let high = s.spawn("high", 63);
        let mut lock = Lock::new(&mut s);

        assert_eq!(lock.acquire(&mut s, low), LockOutcome::Acquired);
        assert_eq!(lock.acquire(&mut s, high), LockOutcome::Blocked);
        assert_eq!(s.thread(low).priority, 63, "low should inherit high's priority");

        lock.release(&mut s, low);
        assert_eq!(s.thread(low).priority, 31, "low's priority restored after release");

        lock.finish_acquire(&mut s, high);
        assert!(lock.is_held_by(&s, high));
    }

    #[test]
    #[should_panic(expected = "re-acquiring")]
    fn recursive_acquire_panics() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 31);
        let mut lock = Lock::new(&mut s);
        lock.acquire(&mut s, a);
        lock.acquire(&mut s, a);
    }
}
