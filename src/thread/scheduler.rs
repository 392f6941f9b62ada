//! The scheduler: ready queue, sleep queue, priority donation bookkeeping,
//! and MLFQS recalculation.
//!
//! This `Scheduler` never actually suspends a call stack: there is no
//! context switch to perform one. Blocking operations instead return an
//! outcome describing what *would* happen to the caller (`Acquired`/
//! `Blocked` in [`crate::sync`]); resuming a blocked thread's logical
//! continuation is the embedding kernel's job, exposed here as the
//! explicit `finish_*` half of each two-phase operation.

use super::{LockId, Thread, ThreadStatus, Tid, PRI_MAX, PRI_MIN};
use crate::fixedpoint::Fixed17_14;
use std::collections::BTreeMap;

/// Ticks a thread may run before a same-or-lower-priority ready thread
/// preempts it under the round-robin (non-MLFQS) policy.
pub const TIME_SLICE: u32 = 4;
/// MLFQS priority is recalculated every `PRIORITY_RECALC_TICKS` ticks.
pub const PRIORITY_RECALC_TICKS: u64 = 4;
/// `load_avg`/`recent_cpu` are recalculated once per second.
pub const TICKS_PER_SECOND: u64 = 100;
/// Maximum hops walked when propagating a priority donation, bounding the
/// cost of a pathological donation chain.
pub const MAX_DONATION_DEPTH: u32 = 8;

/// The scheduler's view of who holds each outstanding lock, used purely to
/// walk donation chains (`Thread::wait_on_lock` -> holder -> ...) without
/// needing a reference to the owning [`crate::sync::Lock`] object.
type LockHolders = BTreeMap<LockId, Option<Tid>>;

/// The central scheduling engine: owns every [`Thread`] by id, the ready
/// queue, and the sleep set.
pub struct Scheduler {
    threads: BTreeMap<Tid, Thread>,
    ready: Vec<Tid>,
    sleeping: Vec<Tid>,
    current: Option<Tid>,
    next_tid: u64,
    next_lock_id: u64,
    lock_holders: LockHolders,
    ticks: u64,
    next_tick_to_wake: u64,
    mlfqs: bool,
    load_avg: Fixed17_14,
}

impl Scheduler {
    /// Creates an empty scheduler. `mlfqs` selects the multi-level feedback
    /// queue scheduler over plain priority scheduling with donation.
    pub fn new(mlfqs: bool) -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: Vec::new(),
            sleeping: Vec::new(),
            current: None,
            next_tid: 0,
            next_lock_id: 0,
            lock_holders: BTreeMap::new(),
            ticks: 0,
            next_tick_to_wake: u64::MAX,
            mlfqs,
            load_avg: Fixed17_14::ZERO,
        }
    }

    /// Spawns a new thread at `priority`, in the `Ready` state, and inserts
    /// it into the ready queue. Returns its [`Tid`].
    pub fn spawn(&mut self, name: impl Into<String>, priority: u8) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        let thread = Thread::new(tid, name, priority);
        self.threads.insert(tid, thread);
        self.push_ready(tid);
        tid
    }

    /// Reserves a fresh [`LockId`] and registers it as currently unheld.
    pub fn new_lock_id(&mut self) -> LockId {
        let id = LockId(self.next_lock_id);
        self.next_lock_id += 1;
        self.lock_holders.insert(id, None);
        id
    }

    /// Records the current holder of `lock` (or `None` when released).
    pub fn set_lock_holder(&mut self, lock: LockId, holder: Option<Tid>) {
        self.lock_holders.insert(lock, holder);
    }

    /// Returns the current holder of `lock`, if any.
    pub fn lock_holder(&self, lock: LockId) -> Option<Tid> {
        self.lock_holders.get(&lock).copied().flatten()
    }

    /// Immutable access to a thread by id.
    pub fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid).expect("unknown tid")
    }

    /// Mutable access to a thread by id.
    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("unknown tid")
    }

    /// The currently running thread, if one has been selected.
    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// Iterates every thread regardless of state. Used by the MLFQS
    /// recalculation, which must touch blocked and sleeping threads too,
    /// not just ready ones.
    pub fn for_each_thread(&self, mut f: impl FnMut(&Thread)) {
        for t in self.threads.values() {
            f(t);
        }
    }

    fn for_each_thread_mut(&mut self, mut f: impl FnMut(&mut Thread)) {
        for t in self.threads.values_mut() {
            f(t);
        }
    }

    /// Inserts `tid` into the ready queue, preserving priority order with
    /// FIFO among equal priorities.
    fn push_ready(&mut self, tid: Tid) {
        self.thread_mut(tid).status = ThreadStatus::Ready;
        let priority = self.thread(tid).priority;
        let pos = self
            .ready
            .partition_point(|&t| self.thread(t).priority >= priority);
        self.ready.insert(pos, tid);
    }

    /// Pops the highest-priority ready thread (FIFO among ties), marking it
    /// `Running` and the scheduler's `current`. Returns `None` if the ready
    /// queue is empty (the caller should run its idle thread).
    pub fn next_to_run(&mut self) -> Option<Tid> {
        let tid = self.ready.first().copied()?;
        self.ready.remove(0);
        self.thread_mut(tid).status = ThreadStatus::Running;
        self.thread_mut(tid).slice_used = 0;
        self.current = Some(tid);
        Some(tid)
    }

    /// Returns the priority of the head of the ready queue, or `None` if
    /// empty. Used by callers to decide whether the current thread should
    /// yield.
    fn ready_head_priority(&self) -> Option<u8> {
        self.ready.first().map(|&t| self.thread(t).priority)
    }

    /// Moves a `Running` thread back onto the ready queue (e.g. on a timer
    /// preemption or explicit yield).
    pub fn requeue_current(&mut self) {
        if let Some(tid) = self.current.take() {
            self.push_ready(tid);
        }
    }

    /// Blocks `tid`, removing it from scheduling consideration until a
    /// matching `unblock`. The thread must currently be `Running` (the
    /// caller) or already off the ready queue.
    pub fn block(&mut self, tid: Tid) {
        self.thread_mut(tid).status = ThreadStatus::Blocked;
        if self.current == Some(tid) {
            self.current = None;
        }
    }

    /// Moves a blocked thread back to `Ready`. Returns `true` if the
    /// unblocked thread now outranks the ready queue's head (and, by
    /// implication, the currently running thread), signaling that the
    /// caller should yield.
    pub fn unblock(&mut self, tid: Tid) -> bool {
        self.push_ready(tid);
        let p = self.thread(tid).priority;
        self.ready_head_priority() == Some(p)
            && self
                .current
                .map(|c| self.thread(c).priority < p)
                .unwrap_or(true)
    }

    /// Puts `tid` to sleep until `wake_at_tick`, mirroring
    /// `timer_sleep`/`thread_sleep`.
    pub fn sleep_until(&mut self, tid: Tid, wake_at_tick: u64) {
        self.thread_mut(tid).wakeup_tick = Some(wake_at_tick);
        self.block(tid);
        self.sleeping.push(tid);
        if wake_at_tick < self.next_tick_to_wake {
            self.next_tick_to_wake = wake_at_tick;
        }
    }

    /// Advances the clock by one tick, waking any due sleepers and running
    /// MLFQS recalculation. Returns `true` if the caller should yield the
    /// current thread (either because of round-robin expiry or because a
    /// just-woken thread now outranks it).
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        let mut should_yield = false;

        if self.ticks >= self.next_tick_to_wake {
            should_yield |= self.wake_due_sleepers();
        }

        if self.mlfqs {
            if let Some(cur) = self.current {
                self.thread_mut(cur).recent_cpu = self.thread(cur).recent_cpu.add_int(1);
            }
            if self.ticks % TICKS_PER_SECOND == 0 {
                self.recalculate_load_avg();
                self.recalculate_all_recent_cpu();
            }
            if self.ticks % PRIORITY_RECALC_TICKS == 0 {
                self.recalculate_all_mlfqs_priorities();
                log::trace!("mlfqs priorities recalculated at tick {}", self.ticks);
            }
            if let Some(cur) = self.current {
                if let Some(head) = self.ready_head_priority() {
                    if head > self.thread(cur).priority {
                        should_yield = true;
                    }
                }
            }
        } else if let Some(cur) = self.current {
            self.thread_mut(cur).slice_used += 1;
            if self.thread(cur).slice_used >= TIME_SLICE {
                if let Some(head) = self.ready_head_priority() {
                    if head >= self.thread(cur).priority {
                        should_yield = true;
                    }
                }
            }
        }

        should_yield
    }

    fn wake_due_sleepers(&mut self) -> bool {
        let ticks = self.ticks;
        let due: Vec<Tid> = self
            .sleeping
            .iter()
            .copied()
            .filter(|&t| self.thread(t).wakeup_tick.map(|w| w <= ticks).unwrap_or(false))
            .collect();
        self.sleeping.retain(|t| !due.contains(t));
        self.next_tick_to_wake = self
            .sleeping
            .iter()
            .filter_map(|&t| self.thread(t).wakeup_tick)
            .min()
            .unwrap_or(u64::MAX);

        let mut should_yield = false;
        for tid in due {
            self.thread_mut(tid).wakeup_tick = None;
            should_yield |= self.unblock(tid);
        }
        should_yield
    }

    /// Sets a thread's base priority directly (the non-MLFQS
    /// `thread_set_priority` syscall; a no-op under MLFQS).
    /// Returns `true` if the caller should yield.
    pub fn set_priority(&mut self, tid: Tid, new_priority: u8) -> bool {
        if self.mlfqs {
            return false;
        }
        let new_priority = new_priority.clamp(PRI_MIN, PRI_MAX);
        self.thread_mut(tid).init_priority = new_priority;
        self.recompute_effective_priority(tid);
        self.current == Some(tid)
            && self
                .ready_head_priority()
                .map(|h| h > self.thread(tid).priority)
                .unwrap_or(false)
    }

    /// Sets a thread's `nice` value (MLFQS only) and immediately
    /// recalculates its priority.
    pub fn set_nice(&mut self, tid: Tid, nice: i32) -> bool {
        self.thread_mut(tid).nice = nice.clamp(-20, 20);
        self.recalculate_mlfqs_priority(tid);
        self.current == Some(tid)
            && self
                .ready_head_priority()
                .map(|h| h > self.thread(tid).priority)
                .unwrap_or(false)
    }

    /// Registers that `waiter` has begun waiting on `lock`, updating the
    /// holder's donation list and propagating priority up the chain.
    pub fn begin_wait(&mut self, waiter: Tid, lock: LockId) {
        self.thread_mut(waiter).wait_on_lock = Some(lock);
        let holder = self.lock_holder(lock);
        if let Some(holder) = holder {
            if !self.thread(holder).donations.contains(&waiter) {
                self.thread_mut(holder).donations.push(waiter);
            }
            self.propagate_donation(holder);
        }
    }

    fn propagate_donation(&mut self, mut holder: Tid) {
        log::trace!("priority donation propagating from holder {:?}", holder);
        for _ in 0..MAX_DONATION_DEPTH {
            self.recompute_effective_priority(holder);
            match self.thread(holder).wait_on_lock {
                Some(lock) => match self.lock_holder(lock) {
                    Some(next) if next != holder => holder = next,
                    _ => break,
                },
                None => break,
            }
        }
    }

    /// Removes `waiter` from `holder`'s donation list (called on lock
    /// release) and refreshes `holder`'s effective priority.
    pub fn remove_donation(&mut self, holder: Tid, waiter: Tid) {
        self.thread_mut(holder).donations.retain(|&t| t != waiter);
        self.recompute_effective_priority(holder);
    }

    fn recompute_effective_priority(&mut self, tid: Tid) {
        if self.mlfqs {
            return;
        }
        let base = self.thread(tid).init_priority;
        let donated = self
            .thread(tid)
            .donations
            .iter()
            .map(|&d| self.thread(d).priority)
            .max()
            .unwrap_or(0);
        self.thread_mut(tid).priority = base.max(donated);
    }

    fn recalculate_load_avg(&mut self) {
        let ready_threads = self.ready.len()
            + self.current.map(|_| 1).unwrap_or(0);
        let fifty_nine_sixty = Fixed17_14::from_int(59).div_int(60);
        let one_sixty = Fixed17_14::from_int(1).div_int(60);
        self.load_avg = fifty_nine_sixty
            .mul(self.load_avg)
            .add(one_sixty.mul(Fixed17_14::from_int(ready_threads as i64)));
    }

    fn recalculate_all_recent_cpu(&mut self) {
        let load_avg = self.load_avg;
        let two_load = load_avg.mul_int(2);
        let coeff = two_load.div(two_load.add_int(1));
        self.for_each_thread_mut(|t| {
            t.recent_cpu = coeff.mul(t.recent_cpu).add_int(t.nice as i64);
        });
    }

    fn recalculate_all_mlfqs_priorities(&mut self) {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            self.recalculate_mlfqs_priority(tid);
        }
        self.ready.sort_by(|&a, &b| self.thread(b).priority.cmp(&self.thread(a).priority));
    }

    fn recalculate_mlfqs_priority(&mut self, tid: Tid) {
        if !self.mlfqs {
            return;
        }
        let t = self.thread(tid);
        let raw = Fixed17_14::from_int(PRI_MAX as i64)
            .sub(t.recent_cpu.div_int(4))
            .sub_int((t.nice * 2) as i64);
        let clamped = raw.round().clamp(PRI_MIN as i64, PRI_MAX as i64) as u8;
        self.thread_mut(tid).priority = clamped;
    }

    /// `load_avg`, scaled by 100 and rounded, for display/diagnostics.
    pub fn load_avg_percent(&self) -> i64 {
        self.load_avg.mul_int(100).round()
    }

    /// Transitions `tid` to `Dying` and removes it from the ready/running
    /// slot, mirroring `thread_exit`'s `status = THREAD_DYING` immediately
    /// before it calls `schedule()`. The thread's
    /// `Thread` record is kept around (its `exit_status` must remain
    /// readable by a waiting parent) until [`Scheduler::reap`].
    pub fn exit_thread(&mut self, tid: Tid) {
        self.thread_mut(tid).status = ThreadStatus::Dying;
        self.sleeping.retain(|&t| t != tid);
        self.ready.retain(|&t| t != tid);
        if self.current == Some(tid) {
            self.current = None;
        }
    }

    /// Frees a `Dying` thread's slot, mirroring `thread_schedule_tail`'s
    /// `palloc_free_page` of the previous thread once a successor has
    /// actually been scheduled. Never called on the initial thread by
    /// convention, nor on the thread currently running.
    pub fn reap(&mut self, tid: Tid) {
        debug_assert_eq!(self.thread(tid).status, ThreadStatus::Dying);
        debug_assert_ne!(self.current, Some(tid));
        self.threads.remove(&tid);
    }

    /// Current tick count.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queue_orders_by_priority_fifo_ties() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 10);
        let b = s.spawn("b", 20);
        let c = s.spawn("c", 10);
        assert_eq!(s.next_to_run(), Some(b));
        assert_eq!(s.next_to_run(), Some(a));
        assert_eq!(s.next_to_run(), Some(c));
    }

    #[test]
    fn sleep_wakes_at_correct_tick() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 31);
        s.next_to_run();
        s.sleep_until(a, 5);
        for _ in 0..4 {
            s.tick();
            assert_eq!(s.thread(a).status, ThreadStatus::Blocked);
        }
        s.tick();
        assert_eq!(s.thread(a).status, ThreadStatus::Ready);
    }

    #[test]
    fn round_robin_preempts_after_time_slice() {
        let mut s = Scheduler::new(false);
        let a = s.spawn("a", 31);
        let _b = s.spawn("b", 31);
        s.next_to_run();
        assert_eq!(s.current(), Some(a));
        let mut yielded = false;
        for _ in 0..TIME_SLICE {
            yielded = s.tick();
        }
        assert!(yielded);
    }

    #[test]
    fn donation_raises_and_restores_priority() {
        let mut s = Scheduler::new(false);
        let low = s.spawn("low", 10);
        let high = s.spawn("high", 40);
        let lock = s.new_lock_id();
        s.set_lock_holder(lock, Some(low));
        s.begin_wait(high, lock);
        assert_eq!(s.thread(low).priority, 40);
        s.remove_donation(low, high);
        assert_eq!(s.thread(low).priority, 10);
    }

    #[test]
    fn mlfqs_tick_yields_when_ready_head_outranks_current() {
        let mut s = Scheduler::new(true);
        let cur = s.spawn("cur", 30);
        assert_eq!(s.next_to_run(), Some(cur));
        let _peer = s.spawn("peer", 31);
        // Under MLFQS a higher-priority ready thread must still preempt the
        // running thread on a plain tick, not only when it is the tick that
        // just woke it from sleep.
        assert!(s.tick());
    }

    #[test]
    fn nested_donation_propagates_across_chain() {
        let mut s = Scheduler::new(false);
        let l1 = s.spawn("l1", 10);
        let l2 = s.spawn("l2", 20);
        let l3 = s.spawn("l3", 30);
        let lock_a = s.new_lock_id();
        let lock_b = s.new_lock_id();
        s.set_lock_holder(lock_a, Some(l1));
        s.set_lock_holder(lock_b, Some(l2));
        s.begin_wait(l2, lock_a);
        assert_eq!(s.thread(l1).priority, 20);
        s.begin_wait(l3, lock_b);
        assert_eq!(s.thread(l2).priority, 30);
        assert_eq!(s.thread(l1).priority, 30);
    }
}
