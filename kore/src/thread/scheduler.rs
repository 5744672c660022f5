//! Thread scheduler: ready queue, sleep list, priority donation, and the
//! MLFQ variant.
//!
//! All scheduler state sits behind the kernel's single state lock; holding
//! it is the moral equivalent of running with interrupts disabled. Context
//! switching is cooperative at the host level: the switching thread selects
//! the next runnable thread, wakes its parker, and parks itself.

use super::{Tcb, ThreadState, PRI_MAX};
use crate::kernel::{self, Kernel};
use crate::sync::lock::LockShared;
use crate::util::Fixed;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, MutexGuard};

/// Ticks a thread may run before the timer marks it for preemption.
pub const TIME_SLICE: u64 = 4;
/// Maximum depth of a nested priority-donation chain walk.
pub const DONATION_DEPTH: usize = 8;

pub(crate) struct SleepEntry {
    pub tid: u64,
    /// Ticks remaining after the predecessor entry wakes.
    pub delta: u64,
}

/// Global scheduler state. One per kernel instance.
pub(crate) struct SchedState {
    /// Every live thread, keyed by tid.
    pub threads: BTreeMap<u64, Tcb>,
    /// Runnable threads, highest effective priority first, FIFO within a
    /// priority.
    pub ready: VecDeque<u64>,
    /// Sleeping threads ordered by wakeup time, delta-encoded so the head
    /// always holds the ticks to the nearest wakeup.
    pub sleepers: Vec<SleepEntry>,
    pub current: u64,
    pub in_interrupt: bool,
    pub yield_pending: bool,
    pub ticks: u64,
    pub slice_ticks: u64,
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub load_avg: Fixed,
    pub mlfqs: bool,
    next_tid: u64,
    /// Dying threads whose kernel stack page is freed by whichever thread
    /// next schedules.
    reap: Vec<(u64, crate::mm::Kva)>,
}

impl SchedState {
    pub fn new(mlfqs: bool) -> Self {
        Self {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            current: 0,
            in_interrupt: false,
            yield_pending: false,
            ticks: 0,
            slice_ticks: 0,
            idle_ticks: 0,
            kernel_ticks: 0,
            load_avg: Fixed::ZERO,
            mlfqs,
            next_tid: 1,
            reap: Vec::new(),
        }
    }

    pub fn alloc_tid(&mut self) -> u64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn current_running(&self) -> bool {
        self.threads
            .get(&self.current)
            .map(|t| t.state == ThreadState::Running)
            .unwrap_or(false)
    }

    fn current_priority(&self) -> i32 {
        self.threads
            .get(&self.current)
            .map(|t| t.effective_priority)
            .unwrap_or(-1)
    }
}

pub(crate) type Guard<'a> = MutexGuard<'a, SchedState>;

/// Enters the scheduler's atomic section.
pub(crate) fn lock(k: &Kernel) -> Guard<'_> {
    k.sched.lock().unwrap()
}

/// Inserts `tid` into the ready queue at its priority position, after any
/// thread of equal priority.
pub(crate) fn insert_ready(st: &mut SchedState, tid: u64) {
    let pri = st.threads[&tid].effective_priority;
    let pos = st
        .ready
        .iter()
        .position(|t| st.threads[t].effective_priority < pri)
        .unwrap_or(st.ready.len());
    st.ready.insert(pos, tid);
}

/// Re-sorts an already-ready thread after its priority changed.
pub(crate) fn resort_ready(st: &mut SchedState, tid: u64) {
    if let Some(pos) = st.ready.iter().position(|&t| t == tid) {
        st.ready.remove(pos);
        insert_ready(st, tid);
    }
}

/// Marks a blocked thread ready. Returns whether it now outranks the
/// running thread.
pub(crate) fn unblock(st: &mut SchedState, tid: u64) -> bool {
    let t = st.threads.get_mut(&tid).expect("unblock: unknown thread");
    debug_assert_eq!(t.state, ThreadState::Blocked);
    t.state = ThreadState::Ready;
    insert_ready(st, tid);
    st.threads[&tid].effective_priority > st.current_priority() && st.current_running()
}

/// Completes a wakeup: preempts the running thread if `preempt` is set,
/// deferring to interrupt return when inside an interrupt handler.
pub(crate) fn finish_preempt(k: &Kernel, mut st: Guard<'_>, preempt: bool) {
    if !preempt {
        return;
    }
    if st.in_interrupt {
        st.yield_pending = true;
        return;
    }
    drop(st);
    yield_now(k);
}

fn reap_dead(k: &Kernel, st: &mut SchedState) {
    for (tid, stack_page) in st.reap.drain(..) {
        log::debug!("scheduler: reap thread {tid}");
        k.pools.free(stack_page);
    }
}

/// Picks the next thread to run, advancing virtual time while the CPU would
/// otherwise idle with sleepers pending.
fn pick_next(k: &Kernel, st: &mut SchedState) -> u64 {
    loop {
        reap_dead(k, st);
        if let Some(t) = st.ready.pop_front() {
            return t;
        }
        if !st.sleepers.is_empty() {
            tick(st);
            continue;
        }
        panic!("scheduler: no runnable threads and no pending wakeups");
    }
}

/// Switches away from the current thread. The caller has already moved the
/// current thread to its next state (requeued, blocked on a waiter list, or
/// dying).
pub(crate) fn schedule(k: &Kernel, mut st: Guard<'_>) {
    debug_assert!(!st.in_interrupt, "context switch in interrupt context");
    let cur = st.current;
    let next = pick_next(k, &mut st);
    if next == cur {
        let t = st.threads.get_mut(&cur).unwrap();
        t.state = ThreadState::Running;
        st.slice_ticks = 0;
        return;
    }
    st.threads.get_mut(&next).unwrap().state = ThreadState::Running;
    st.current = next;
    st.slice_ticks = 0;
    let unparker = st.threads[&next].unparker.clone();
    let dying = st
        .threads
        .get(&cur)
        .map(|t| t.state == ThreadState::Dying)
        .unwrap_or(false);
    if dying {
        let t = st.threads.remove(&cur).unwrap();
        st.reap.push((cur, t.stack_page));
    }
    drop(st);
    unparker.unpark();
    if !dying {
        kernel::park_current();
    }
}

/// Blocks the current thread. The caller must have queued it somewhere a
/// wakeup will find it.
pub(crate) fn block_current(k: &Kernel, mut st: Guard<'_>) {
    assert!(!st.in_interrupt, "blocking in interrupt context");
    let cur = st.current;
    st.threads.get_mut(&cur).unwrap().state = ThreadState::Blocked;
    schedule(k, st);
}

/// Yields the CPU, keeping the current thread runnable.
pub fn yield_now(k: &Kernel) {
    let mut st = lock(k);
    assert!(!st.in_interrupt, "yield in interrupt context");
    if st.ready.is_empty() {
        return;
    }
    let cur = st.current;
    st.threads.get_mut(&cur).unwrap().state = ThreadState::Ready;
    insert_ready(&mut st, cur);
    schedule(k, st);
}

/// Puts the current thread to sleep for `ticks` timer ticks.
pub(crate) fn sleep_current(k: &Kernel, ticks: i64) {
    if ticks <= 0 {
        return;
    }
    let mut st = lock(k);
    assert!(!st.in_interrupt, "sleeping in interrupt context");
    let cur = st.current;
    insert_sleeper(&mut st, cur, ticks as u64);
    block_current(k, st);
}

fn insert_sleeper(st: &mut SchedState, tid: u64, mut ticks: u64) {
    let mut idx = 0;
    for e in st.sleepers.iter() {
        if ticks < e.delta {
            break;
        }
        ticks -= e.delta;
        idx += 1;
    }
    if let Some(e) = st.sleepers.get_mut(idx) {
        e.delta -= ticks;
    }
    st.sleepers.insert(idx, SleepEntry { tid, delta: ticks });
}

/// One virtual timer tick: statistics, sleep wakeups, MLFQ bookkeeping, and
/// time-slice accounting.
pub(crate) fn tick(st: &mut SchedState) {
    st.ticks += 1;
    let running = st.current_running();
    if running {
        st.kernel_ticks += 1;
    } else {
        st.idle_ticks += 1;
    }
    if st.mlfqs {
        if running {
            let cur = st.current;
            let t = st.threads.get_mut(&cur).unwrap();
            t.recent_cpu = t.recent_cpu + 1;
        }
        if st.ticks % crate::timer::TIMER_FREQ == 0 {
            mlfqs_second(st);
        }
        if st.ticks % 4 == 0 {
            mlfqs_recompute(st);
        }
    }
    if !st.sleepers.is_empty() {
        st.sleepers[0].delta -= 1;
        while st.sleepers.first().map(|e| e.delta == 0).unwrap_or(false) {
            let e = st.sleepers.remove(0);
            if unblock(st, e.tid) {
                st.yield_pending = true;
            }
        }
    }
    st.slice_ticks += 1;
    if running && st.slice_ticks >= TIME_SLICE && !st.ready.is_empty() {
        st.yield_pending = true;
    }
}

fn mlfqs_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    (Fixed::from_int(PRI_MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2))
        .round()
        .clamp(super::PRI_MIN, PRI_MAX)
}

/// Every four ticks: recompute every thread's priority from `recent_cpu`
/// and `nice`.
fn mlfqs_recompute(st: &mut SchedState) {
    let tids: Vec<u64> = st.threads.keys().copied().collect();
    for tid in tids {
        let t = st.threads.get_mut(&tid).unwrap();
        let p = mlfqs_priority(t.recent_cpu, t.nice);
        t.base_priority = p;
        t.effective_priority = p;
    }
    let mut order: Vec<u64> = st.ready.iter().copied().collect();
    order.sort_by_key(|t| core::cmp::Reverse(st.threads[t].effective_priority));
    st.ready = order.into();
    if let Some(head) = st.ready.front() {
        if st.current_running() && st.threads[head].effective_priority > st.current_priority() {
            st.yield_pending = true;
        }
    }
}

/// Once per second: decay `load_avg` and every thread's `recent_cpu`.
fn mlfqs_second(st: &mut SchedState) {
    let ready_cnt = st.ready.len() + usize::from(st.current_running());
    st.load_avg = Fixed::from_fraction(59, 60).mul(st.load_avg)
        + Fixed::from_fraction(1, 60).mul_int(ready_cnt as i32);
    let twice = st.load_avg.mul_int(2);
    let coef = twice.div(twice + 1);
    let tids: Vec<u64> = st.threads.keys().copied().collect();
    for tid in tids {
        let t = st.threads.get_mut(&tid).unwrap();
        t.recent_cpu = coef.mul(t.recent_cpu) + Fixed::from_int(t.nice);
    }
}

/// Walks the chain "holder → holder's waited lock → its holder → ..." up to
/// [`DONATION_DEPTH`], raising each visited holder's effective priority to
/// the waiter's where lower.
pub(crate) fn donate_chain(st: &mut SchedState, waiter: u64) {
    let pri = st.threads[&waiter].effective_priority;
    let mut lock: Option<Arc<LockShared>> = st.threads[&waiter].waiting_on.clone();
    for _ in 0..DONATION_DEPTH {
        let Some(l) = lock else { break };
        let Some(holder) = l.holder() else { break };
        let Some(t) = st.threads.get_mut(&holder) else {
            break;
        };
        if t.effective_priority < pri {
            t.effective_priority = pri;
            if t.state == ThreadState::Ready {
                resort_ready(st, holder);
            }
        }
        lock = st.threads[&holder].waiting_on.clone();
    }
}

/// Recomputes `tid`'s effective priority as the maximum over its base
/// priority and the priorities of every waiter on every lock it still
/// holds.
pub(crate) fn refresh_priority(st: &mut SchedState, tid: u64) {
    let held: Vec<Arc<LockShared>> = st.threads[&tid].held_locks.clone();
    let mut pri = st.threads[&tid].base_priority;
    for lock in held {
        for waiter in lock.waiters() {
            if let Some(w) = st.threads.get(&waiter) {
                pri = pri.max(w.effective_priority);
            }
        }
    }
    st.threads.get_mut(&tid).unwrap().effective_priority = pri;
}

/// Whether the ready queue's head outranks the running thread.
pub(crate) fn should_preempt(st: &SchedState) -> bool {
    st.ready
        .front()
        .map(|t| st.threads[t].effective_priority > st.current_priority())
        .unwrap_or(false)
}
