//! Virtual timer.
//!
//! Time is a tick counter. A tick happens when a test injects a timer
//! interrupt with [`interrupt`], or automatically while the CPU idles with
//! sleepers pending. [`TIMER_FREQ`] ticks make one virtual second.

use crate::kernel::kernel;
use crate::thread::scheduler;

/// Timer interrupts per virtual second.
pub const TIMER_FREQ: u64 = 100;

/// Ticks since boot.
pub fn ticks() -> u64 {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.ticks
}

/// Ticks elapsed since `then`.
pub fn elapsed(then: u64) -> u64 {
    ticks().wrapping_sub(then)
}

/// Suspends the current thread for at least `duration` ticks.
///
/// Non-positive durations return immediately without blocking. The
/// sleeping thread's descriptor lives in the scheduler's delta-ordered
/// sleep list and is removed before this returns.
pub fn sleep(duration: i64) {
    let k = kernel();
    scheduler::sleep_current(&k, duration);
}

/// Suspends the current thread for at least `ms` virtual milliseconds.
pub fn msleep(ms: u64) {
    sleep((ms * TIMER_FREQ).div_ceil(1000) as i64);
}

/// Injects one timer interrupt: statistics, sleep wakeups, scheduler
/// bookkeeping, and a deferred yield at "interrupt return" when the running
/// thread exhausted its slice or a recomputation outranked it.
pub fn interrupt() {
    let k = kernel();
    let mut st = scheduler::lock(&k);
    assert!(!st.in_interrupt, "timer interrupts do not nest");
    st.in_interrupt = true;
    scheduler::tick(&mut st);
    st.in_interrupt = false;
    let yield_pending = core::mem::take(&mut st.yield_pending);
    drop(st);
    if yield_pending {
        scheduler::yield_now(&k);
    }
}

/// Injects `n` timer interrupts.
pub fn advance(n: u64) {
    for _ in 0..n {
        interrupt();
    }
}
