//! Counting semaphore.

use crate::kernel::kernel;
use crate::thread::scheduler;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

struct SemInner {
    value: usize,
    waiters: VecDeque<u64>,
}

/// A counting semaphore.
///
/// `down` waits for the value to become positive and decrements it; `up`
/// increments it and wakes the longest-waiting thread. Waiters are released
/// in FIFO order.
pub struct Semaphore {
    inner: StdMutex<SemInner>,
}

impl Semaphore {
    /// Creates a semaphore with initial `value`.
    pub fn new(value: usize) -> Self {
        Self {
            inner: StdMutex::new(SemInner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Waits for the value to become positive, then decrements it.
    ///
    /// Must not be called from interrupt context.
    pub fn down(&self) {
        let k = kernel();
        loop {
            let mut st = scheduler::lock(&k);
            assert!(!st.in_interrupt, "semaphore down in interrupt context");
            let mut inner = self.inner.lock().unwrap();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            inner.waiters.push_back(st.current);
            drop(inner);
            scheduler::block_current(&k, st);
        }
    }

    /// Decrements the value if it is positive, without waiting.
    pub fn try_down(&self) -> bool {
        let k = kernel();
        let _st = scheduler::lock(&k);
        let mut inner = self.inner.lock().unwrap();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Wakes the longest waiter, if any, and increments the value.
    ///
    /// Safe to call from interrupt context; the wakeup's preemption is then
    /// deferred to interrupt return.
    pub fn up(&self) {
        let k = kernel();
        let mut st = scheduler::lock(&k);
        let mut inner = self.inner.lock().unwrap();
        let woken = inner.waiters.pop_front();
        inner.value += 1;
        drop(inner);
        let preempt = woken
            .map(|tid| scheduler::unblock(&mut st, tid))
            .unwrap_or(false);
        scheduler::finish_preempt(&k, st, preempt);
    }

    /// The current value.
    pub fn value(&self) -> usize {
        self.inner.lock().unwrap().value
    }
}
