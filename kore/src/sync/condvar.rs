//! Condition variables, Mesa style.

use super::lock::{Mutex, MutexGuard};
use super::semaphore::Semaphore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

/// A condition variable.
///
/// Each waiter parks on its own one-shot semaphore, queued FIFO. Semantics
/// are Mesa: signalling is not atomic with delivery, so waiters re-check
/// their predicate after waking.
pub struct Condvar {
    waiters: StdMutex<VecDeque<Arc<Semaphore>>>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// Creates a condition variable.
    pub fn new() -> Self {
        Self {
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard`'s mutex and waits to be signalled, then
    /// reacquires the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let sem = Arc::new(Semaphore::new(0));
        self.waiters.lock().unwrap().push_back(sem.clone());
        let mutex: &'a Mutex<T> = guard.mutex();
        guard.unlock();
        sem.down();
        mutex.lock()
    }

    /// Wakes the longest waiter, if any. The caller must hold the mutex
    /// associated with this condition.
    pub fn signal(&self) {
        let woken = self.waiters.lock().unwrap().pop_front();
        if let Some(sem) = woken {
            sem.up();
        }
    }

    /// Wakes every waiter. The caller must hold the associated mutex.
    pub fn broadcast(&self) {
        loop {
            let woken = self.waiters.lock().unwrap().pop_front();
            match woken {
                Some(sem) => sem.up(),
                None => break,
            }
        }
    }
}
