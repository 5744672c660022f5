//! Locks with priority donation, and the typed mutex built on them.

use crate::kernel::kernel;
use crate::thread::scheduler;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

pub(crate) struct LockInner {
    pub holder: Option<u64>,
    pub waiters: VecDeque<u64>,
}

/// Lock state shared with the scheduler for donation walks: the donation
/// chain follows `waiting_on` references from thread to lock to holder.
pub(crate) struct LockShared {
    inner: StdMutex<LockInner>,
}

impl LockShared {
    pub fn holder(&self) -> Option<u64> {
        self.inner.lock().unwrap().holder
    }

    pub fn waiters(&self) -> Vec<u64> {
        self.inner.lock().unwrap().waiters.iter().copied().collect()
    }
}

/// A lock.
///
/// At most one thread holds a lock at a time, and only the holder may
/// release it. Blocking on a held lock donates the waiter's effective
/// priority along the chain of holders, up to a bounded nesting depth.
pub struct Lock {
    shared: Arc<LockShared>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Creates a free lock.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LockShared {
                inner: StdMutex::new(LockInner {
                    holder: None,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquires the lock, blocking until it is free.
    ///
    /// Must not be called from interrupt context, nor by the holder.
    pub fn acquire(&self) {
        let k = kernel();
        loop {
            let mut st = scheduler::lock(&k);
            assert!(!st.in_interrupt, "lock acquire in interrupt context");
            let me = st.current;
            let mut li = self.shared.inner.lock().unwrap();
            match li.holder {
                None => {
                    li.holder = Some(me);
                    drop(li);
                    let t = st.threads.get_mut(&me).unwrap();
                    t.waiting_on = None;
                    t.held_locks.push(self.shared.clone());
                    return;
                }
                Some(holder) => {
                    assert_ne!(holder, me, "recursive lock acquisition");
                    if !li.waiters.contains(&me) {
                        li.waiters.push_back(me);
                    }
                    drop(li);
                    st.threads.get_mut(&me).unwrap().waiting_on = Some(self.shared.clone());
                    scheduler::donate_chain(&mut st, me);
                    scheduler::block_current(&k, st);
                }
            }
        }
    }

    /// Acquires the lock without blocking. Returns whether it succeeded.
    pub fn try_acquire(&self) -> bool {
        let k = kernel();
        let mut st = scheduler::lock(&k);
        let me = st.current;
        let mut li = self.shared.inner.lock().unwrap();
        if li.holder.is_some() {
            return false;
        }
        li.holder = Some(me);
        drop(li);
        let t = st.threads.get_mut(&me).unwrap();
        t.held_locks.push(self.shared.clone());
        true
    }

    /// Releases the lock, recomputing the holder's effective priority from
    /// its remaining locks and yielding if it no longer outranks the ready
    /// queue.
    pub fn release(&self) {
        let k = kernel();
        let mut st = scheduler::lock(&k);
        let me = st.current;
        let mut li = self.shared.inner.lock().unwrap();
        assert_eq!(li.holder, Some(me), "releasing a lock not held");
        li.holder = None;
        let next = li.waiters.pop_front();
        drop(li);
        st.threads
            .get_mut(&me)
            .unwrap()
            .held_locks
            .retain(|l| !Arc::ptr_eq(l, &self.shared));
        scheduler::refresh_priority(&mut st, me);
        let mut preempt = next
            .map(|tid| scheduler::unblock(&mut st, tid))
            .unwrap_or(false);
        preempt |= scheduler::should_preempt(&st);
        scheduler::finish_preempt(&k, st, preempt);
    }

    /// Whether the current thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        let k = kernel();
        let st = scheduler::lock(&k);
        self.shared.holder() == Some(st.current)
    }
}

/// A mutual-exclusion wrapper around a value of type `T`.
///
/// Built on [`Lock`], so waiting donates priority. The data is reachable
/// only through the guard returned by [`lock`], and the guard must be
/// discharged with an explicit [`MutexGuard::unlock`]: dropping an
/// undischarged guard panics.
///
/// [`lock`]: Mutex::lock
pub struct Mutex<T> {
    raw: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a mutex protecting `t`.
    pub fn new(t: T) -> Self {
        Self {
            raw: Lock::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.acquire();
        MutexGuard { mutex: self }
    }

    /// Acquires the mutex without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Whether the current thread holds the mutex.
    pub fn held_by_current(&self) -> bool {
        self.raw.held_by_current()
    }
}

/// A scoped guard for [`Mutex`]. Must be released with [`unlock`]; a
/// guard dropped without it panics.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Releases the mutex.
    pub fn unlock(self) {
        self.mutex.raw.release();
        core::mem::forget(self);
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> core::ops::Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> core::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // The guard is dying to an unwind (a kill or a failed
            // assertion); release quietly rather than aborting on a
            // second panic.
            self.mutex.raw.release();
        } else {
            panic!("`.unlock()` must be explicitly called for MutexGuard.");
        }
    }
}
