//! Synchronization primitives.
//!
//! Everything here is written in terms of a single atomic section (the
//! scheduler's state lock, standing in for interrupt disable on the one
//! CPU) plus the scheduler's block/unblock hooks: semaphores, locks with
//! priority donation, Mesa condition variables, and an interrupt-safe byte
//! queue.

pub mod condvar;
pub mod intq;
pub mod lock;
pub mod semaphore;

pub use condvar::Condvar;
pub use intq::IntQueue;
pub use lock::{Lock, Mutex, MutexGuard};
pub use semaphore::Semaphore;
