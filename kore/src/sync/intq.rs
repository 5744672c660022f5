//! Interrupt-safe byte queue.
//!
//! A monitor that may be touched from kernel threads and from (simulated)
//! external-interrupt handlers. Waiting uses direct thread handoff: the
//! queue stores at most one waiting thread per end, so no real condition
//! variables are needed in interrupt context.

use crate::kernel::kernel;
use crate::thread::scheduler;
use std::sync::Mutex as StdMutex;

const INTQ_SIZE: usize = 64;

struct Inner {
    buf: [u8; INTQ_SIZE],
    head: usize,
    len: usize,
    /// Thread waiting for the queue to become non-empty.
    reader: Option<u64>,
    /// Thread waiting for the queue to become non-full.
    writer: Option<u64>,
}

impl Inner {
    fn pop(&mut self) -> u8 {
        debug_assert!(self.len > 0);
        let b = self.buf[self.head];
        self.head = (self.head + 1) % INTQ_SIZE;
        self.len -= 1;
        b
    }

    fn push(&mut self, b: u8) {
        debug_assert!(self.len < INTQ_SIZE);
        self.buf[(self.head + self.len) % INTQ_SIZE] = b;
        self.len += 1;
    }
}

/// A bounded byte queue shared between threads and interrupt handlers.
pub struct IntQueue {
    inner: StdMutex<Inner>,
}

impl Default for IntQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IntQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                buf: [0; INTQ_SIZE],
                head: 0,
                len: 0,
                reader: None,
                writer: None,
            }),
        }
    }

    /// Whether the queue is full.
    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().len == INTQ_SIZE
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().len == 0
    }

    /// Removes and returns the oldest byte, waiting while the queue is
    /// empty. Thread context only.
    pub fn getc(&self) -> u8 {
        let k = kernel();
        loop {
            let mut st = scheduler::lock(&k);
            assert!(!st.in_interrupt, "intq getc in interrupt context");
            let mut q = self.inner.lock().unwrap();
            if q.len == 0 {
                assert!(q.reader.is_none(), "two readers on one intq");
                q.reader = Some(st.current);
                drop(q);
                scheduler::block_current(&k, st);
                continue;
            }
            let b = q.pop();
            let writer = q.writer.take();
            drop(q);
            let preempt = writer
                .map(|tid| scheduler::unblock(&mut st, tid))
                .unwrap_or(false);
            scheduler::finish_preempt(&k, st, preempt);
            return b;
        }
    }

    /// Appends `byte`. From thread context this waits while the queue is
    /// full; an interrupt handler must check [`is_full`] first.
    ///
    /// [`is_full`]: IntQueue::is_full
    pub fn putc(&self, byte: u8) {
        let k = kernel();
        loop {
            let mut st = scheduler::lock(&k);
            let mut q = self.inner.lock().unwrap();
            if q.len == INTQ_SIZE {
                assert!(
                    !st.in_interrupt,
                    "interrupt handler wrote to a full intq without checking"
                );
                assert!(q.writer.is_none(), "two writers on one intq");
                q.writer = Some(st.current);
                drop(q);
                scheduler::block_current(&k, st);
                continue;
            }
            q.push(byte);
            let reader = q.reader.take();
            drop(q);
            let preempt = reader
                .map(|tid| scheduler::unblock(&mut st, tid))
                .unwrap_or(false);
            scheduler::finish_preempt(&k, st, preempt);
            return;
        }
    }
}
