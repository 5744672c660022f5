//! Semaphores, mutexes, condition variables and the interrupt queue.

use kore::sync::{Condvar, IntQueue, Mutex, Semaphore};
use kore::thread::{self, ThreadBuilder};
use kore::Kernel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::builder().build()
}

#[test]
fn semaphore_wakes_waiters_fifo() {
    boot().run(|| {
        let sem = Arc::new(Semaphore::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let (sem, order) = (sem.clone(), order.clone());
            handles.push(ThreadBuilder::new(&format!("waiter{i}")).spawn(move || {
                sem.down();
                let mut g = order.lock();
                g.push(i);
                g.unlock();
            }));
        }
        // Let all three enqueue on the semaphore.
        thread::yield_now();
        for _ in 0..3 {
            sem.up();
        }
        for h in handles {
            h.join();
        }
        let g = order.lock();
        assert_eq!(*g, vec![0, 1, 2]);
        g.unlock();
    });
}

#[test]
fn semaphore_try_down() {
    boot().run(|| {
        let sem = Semaphore::new(1);
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    });
}

#[test]
fn semaphore_ping_pong() {
    boot().run(|| {
        let ping = Arc::new(Semaphore::new(0));
        let pong = Arc::new(Semaphore::new(0));
        let (p, q) = (ping.clone(), pong.clone());
        let h = ThreadBuilder::new("pong").spawn(move || {
            for _ in 0..10 {
                p.down();
                q.up();
            }
        });
        for _ in 0..10 {
            ping.up();
            pong.down();
        }
        h.join();
    });
}

#[test]
fn mutex_serializes_increments() {
    boot().run(|| {
        const N: usize = 16;
        let data = Arc::new(Mutex::new(0usize));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..N {
            let (data, done) = (data.clone(), done.clone());
            ThreadBuilder::new("worker").spawn(move || {
                let mut g = data.lock();
                *g += 1;
                g.unlock();
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        while done.load(Ordering::SeqCst) != N {
            thread::yield_now();
        }
        let g = data.lock();
        assert_eq!(*g, N);
        g.unlock();
    });
}

#[test]
fn condvar_bounded_buffer() {
    boot().run(|| {
        struct Buffer {
            items: Mutex<Vec<u32>>,
            not_empty: Condvar,
            not_full: Condvar,
        }
        const CAP: usize = 2;
        let buf = Arc::new(Buffer {
            items: Mutex::new(Vec::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        });
        let consumer_buf = buf.clone();
        let got = Arc::new(Mutex::new(Vec::new()));
        let got2 = got.clone();
        let h = ThreadBuilder::new("consumer").spawn(move || {
            for _ in 0..20u32 {
                let mut g = consumer_buf.items.lock();
                while g.is_empty() {
                    g = consumer_buf.not_empty.wait(g);
                }
                let v = g.remove(0);
                consumer_buf.not_full.signal();
                g.unlock();
                let mut r = got2.lock();
                r.push(v);
                r.unlock();
            }
        });
        for i in 0..20u32 {
            let mut g = buf.items.lock();
            while g.len() == CAP {
                g = buf.not_full.wait(g);
            }
            g.push(i);
            buf.not_empty.signal();
            g.unlock();
        }
        h.join();
        let r = got.lock();
        assert_eq!(*r, (0..20).collect::<Vec<_>>());
        r.unlock();
    });
}

#[test]
fn condvar_broadcast_wakes_everyone() {
    boot().run(|| {
        struct Gate {
            open: Mutex<bool>,
            cond: Condvar,
        }
        let gate = Arc::new(Gate {
            open: Mutex::new(false),
            cond: Condvar::new(),
        });
        let woke = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let (gate, woke) = (gate.clone(), woke.clone());
            handles.push(ThreadBuilder::new("waiter").spawn(move || {
                let mut g = gate.open.lock();
                while !*g {
                    g = gate.cond.wait(g);
                }
                g.unlock();
                woke.fetch_add(1, Ordering::SeqCst);
            }));
        }
        thread::yield_now();
        let mut g = gate.open.lock();
        *g = true;
        gate.cond.broadcast();
        g.unlock();
        for h in handles {
            h.join();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 5);
    });
}

#[test]
fn intq_hands_bytes_to_blocked_reader() {
    boot().run(|| {
        let q = Arc::new(IntQueue::new());
        let q2 = q.clone();
        let h = ThreadBuilder::new("reader").spawn(move || {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(q2.getc());
            }
            assert_eq!(out, b"abc");
        });
        thread::yield_now();
        for b in b"abc" {
            q.putc(*b);
        }
        h.join();
    });
}

#[test]
fn console_input_arrives_via_interrupts() {
    let kernel = boot();
    let k = kernel.clone();
    kernel.run(move || {
        k.feed_input(b"hi");
        // Keystrokes queue up until someone reads them.
        let sink = Arc::new(Mutex::new(Vec::new()));
        let s = sink.clone();
        let k2 = k.clone();
        let h = ThreadBuilder::new("tty").spawn(move || {
            let mut g = s.lock();
            // Read through the console device the way fd 0 does.
            for _ in 0..3 {
                g.push(k2.console_getc());
            }
            g.unlock();
        });
        k.feed_input(b"!");
        h.join();
        let g = sink.lock();
        assert_eq!(*g, b"hi!".to_vec());
        g.unlock();
    });
}
