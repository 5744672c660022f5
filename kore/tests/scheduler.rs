//! Scheduler behavior: alarms, priority scheduling, donation, MLFQ.

use kore::sync::Lock;
use kore::thread::{self, ThreadBuilder};
use kore::{timer, Kernel};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn boot() -> Arc<Kernel> {
    Kernel::builder().build()
}

#[test]
fn alarm_single_wakes_in_deadline_order() {
    boot().run(|| {
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (i, d) in [(0u32, 30i64), (1, 10), (2, 20)] {
            let order = order.clone();
            handles.push(ThreadBuilder::new(&format!("sleeper{i}")).spawn(move || {
                timer::sleep(d);
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
    });
}

#[test]
fn alarm_ties_wake_fifo() {
    boot().run(|| {
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let order = order.clone();
            handles.push(ThreadBuilder::new(&format!("tied{i}")).spawn(move || {
                timer::sleep(5);
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    });
}

#[test]
fn alarm_negative_and_zero_return_immediately() {
    boot().run(|| {
        let before = timer::ticks();
        timer::sleep(0);
        timer::sleep(-7);
        assert_eq!(timer::elapsed(before), 0);
    });
}

#[test]
fn sleep_accounts_elapsed_ticks() {
    boot().run(|| {
        let before = timer::ticks();
        let h = ThreadBuilder::new("sleeper").spawn(|| timer::sleep(25));
        h.join();
        assert!(timer::elapsed(before) >= 25);
    });
}

#[test]
fn higher_priority_thread_preempts_on_spawn() {
    boot().run(|| {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let h = ThreadBuilder::new("hi")
            .priority(40)
            .spawn(move || flag.store(true, Ordering::SeqCst));
        // The spawned thread outranks us, so it ran to completion before
        // spawn returned.
        assert!(ran.load(Ordering::SeqCst));
        h.join();
    });
}

#[test]
fn equal_priority_runs_fifo() {
    boot().run(|| {
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let order = order.clone();
            handles.push(ThreadBuilder::new(&format!("peer{i}")).spawn(move || {
                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    });
}

#[test]
fn lowering_priority_yields_to_ready_thread() {
    boot().run(|| {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let h = ThreadBuilder::new("mid")
            .priority(25)
            .spawn(move || flag.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        thread::set_priority(10);
        assert!(ran.load(Ordering::SeqCst));
        h.join();
        thread::set_priority(thread::PRI_DEFAULT);
    });
}

#[test]
fn donate_one() {
    boot().run(|| {
        assert_eq!(thread::get_priority(), 31);
        let lock = Arc::new(Lock::new());
        lock.acquire();
        let l = lock.clone();
        let a = ThreadBuilder::new("acquirer").priority(32).spawn(move || {
            l.acquire();
            l.release();
        });
        // "acquirer" blocked on the lock and donated to us.
        assert_eq!(thread::get_priority(), 32);
        lock.release();
        a.join();
        assert_eq!(thread::get_priority(), 31);
    });
}

#[test]
fn donate_multiple_locks() {
    boot().run(|| {
        let lock_a = Arc::new(Lock::new());
        let lock_b = Arc::new(Lock::new());
        lock_a.acquire();
        lock_b.acquire();
        let l = lock_a.clone();
        let a = ThreadBuilder::new("a").priority(32).spawn(move || {
            l.acquire();
            l.release();
        });
        assert_eq!(thread::get_priority(), 32);
        let l = lock_b.clone();
        let b = ThreadBuilder::new("b").priority(33).spawn(move || {
            l.acquire();
            l.release();
        });
        assert_eq!(thread::get_priority(), 33);
        lock_b.release();
        b.join();
        assert_eq!(thread::get_priority(), 32);
        lock_a.release();
        a.join();
        assert_eq!(thread::get_priority(), 31);
    });
}

#[test]
fn donate_nested_chain() {
    boot().run(|| {
        let lock_a = Arc::new(Lock::new());
        let lock_b = Arc::new(Lock::new());
        lock_a.acquire();
        let (la, lb) = (lock_a.clone(), lock_b.clone());
        let mid = ThreadBuilder::new("mid").priority(32).spawn(move || {
            lb.acquire();
            la.acquire();
            la.release();
            lb.release();
        });
        // mid holds B and waits on A, donating 32 to us.
        assert_eq!(thread::get_priority(), 32);
        let lb = lock_b.clone();
        let high = ThreadBuilder::new("high").priority(33).spawn(move || {
            lb.acquire();
            lb.release();
        });
        // high waits on B; the chain B -> mid -> A -> us raises us to 33.
        assert_eq!(thread::get_priority(), 33);
        lock_a.release();
        high.join();
        mid.join();
        assert_eq!(thread::get_priority(), 31);
    });
}

#[test]
fn timeslice_round_robins_equal_priority() {
    boot().run(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let h = ThreadBuilder::new("peer").spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Four timer interrupts exhaust our slice; the peer then runs.
        timer::advance(4);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        h.join();
    });
}

#[test]
fn mlfqs_recent_cpu_and_priority() {
    Kernel::builder().mlfqs(true).build().run(|| {
        timer::advance(4);
        assert_eq!(thread::recent_cpu_x100(), 400);
        // priority = 63 - recent_cpu/4 - 2*nice = 63 - 1 = 62.
        assert_eq!(thread::get_priority(), 62);
    });
}

#[test]
fn mlfqs_load_avg_counts_running_thread() {
    Kernel::builder().mlfqs(true).build().run(|| {
        assert_eq!(thread::load_avg_x100(), 0);
        timer::advance(100);
        // One runnable thread: load_avg = 1/60 after the first second.
        assert_eq!(thread::load_avg_x100(), 2);
    });
}

#[test]
fn mlfqs_nice_lowers_priority() {
    Kernel::builder().mlfqs(true).build().run(|| {
        thread::set_nice(10);
        assert_eq!(thread::get_nice(), 10);
        assert_eq!(thread::get_priority(), 63 - 20);
    });
}
