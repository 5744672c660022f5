//! Kernel threads.
//!
//! A thread is an abstraction of the CPU. Each thread owns a kernel stack
//! page whose first word holds a magic value; the magic is checked on every
//! [`current_tid`] call to catch stack clobbering. Threads are created with
//! [`ThreadBuilder`] and end either by returning from their entry function
//! or through [`exit_current`]; the dying thread's stack page is freed by
//! whichever thread next schedules.

pub mod scheduler;

use crate::kernel::{self, kernel, CpuLocal, Kernel};
use crate::mm::palloc::AllocFlags;
use crate::mm::Kva;
use crate::process::Process;
use crate::sync::{Condvar, Mutex};
use crate::sync::lock::LockShared;
use crate::util::Fixed;
use crossbeam_utils::sync::{Parker, Unparker};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Lowest thread priority.
pub const PRI_MIN: i32 = 0;
/// Default thread priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest thread priority.
pub const PRI_MAX: i32 = 63;

/// Magic value at the base of every kernel stack page.
pub(crate) const STACK_MAGIC: u64 = 0xdead_beef_cafe_babe;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Running on the CPU.
    Running,
    /// Runnable, waiting in the ready queue.
    Ready,
    /// Blocked on a semaphore, lock, condition or sleep.
    Blocked,
    /// Finished; waiting to be reaped by the scheduler.
    Dying,
}

/// Panic payload that carries a thread's exit status through unwinding.
pub(crate) struct ThreadExit(pub i32);

pub(crate) struct ExitSt {
    pub status: Option<i32>,
    pub waited: bool,
}

/// A thread's exit status, shared between the thread, its joiners, and its
/// parent. Outlives the thread control block.
pub(crate) struct ExitRecord {
    pub state: Mutex<ExitSt>,
    pub cond: Condvar,
}

impl ExitRecord {
    fn new() -> Self {
        Self {
            state: Mutex::new(ExitSt {
                status: None,
                waited: false,
            }),
            cond: Condvar::new(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct ChildRec {
    pub tid: u64,
    pub exit: Arc<ExitRecord>,
}

/// A thread control block.
pub(crate) struct Tcb {
    pub tid: u64,
    pub name: String,
    pub state: ThreadState,
    pub base_priority: i32,
    pub effective_priority: i32,
    pub nice: i32,
    pub recent_cpu: Fixed,
    pub unparker: Unparker,
    pub stack_page: Kva,
    pub held_locks: Vec<Arc<LockShared>>,
    pub waiting_on: Option<Arc<LockShared>>,
    pub exit: Arc<ExitRecord>,
    pub parent: Option<u64>,
    pub children: Vec<ChildRec>,
    pub process: Option<Arc<Process>>,
}

impl Tcb {
    pub fn new(tid: u64, name: &str, priority: i32, unparker: Unparker, stack_page: Kva) -> Self {
        Self {
            tid,
            name: name.to_string(),
            state: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            unparker,
            stack_page,
            held_locks: Vec::new(),
            waiting_on: None,
            exit: Arc::new(ExitRecord::new()),
            parent: None,
            children: Vec::new(),
            process: None,
        }
    }
}

/// The current thread's id. Also verifies the stack magic.
pub fn current_tid() -> u64 {
    kernel::with_cpu(|c| {
        assert_eq!(
            c.kernel.ram.read_u64(c.stack_page),
            STACK_MAGIC,
            "kernel stack overflow detected"
        );
        c.tid
    })
}

/// The current thread's name.
pub fn current_name() -> String {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads[&st.current].name.clone()
}

/// The state of thread `tid`, if it is still alive.
pub fn state_of(tid: u64) -> Option<ThreadState> {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads.get(&tid).map(|t| t.state)
}

/// Yields the CPU to the highest-priority ready thread, if any.
pub fn yield_now() {
    let k = kernel();
    scheduler::yield_now(&k);
}

/// Exits the current thread with `status`.
///
/// Unwinds to the thread trampoline, which performs process teardown (if
/// the thread runs a user process) and signals joiners.
pub fn exit_current(status: i32) -> ! {
    std::panic::panic_any(ThreadExit(status));
}

/// Sets the current thread's base priority, recomputing the effective
/// priority against any active donation, and yields if the thread no longer
/// outranks the ready queue. Ignored under the MLFQ scheduler.
pub fn set_priority(priority: i32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let k = kernel();
    let mut st = scheduler::lock(&k);
    if st.mlfqs {
        return;
    }
    let cur = st.current;
    st.threads.get_mut(&cur).unwrap().base_priority = priority;
    scheduler::refresh_priority(&mut st, cur);
    let preempt = scheduler::should_preempt(&st);
    scheduler::finish_preempt(&k, st, preempt);
}

/// The current thread's effective priority.
pub fn get_priority() -> i32 {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads[&st.current].effective_priority
}

/// The effective priority of thread `tid`, if alive.
pub fn priority_of(tid: u64) -> Option<i32> {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads.get(&tid).map(|t| t.effective_priority)
}

/// Sets the current thread's nice value (MLFQ), recomputing its priority.
pub fn set_nice(nice: i32) {
    let nice = nice.clamp(-20, 20);
    let k = kernel();
    let mut st = scheduler::lock(&k);
    let cur = st.current;
    let t = st.threads.get_mut(&cur).unwrap();
    t.nice = nice;
    if st.mlfqs {
        // Recomputed in place so the change is visible before the next
        // four-tick sweep.
        let t = st.threads.get_mut(&cur).unwrap();
        let p = (Fixed::from_int(PRI_MAX) - t.recent_cpu.div_int(4) - Fixed::from_int(nice * 2))
            .round()
            .clamp(PRI_MIN, PRI_MAX);
        t.base_priority = p;
        t.effective_priority = p;
        let preempt = scheduler::should_preempt(&st);
        scheduler::finish_preempt(&k, st, preempt);
    }
}

/// The current thread's nice value.
pub fn get_nice() -> i32 {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads[&st.current].nice
}

/// 100 times the system load average, rounded to the nearest integer.
pub fn load_avg_x100() -> i32 {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.load_avg.mul_int(100).round()
}

/// 100 times the current thread's `recent_cpu`, rounded to nearest.
pub fn recent_cpu_x100() -> i32 {
    let k = kernel();
    let st = scheduler::lock(&k);
    st.threads[&st.current].recent_cpu.mul_int(100).round()
}

/// A handle that can be joined to collect a thread's exit status.
pub struct JoinHandle {
    /// Thread id of the thread this handle refers to.
    pub tid: u64,
    exit: Arc<ExitRecord>,
}

impl JoinHandle {
    /// Blocks until the thread exits and returns its status.
    pub fn join(self) -> i32 {
        let mut g = self.exit.state.lock();
        while g.status.is_none() {
            g = self.exit.cond.wait(g);
        }
        let status = g.status.unwrap();
        g.unlock();
        status
    }
}

/// A builder for new kernel threads.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    process: Option<Arc<Process>>,
}

impl ThreadBuilder {
    /// Creates a builder for a thread named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: PRI_DEFAULT,
            process: None,
        }
    }

    /// Sets the initial priority.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        self.priority = priority;
        self
    }

    /// Attaches a user process to the thread.
    pub(crate) fn process(mut self, process: Arc<Process>) -> Self {
        self.process = Some(process);
        self
    }

    /// Spawns the thread. It becomes runnable immediately and preempts the
    /// caller if it has higher priority.
    pub fn spawn<F>(self, f: F) -> JoinHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let k = kernel();
        let stack_page = k
            .pools
            .alloc(&k.ram, AllocFlags::ZERO | AllocFlags::ASSERT)
            .unwrap();
        k.ram.write_u64(stack_page, STACK_MAGIC);
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let (tid, exit, preempt) = {
            let mut st = scheduler::lock(&k);
            let tid = st.alloc_tid();
            let parent = st.current;
            let mut tcb = Tcb::new(tid, &self.name, self.priority, unparker, stack_page);
            if st.mlfqs {
                let p = &st.threads[&parent];
                tcb.nice = p.nice;
                tcb.recent_cpu = p.recent_cpu;
            }
            tcb.parent = Some(parent);
            tcb.process = self.process.clone();
            let exit = tcb.exit.clone();
            st.threads.insert(tid, tcb);
            st.threads.get_mut(&parent).unwrap().children.push(ChildRec {
                tid,
                exit: exit.clone(),
            });
            scheduler::insert_ready(&mut st, tid);
            let preempt = self.priority > st.threads[&parent].effective_priority;
            (tid, exit, preempt)
        };
        let kernel_for_child = k.clone();
        let name = self.name.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                kernel::set_cpu(CpuLocal {
                    kernel: kernel_for_child.clone(),
                    tid,
                    parker,
                    stack_page,
                });
                kernel::park_current();
                let status = match std::panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(()) => 0,
                    Err(payload) => match payload.downcast::<ThreadExit>() {
                        Ok(e) => e.0,
                        Err(_) => {
                            // A genuine panic; the hook already printed it.
                            log::error!("kernel thread {tid} panicked");
                            -1
                        }
                    },
                };
                crate::process::on_thread_exit(&kernel_for_child, status);
                finish_thread(&kernel_for_child, status);
                kernel::clear_cpu();
            })
            .expect("spawning host thread failed");
        if preempt {
            scheduler::yield_now(&k);
        }
        JoinHandle { tid, exit }
    }
}

/// Records the exit status, wakes joiners and the waiting parent, then
/// gives up the CPU for good.
fn finish_thread(k: &Arc<Kernel>, status: i32) {
    let exit = {
        let st = scheduler::lock(k);
        st.threads[&st.current].exit.clone()
    };
    let mut g = exit.state.lock();
    g.status = Some(status);
    exit.cond.broadcast();
    g.unlock();
    let mut st = scheduler::lock(k);
    let cur = st.current;
    st.threads.get_mut(&cur).unwrap().state = ThreadState::Dying;
    scheduler::schedule(k, st);
}

pub(crate) fn current_child(k: &Kernel, tid: u64) -> Option<ChildRec> {
    let st = scheduler::lock(k);
    st.threads[&st.current]
        .children
        .iter()
        .find(|c| c.tid == tid)
        .cloned()
}

pub(crate) fn current_process(k: &Kernel) -> Option<Arc<Process>> {
    let st = scheduler::lock(k);
    st.threads[&st.current].process.clone()
}
