//! The kernel instance: all global state, and the entry point that turns the
//! calling host thread into the initial kernel thread.

use crate::dev::{BlockDevice, Console};
use crate::mm::frame::FrameTable;
use crate::mm::malloc::Heap;
use crate::mm::palloc::{AllocFlags, Pools};
use crate::mm::swap::Swap;
use crate::mm::Ram;
use crate::process::UserProgram;
use crate::thread::scheduler::SchedState;
use crate::thread::{self, Tcb, ThreadState, PRI_DEFAULT};
use crossbeam_utils::sync::Parker;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

/// One kernel: scheduler, memory, devices, file system and program registry.
///
/// Constructed by [`KernelBuilder`]; every run gets a fresh instance, so
/// concurrent test runs do not interfere.
pub struct Kernel {
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) ram: Ram,
    pub(crate) pools: Pools,
    pub(crate) heap: Heap,
    pub(crate) frames: FrameTable,
    pub(crate) swap: Option<Swap>,
    pub(crate) console: Console,
    pub(crate) fs: Mutex<Option<Arc<dyn crate::fs::traits::FileSystem>>>,
    pub(crate) programs: BTreeMap<String, UserProgram>,
}

pub(crate) struct CpuLocal {
    pub kernel: Arc<Kernel>,
    pub tid: u64,
    pub parker: Parker,
    pub stack_page: crate::mm::Kva,
}

thread_local! {
    static CPU: RefCell<Option<CpuLocal>> = const { RefCell::new(None) };
}

/// The kernel the calling thread belongs to.
///
/// Panics when called from a thread that is not a kernel thread.
pub fn kernel() -> Arc<Kernel> {
    CPU.with(|c| {
        c.borrow()
            .as_ref()
            .expect("not running on a kernel thread")
            .kernel
            .clone()
    })
}

pub(crate) fn with_cpu<R>(f: impl FnOnce(&CpuLocal) -> R) -> R {
    CPU.with(|c| f(c.borrow().as_ref().expect("not running on a kernel thread")))
}

pub(crate) fn set_cpu(local: CpuLocal) {
    CPU.with(|c| {
        let mut b = c.borrow_mut();
        assert!(b.is_none(), "host thread already belongs to a kernel");
        *b = Some(local);
    });
}

pub(crate) fn clear_cpu() {
    CPU.with(|c| *c.borrow_mut() = None);
}

/// Parks the calling host thread until the scheduler hands it the CPU.
pub(crate) fn park_current() {
    CPU.with(|c| {
        c.borrow()
            .as_ref()
            .expect("not running on a kernel thread")
            .parker
            .park()
    });
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // Thread exits unwind with a `ThreadExit` payload; they are
            // control flow, not failures.
            if info.payload().downcast_ref::<thread::ThreadExit>().is_none() {
                previous(info);
            }
        }));
    });
}

impl Kernel {
    /// Creates a builder with default configuration.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    /// Runs `f` as the initial kernel thread of this instance.
    ///
    /// The calling host thread becomes the running thread; `f` may spawn
    /// further threads, mount a file system, and start user processes. When
    /// `f` returns, the mounted file system (if any) is shut down and the
    /// result is handed back. Keep a clone of the [`Arc`] to inspect the
    /// instance afterwards.
    pub fn run<R>(self: Arc<Self>, f: impl FnOnce() -> R) -> R {
        install_panic_hook();
        let stack_page = self
            .pools
            .alloc(&self.ram, AllocFlags::ZERO | AllocFlags::ASSERT)
            .unwrap();
        self.ram.write_u64(stack_page, thread::STACK_MAGIC);
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let tid = {
            let mut st = self.sched.lock().unwrap();
            let tid = st.alloc_tid();
            st.threads.insert(
                tid,
                Tcb::new(tid, "main", PRI_DEFAULT, unparker, stack_page),
            );
            st.threads.get_mut(&tid).unwrap().state = ThreadState::Running;
            st.current = tid;
            tid
        };
        set_cpu(CpuLocal {
            kernel: self.clone(),
            tid,
            parker,
            stack_page,
        });
        log::info!("kernel: boot (tid {tid})");
        let r = f();
        let fs = self.fs.lock().unwrap().take();
        if let Some(fs) = fs {
            fs.shutdown();
        }
        {
            let st = self.sched.lock().unwrap();
            if !st.ready.is_empty() {
                log::warn!("kernel: shutdown with {} runnable threads", st.ready.len());
            }
        }
        log::info!("kernel: shutdown");
        clear_cpu();
        r
    }

    /// Injects keystrokes as if typed on the console, from simulated
    /// external interrupts.
    pub fn feed_input(&self, bytes: &[u8]) {
        self.console.feed(self, bytes);
    }

    /// A copy of everything written to the console so far.
    pub fn console_output(&self) -> Vec<u8> {
        self.console.output()
    }

    /// Reads one byte of console input, waiting for a keystroke.
    pub fn console_getc(&self) -> u8 {
        self.console.getc()
    }

    pub(crate) fn user_program(&self, name: &str) -> Option<UserProgram> {
        self.programs.get(name).copied()
    }

    /// The frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The page pools.
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// The physical memory arena.
    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// The swap device, when configured.
    pub fn swap(&self) -> Option<&Swap> {
        self.swap.as_ref()
    }
}

/// Builder for a [`Kernel`] instance.
pub struct KernelBuilder {
    ram_pages: usize,
    user_pages: usize,
    mlfqs: bool,
    swap: Option<Arc<dyn BlockDevice>>,
    programs: BTreeMap<String, UserProgram>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self {
            ram_pages: 512,
            user_pages: 128,
            mlfqs: false,
            swap: None,
            programs: BTreeMap::new(),
        }
    }
}

impl KernelBuilder {
    /// Total pages of simulated physical memory.
    pub fn ram_pages(mut self, pages: usize) -> Self {
        self.ram_pages = pages;
        self
    }

    /// Pages reserved for the user pool. A small pool forces eviction.
    pub fn user_pages(mut self, pages: usize) -> Self {
        self.user_pages = pages;
        self
    }

    /// Selects the multi-level feedback queue scheduler instead of the
    /// default priority scheduler.
    pub fn mlfqs(mut self, enable: bool) -> Self {
        self.mlfqs = enable;
        self
    }

    /// Attaches the swap block device.
    pub fn swap_device(mut self, dev: Arc<dyn BlockDevice>) -> Self {
        self.swap = Some(dev);
        self
    }

    /// Registers a user program under `name`.
    pub fn program(mut self, name: &str, prog: UserProgram) -> Self {
        self.programs.insert(name.to_string(), prog);
        self
    }

    /// Builds the kernel instance.
    pub fn build(self) -> Arc<Kernel> {
        assert!(self.user_pages < self.ram_pages);
        Arc::new(Kernel {
            sched: Mutex::new(SchedState::new(self.mlfqs)),
            ram: Ram::new(self.ram_pages),
            pools: Pools::new(self.ram_pages, self.user_pages),
            heap: Heap::new(),
            frames: FrameTable::new(),
            swap: self.swap.map(Swap::new),
            console: Console::new(),
            fs: Mutex::new(None),
            programs: self.programs,
        })
    }
}
