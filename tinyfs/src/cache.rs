//! Buffer cache.
//!
//! A fixed array of 64 sector buffers in front of the file-system device.
//! One cache lock guards the metadata; per-buffer conditions serialize use
//! of a single buffer. Dirty buffers are written back when evicted, every
//! 100 virtual milliseconds by a background write-behind thread, and once
//! more at shutdown. A bounded queue feeds a background read-ahead thread;
//! requests that find the queue full are silently dropped.

use crossbeam_queue::ArrayQueue;
use kore::dev::{BlockDevice, Sector, SECTOR_SIZE};
use kore::sync::{Condvar, Mutex, MutexGuard, Semaphore};
use kore::thread::{JoinHandle, ThreadBuilder};
use kore::timer;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// Number of buffers in the cache.
pub const CACHE_SIZE: usize = 64;
/// Ticks between write-behind sweeps (100 ms at 100 Hz).
const WRITE_BACK_INTERVAL: u64 = 10;

bitflags::bitflags! {
    struct BufFlags: u8 {
        /// Handed out to a caller.
        const IN_USE = 0x1;
        /// Contents differ from the disk.
        const DIRTY = 0x2;
        /// Holds an inode or pointer sector; kept cached in preference to
        /// plain data.
        const META = 0x8;
    }
}

#[derive(Clone, Copy)]
struct BufMeta {
    sector: Option<Sector>,
    /// While a dirty buffer's old contents are being written out for
    /// reuse, the old sector number lives here so readers of it can wait.
    evicting: Option<Sector>,
    flags: BufFlags,
    waiting: u32,
}

struct BufferData {
    bytes: UnsafeCell<[u8; SECTOR_SIZE]>,
    /// Signalled when the buffer stops being in use.
    available: Condvar,
    /// Signalled when an eviction write-out finishes.
    evicted: Condvar,
}

// Buffer contents are only touched by the holder of IN_USE.
unsafe impl Sync for BufferData {}

struct CacheState {
    bufs: [BufMeta; CACHE_SIZE],
    /// Least-recently-used order; the front is the next reuse candidate.
    lru: VecDeque<usize>,
}

type Guard<'a> = MutexGuard<'a, CacheState>;

/// A sector buffer held by a caller. Obtained from
/// [`BufferCache::acquire`]; give it back with [`BufferCache::release`].
pub struct BufferRef<'a> {
    cache: &'a BufferCache,
    idx: usize,
}

impl BufferRef<'_> {
    /// The cached sector contents.
    pub fn bytes(&self) -> &[u8; SECTOR_SIZE] {
        unsafe { &*self.cache.data[self.idx].bytes.get() }
    }

    /// The cached sector contents, writable. Pass `dirty = true` to
    /// release afterwards.
    pub fn bytes_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        unsafe { &mut *self.cache.data[self.idx].bytes.get() }
    }
}

/// The sector cache in front of the file-system device.
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    state: Mutex<CacheState>,
    /// Signalled when any buffer becomes reusable.
    buffer_available: Condvar,
    data: Vec<BufferData>,
    ra_queue: ArrayQueue<(Sector, bool)>,
    ra_work: Semaphore,
    stop: AtomicBool,
    ra_done: Semaphore,
    accesses: AtomicU64,
    hits: AtomicU64,
    threads: StdMutex<Vec<JoinHandle>>,
}

impl BufferCache {
    /// Creates the cache and starts the read-ahead and write-behind
    /// threads. Must run on a kernel thread.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        let cache = Arc::new(Self {
            dev,
            state: Mutex::new(CacheState {
                bufs: [BufMeta {
                    sector: None,
                    evicting: None,
                    flags: BufFlags::empty(),
                    waiting: 0,
                }; CACHE_SIZE],
                lru: (0..CACHE_SIZE).collect(),
            }),
            buffer_available: Condvar::new(),
            data: (0..CACHE_SIZE)
                .map(|_| BufferData {
                    bytes: UnsafeCell::new([0; SECTOR_SIZE]),
                    available: Condvar::new(),
                    evicted: Condvar::new(),
                })
                .collect(),
            ra_queue: ArrayQueue::new(CACHE_SIZE),
            ra_work: Semaphore::new(0),
            stop: AtomicBool::new(false),
            ra_done: Semaphore::new(0),
            accesses: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            threads: StdMutex::new(Vec::new()),
        });
        let ra = cache.clone();
        let h1 = ThreadBuilder::new("read_ahead").spawn(move || ra.read_ahead_loop());
        let wb = cache.clone();
        let h2 = ThreadBuilder::new("write_behind").spawn(move || wb.write_behind_loop());
        cache.threads.lock().unwrap().extend([h1, h2]);
        cache
    }

    /// Acquires the buffer holding `sector` for reading and writing,
    /// loading it from disk if it is not cached. The buffer stays locked
    /// until released, so hold it as briefly as possible.
    pub fn acquire(&self, sector: Sector, is_meta: bool) -> BufferRef<'_> {
        let mut st = self.state.lock();
        self.accesses.fetch_add(1, Ordering::Relaxed);
        loop {
            match Self::choose(&st, sector) {
                None => st = self.buffer_available.wait(st),
                Some(idx) if st.bufs[idx].sector == Some(sector) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    st.bufs[idx].waiting += 1;
                    while st.bufs[idx].flags.contains(BufFlags::IN_USE) {
                        st = self.data[idx].available.wait(st);
                    }
                    st.bufs[idx].waiting -= 1;
                    st.bufs[idx].flags |= BufFlags::IN_USE;
                    if is_meta {
                        st.bufs[idx].flags |= BufFlags::META;
                    }
                    st.unlock();
                    return BufferRef { cache: self, idx };
                }
                Some(idx) if st.bufs[idx].evicting == Some(sector) => {
                    debug_assert!(st.bufs[idx].flags.contains(BufFlags::IN_USE));
                    while st.bufs[idx].evicting == Some(sector) {
                        st = self.data[idx].evicted.wait(st);
                    }
                }
                Some(idx) => {
                    self.load_buffer(st, sector, is_meta, idx);
                    return BufferRef { cache: self, idx };
                }
            }
        }
    }

    /// Releases a buffer, marking it dirty if it was written to. The
    /// buffer becomes reusable once nobody is waiting on it.
    pub fn release(&self, buf: BufferRef<'_>, dirty: bool) {
        let idx = buf.idx;
        let mut st = self.state.lock();
        debug_assert!(st.bufs[idx].flags.contains(BufFlags::IN_USE));
        st.bufs[idx].flags.remove(BufFlags::IN_USE);
        if dirty {
            st.bufs[idx].flags |= BufFlags::DIRTY;
        }
        if st.bufs[idx].waiting > 0 {
            self.data[idx].available.signal();
        } else {
            if let Some(pos) = st.lru.iter().position(|&i| i == idx) {
                st.lru.remove(pos);
            }
            st.lru.push_back(idx);
            self.buffer_available.signal();
        }
        st.unlock();
    }

    /// Queues `sector` for asynchronous prefetch. Does nothing when the
    /// queue is full.
    pub fn read_ahead(&self, sector: Sector, is_meta: bool) {
        if self.ra_queue.push((sector, is_meta)).is_ok() {
            self.ra_work.up();
        }
    }

    /// Writes every dirty buffer out. Can take a while; runs on the
    /// write-behind thread and at shutdown.
    pub fn flush_all(&self) {
        let mut st = self.state.lock();
        while let Some(idx) = Self::buffer_to_write_back(&st) {
            st.bufs[idx].waiting += 1;
            while st.bufs[idx].flags.contains(BufFlags::IN_USE) {
                st = self.data[idx].available.wait(st);
            }
            st.bufs[idx].waiting -= 1;
            st.bufs[idx].flags |= BufFlags::IN_USE;
            let sector = st.bufs[idx].sector.unwrap();
            st.unlock();
            self.dev
                .write(sector, unsafe { &*self.data[idx].bytes.get() })
                .expect("cache write-back failed");
            let mut st2 = self.state.lock();
            st2.bufs[idx].flags.remove(BufFlags::DIRTY);
            st2.unlock();
            self.release(BufferRef { cache: self, idx }, false);
            st = self.state.lock();
        }
        st.unlock();
    }

    /// Stops the background threads and flushes everything once more.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ra_work.up();
        self.ra_done.down();
        let threads: Vec<JoinHandle> = self.threads.lock().unwrap().drain(..).collect();
        for h in threads {
            h.join();
        }
        self.flush_all();
        log::info!(
            "cache accesses: {}, hits: {}",
            self.accesses.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed)
        );
    }

    /// Cache accesses and hits so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.accesses.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }

    /// Picks the buffer for `sector`: a buffer already holding it (or
    /// evicting it), else the least recently used idle buffer, preferring
    /// plain data over metadata so inode and pointer sectors stay cached
    /// longer. `None` when everything is busy.
    fn choose(st: &Guard<'_>, sector: Sector) -> Option<usize> {
        let mut meta_buffer = None;
        let mut data_buffer = None;
        for &idx in &st.lru {
            let m = &st.bufs[idx];
            if m.sector == Some(sector) || m.evicting == Some(sector) {
                return Some(idx);
            }
            if m.waiting == 0 && !m.flags.contains(BufFlags::IN_USE) {
                if m.flags.contains(BufFlags::META) {
                    if meta_buffer.is_none() {
                        meta_buffer = Some(idx);
                    }
                } else if data_buffer.is_none() {
                    data_buffer = Some(idx);
                }
            }
        }
        data_buffer.or(meta_buffer)
    }

    fn buffer_to_write_back(st: &Guard<'_>) -> Option<usize> {
        (0..CACHE_SIZE).find(|&idx| {
            st.bufs[idx].flags.contains(BufFlags::DIRTY) && st.bufs[idx].evicting.is_none()
        })
    }

    /// Loads `sector` into the chosen buffer, first writing out dirty old
    /// contents. The old sector stays visible as `evicting` while the
    /// write-out runs so its readers wait instead of reloading it
    /// elsewhere.
    fn load_buffer(&self, mut st: Guard<'_>, sector: Sector, is_meta: bool, idx: usize) {
        debug_assert!(!st.bufs[idx].flags.contains(BufFlags::IN_USE));
        st.bufs[idx].flags |= BufFlags::IN_USE;
        if is_meta {
            st.bufs[idx].flags |= BufFlags::META;
        } else {
            st.bufs[idx].flags.remove(BufFlags::META);
        }
        if st.bufs[idx].flags.contains(BufFlags::DIRTY) {
            let old = st.bufs[idx].sector;
            st.bufs[idx].evicting = old;
            st.bufs[idx].sector = Some(sector);
            st.unlock();
            self.dev
                .write(old.unwrap(), unsafe { &*self.data[idx].bytes.get() })
                .expect("cache eviction write failed");
            let mut st2 = self.state.lock();
            st2.bufs[idx].evicting = None;
            st2.bufs[idx].flags.remove(BufFlags::DIRTY);
            self.data[idx].evicted.broadcast();
            st2.unlock();
        } else {
            st.bufs[idx].sector = Some(sector);
            st.unlock();
        }
        self.dev
            .read(sector, unsafe { &mut *self.data[idx].bytes.get() })
            .expect("cache read failed");
    }

    fn read_ahead_loop(&self) {
        loop {
            self.ra_work.down();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let Some((sector, is_meta)) = self.ra_queue.pop() else {
                continue;
            };
            let st = self.state.lock();
            match Self::choose(&st, sector) {
                Some(idx)
                    if st.bufs[idx].sector != Some(sector)
                        && st.bufs[idx].evicting != Some(sector) =>
                {
                    self.load_buffer(st, sector, is_meta, idx);
                    self.release(BufferRef { cache: self, idx }, false);
                }
                // Already cached, or no idle buffer: prefetching is best
                // effort.
                _ => st.unlock(),
            }
        }
        self.ra_done.up();
    }

    fn write_behind_loop(&self) {
        loop {
            timer::sleep(WRITE_BACK_INTERVAL as i64);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.flush_all();
        }
    }
}
