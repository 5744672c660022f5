//! Frame table: owns every user-visible physical frame.
//!
//! Satisfies page faults by bringing contents in from zero fill, kernel
//! seed pages, files or swap; evicts with a clock policy when the user pool
//! runs dry; and shares read-only file frames across processes through a
//! cache keyed by inode and end offset.
//!
//! A single lock guards the clock list, the read-only cache and all frame
//! metadata. The lock is dropped across actual I/O; a per-frame in-progress
//! flag plus condition serializes loads, unloads and eviction of the same
//! frame across that window.

use super::page_dir::PageDir;
use super::page_info::{span_offset, span_size, Backing, PageInfo, WritableTo};
use super::palloc::AllocFlags;
use super::swap::SwapSlot;
use super::{Kva, Va};
use crate::fs::RegularFile;
use crate::kernel::kernel;
use crate::sync::{Condvar, Mutex, MutexGuard};
use crate::KernelError;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Frame {
    kva: Kva,
    /// Every page-info sharing this frame. Exactly one for writable
    /// frames; possibly many for read-only file frames.
    infos: Vec<Arc<PageInfo>>,
    /// Nonzero prevents eviction.
    lock_cnt: u32,
    /// Data is being read into or written out of this frame.
    io: bool,
    io_done: Arc<Condvar>,
}

struct FrameState {
    frames: Vec<Option<Frame>>,
    free_ids: Vec<usize>,
    /// Circular list of eviction candidates.
    clock: Vec<usize>,
    /// Index into `clock`: the next frame the clock hand examines.
    hand: usize,
    /// Read-only file frames, keyed by {inode, end offset}.
    ro_cache: BTreeMap<(u64, u32), usize>,
}

type Guard<'a> = MutexGuard<'a, FrameState>;

/// The global frame table.
pub struct FrameTable {
    state: Mutex<FrameState>,
}

impl FrameTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FrameState {
                frames: Vec::new(),
                free_ids: Vec::new(),
                clock: Vec::new(),
                hand: 0,
                ro_cache: BTreeMap::new(),
            }),
        }
    }

    /// Brings the page at `upage` into a frame and maps it. Fails if the
    /// page has no info or if `write` targets a read-only page.
    pub fn load(&self, pd: &Arc<PageDir>, upage: Va, write: bool) -> Result<(), KernelError> {
        self.load_inner(pd, upage, write, false)
    }

    /// Like [`load`], but additionally pins the frame so eviction cannot
    /// take it. Used while kernel code operates on user memory.
    ///
    /// [`load`]: FrameTable::load
    pub fn lock(&self, pd: &Arc<PageDir>, upage: Va, write: bool) -> Result<(), KernelError> {
        self.load_inner(pd, upage, write, true)
    }

    /// Unpins a frame pinned with [`lock`]. The frame stays loaded.
    ///
    /// [`lock`]: FrameTable::lock
    pub fn unlock(&self, pd: &Arc<PageDir>, upage: Va) {
        let Some(info) = pd.get_info(upage) else {
            return;
        };
        let mut st = self.state.lock();
        let fid = info.frame().expect("unlocking a page with no frame");
        let f = st.frames[fid].as_mut().unwrap();
        debug_assert!(f.lock_cnt > 0);
        f.lock_cnt -= 1;
        st.unlock();
    }

    fn load_inner(
        &self,
        pd: &Arc<PageDir>,
        upage: Va,
        write: bool,
        keep_locked: bool,
    ) -> Result<(), KernelError> {
        let k = kernel();
        debug_assert!(upage.is_user() && upage.page_offset() == 0);
        let info = pd.get_info(upage).ok_or(KernelError::BadAddress)?;
        if write && info.writable().is_empty() {
            return Err(KernelError::InvalidAccess);
        }
        let mut st = self.state.lock();
        st = Self::wait_info_io(st, &info);
        if let Some(fid) = info.frame() {
            if keep_locked {
                st.frames[fid].as_mut().unwrap().lock_cnt += 1;
            }
            st.unlock();
            return Ok(());
        }
        // A read-only file page may already be resident for someone else.
        if let Some(key) = info.ro_cache_key() {
            if let Some(&fid) = st.ro_cache.get(&key) {
                Self::map_page(&mut st, &info, fid, pd, upage);
                // If another process is still reading the frame in, wait
                // for it; pin so it cannot be evicted in between.
                st.frames[fid].as_mut().unwrap().lock_cnt += 1;
                st = Self::wait_frame_io(st, fid);
                let f = st.frames[fid].as_mut().unwrap();
                f.lock_cnt -= 1;
                if keep_locked {
                    f.lock_cnt += 1;
                }
                st.unlock();
                return Ok(());
            }
        }
        let (mut st, fid) = self.allocate_frame(st)?;
        Self::map_page(&mut st, &info, fid, pd, upage);
        let kva = st.frames[fid].as_ref().unwrap().kva;
        let (swap_slot, file_src) = {
            let inner = info.inner.lock().unwrap();
            let file = match &inner.backing {
                Backing::File { file, end_offset } => Some((file.clone(), *end_offset)),
                _ => None,
            };
            (inner.swap_slot, file)
        };
        if swap_slot.is_some() || file_src.is_some() {
            {
                let f = st.frames[fid].as_mut().unwrap();
                f.io = true;
                f.lock_cnt += 1;
            }
            if swap_slot.is_none() {
                if let Some(key) = info.ro_cache_key() {
                    // Publish the frame before reading so the next process
                    // waits for this read instead of starting its own.
                    st.ro_cache.insert(key, fid);
                }
            }
            let cv = st.frames[fid].as_ref().unwrap().io_done.clone();
            st.unlock();
            if let Some(slot) = swap_slot {
                k.swap
                    .as_ref()
                    .expect("swapped page without a swap device")
                    .read(&k.ram, slot, kva);
                info.inner.lock().unwrap().swap_slot = None;
            } else {
                let (file, end_offset) = file_src.unwrap();
                Self::read_file_span(&k.ram, &file, end_offset, kva);
            }
            let mut st = self.state.lock();
            {
                let f = st.frames[fid].as_mut().unwrap();
                f.lock_cnt -= 1;
                f.io = false;
                if keep_locked {
                    f.lock_cnt += 1;
                }
            }
            cv.broadcast();
            st.unlock();
            return Ok(());
        }
        {
            let mut inner = info.inner.lock().unwrap();
            if let Backing::KernelSeed(seed) = inner.backing {
                k.ram.copy_page(seed, kva);
                k.pools.free(seed);
                // The seed is consumed; from here on this is a zero page
                // whose live contents travel through swap.
                inner.backing = Backing::Zero;
            }
            // Zero pages need nothing: frames are handed out zeroed.
        }
        if keep_locked {
            st.frames[fid].as_mut().unwrap().lock_cnt += 1;
        }
        st.unlock();
        Ok(())
    }

    /// Removes the mapping and page-info of `upage`, writing back a dirty
    /// writable-to-file page and releasing the frame, swap slot and kernel
    /// seed page it no longer needs.
    pub fn unload(&self, pd: &Arc<PageDir>, upage: Va) {
        let k = kernel();
        let Some(info) = pd.get_info(upage) else {
            return;
        };
        let mut st = self.state.lock();
        // The frame could be mid-eviction; wait for that to finish.
        st = Self::wait_info_io(st, &info);
        if let Some(fid) = info.frame() {
            info.inner.lock().unwrap().frame = None;
            let shared = st.frames[fid].as_ref().unwrap().infos.len() > 1;
            if shared {
                st.frames[fid]
                    .as_mut()
                    .unwrap()
                    .infos
                    .retain(|i| !Arc::ptr_eq(i, &info));
                pd.clear_page(upage);
                st.unlock();
            } else {
                if let Some(key) = info.ro_cache_key() {
                    st.ro_cache.remove(&key);
                }
                let pos = st.clock.iter().position(|&f| f == fid).unwrap();
                st.clock.remove(pos);
                if st.hand > pos {
                    st.hand -= 1;
                }
                if st.hand >= st.clock.len() {
                    st.hand = 0;
                }
                let dirty = pd.is_dirty(upage);
                pd.clear_page(upage);
                let frame = st.frames[fid].take().unwrap();
                st.free_ids.push(fid);
                assert_eq!(frame.lock_cnt, 0, "unloading a pinned frame");
                st.unlock();
                let writeback = {
                    let inner = info.inner.lock().unwrap();
                    match &inner.backing {
                        Backing::File { file, end_offset }
                            if inner.writable.contains(WritableTo::FILE) && dirty =>
                        {
                            Some((file.clone(), *end_offset))
                        }
                        _ => None,
                    }
                };
                if let Some((file, end_offset)) = writeback {
                    Self::write_file_span(&k.ram, &file, end_offset, frame.kva);
                }
                k.pools.free(frame.kva);
            }
        } else {
            st.unlock();
        }
        {
            let mut inner = info.inner.lock().unwrap();
            if let Some(slot) = inner.swap_slot.take() {
                k.swap.as_ref().unwrap().release(slot);
            }
            if let Backing::KernelSeed(seed) = inner.backing {
                k.pools.free(seed);
                inner.backing = Backing::Zero;
            }
        }
        pd.set_info(upage, None);
    }

    fn map_page(st: &mut Guard<'_>, info: &Arc<PageInfo>, fid: usize, pd: &Arc<PageDir>, upage: Va) {
        info.inner.lock().unwrap().frame = Some(fid);
        let frame = st.frames[fid].as_mut().unwrap();
        frame.infos.push(info.clone());
        pd.set_page(upage, frame.kva, !info.writable().is_empty());
    }

    /// Waits until the frame backing `info` (if any) has no I/O in
    /// progress.
    fn wait_info_io<'a>(mut st: Guard<'a>, info: &Arc<PageInfo>) -> Guard<'a> {
        loop {
            let Some(fid) = info.frame() else { return st };
            let f = st.frames[fid].as_ref().unwrap();
            if !f.io {
                return st;
            }
            let cv = f.io_done.clone();
            st = cv.wait(st);
        }
    }

    fn wait_frame_io(mut st: Guard<'_>, fid: usize) -> Guard<'_> {
        loop {
            let f = st.frames[fid].as_ref().unwrap();
            if !f.io {
                return st;
            }
            let cv = f.io_done.clone();
            st = cv.wait(st);
        }
    }

    fn read_file_span(ram: &super::Ram, file: &RegularFile, end_offset: u32, kva: Kva) {
        let size = span_size(end_offset) as usize;
        let offset = span_offset(end_offset);
        let mut buf = vec![0u8; size];
        let read = file
            .read_at(&mut buf, offset)
            .expect("file read into frame failed");
        assert_eq!(read, size, "short read into frame");
        ram.write(kva, &buf);
    }

    fn write_file_span(ram: &super::Ram, file: &RegularFile, end_offset: u32, kva: Kva) {
        let size = span_size(end_offset) as usize;
        let offset = span_offset(end_offset);
        let mut buf = vec![0u8; size];
        ram.read(kva, &mut buf);
        let written = file
            .write_at(&buf, offset)
            .expect("file write-back from frame failed");
        assert_eq!(written, size, "short write-back from frame");
    }

    /// Hands out a frame: a fresh user-pool page, or the clock's victim.
    fn allocate_frame<'a>(&'a self, mut st: Guard<'a>) -> Result<(Guard<'a>, usize), KernelError> {
        let k = kernel();
        if let Some(kva) = k.pools.alloc(&k.ram, AllocFlags::USER | AllocFlags::ZERO) {
            let frame = Frame {
                kva,
                infos: Vec::new(),
                lock_cnt: 0,
                io: false,
                io_done: Arc::new(Condvar::new()),
            };
            let fid = match st.free_ids.pop() {
                Some(fid) => {
                    st.frames[fid] = Some(frame);
                    fid
                }
                None => {
                    st.frames.push(Some(frame));
                    st.frames.len() - 1
                }
            };
            if st.clock.is_empty() {
                st.clock.push(fid);
                st.hand = 0;
            } else {
                // New frames go in just behind the hand, so they are the
                // last the hand reaches.
                let hand = st.hand;
                st.clock.insert(hand, fid);
                st.hand += 1;
            }
            Ok((st, fid))
        } else {
            self.evict_frame(st)
        }
    }

    /// Clock algorithm: a frame is evictable when every sharer's accessed
    /// bit is clear and its pin count is zero; each probe clears accessed
    /// bits and advances. A fruitless full rotation falls back to the
    /// hand's frame if unpinned, and panics otherwise.
    fn frame_to_evict(st: &mut Guard<'_>) -> usize {
        assert!(!st.clock.is_empty(), "eviction with no candidate frames");
        let n = st.clock.len();
        let mut found = None;
        for _ in 0..n {
            let fid = st.clock[st.hand];
            let frame = st.frames[fid].as_ref().unwrap();
            let mut accessed = false;
            for info in &frame.infos {
                let inner = info.inner.lock().unwrap();
                if let Some(pd) = inner.pd.upgrade() {
                    accessed |= pd.is_accessed(inner.upage);
                    pd.set_accessed(inner.upage, false);
                }
            }
            let eligible = !accessed && frame.lock_cnt == 0;
            st.hand = (st.hand + 1) % n;
            if eligible {
                found = Some(fid);
                break;
            }
        }
        found.unwrap_or_else(|| {
            let fid = st.clock[st.hand];
            if st.frames[fid].as_ref().unwrap().lock_cnt > 0 {
                panic!("no frame available for eviction");
            }
            st.hand = (st.hand + 1) % st.clock.len();
            fid
        })
    }

    fn evict_frame<'a>(&'a self, mut st: Guard<'a>) -> Result<(Guard<'a>, usize), KernelError> {
        let k = kernel();
        let fid = Self::frame_to_evict(&mut st);
        let (infos, kva) = {
            let frame = st.frames[fid].as_ref().unwrap();
            (frame.infos.clone(), frame.kva)
        };
        log::debug!("frame: evict frame {fid}");
        // Unmap every sharer first so no process writes to the frame while
        // its contents are on the way out.
        let mut dirty = false;
        let mut writable = WritableTo::empty();
        for info in &infos {
            let inner = info.inner.lock().unwrap();
            if let Some(pd) = inner.pd.upgrade() {
                dirty |= pd.is_dirty(inner.upage);
                pd.clear_page(inner.upage);
            }
            writable |= inner.writable;
        }
        let mut swap_slot: Option<SwapSlot> = None;
        if dirty || writable.contains(WritableTo::SWAP) {
            assert!(!writable.is_empty(), "dirty read-only frame");
            {
                let f = st.frames[fid].as_mut().unwrap();
                f.io = true;
                f.lock_cnt += 1;
            }
            let cv = st.frames[fid].as_ref().unwrap().io_done.clone();
            let file_target = if writable.contains(WritableTo::FILE) {
                let inner = infos[0].inner.lock().unwrap();
                match &inner.backing {
                    Backing::File { file, end_offset } => Some((file.clone(), *end_offset)),
                    _ => unreachable!("writable-to-file page without file backing"),
                }
            } else {
                None
            };
            st.unlock();
            if let Some((file, end_offset)) = file_target {
                Self::write_file_span(&k.ram, &file, end_offset, kva);
            } else {
                swap_slot = Some(
                    k.swap
                        .as_ref()
                        .expect("eviction to swap without a swap device")
                        .write(&k.ram, kva),
                );
            }
            st = self.state.lock();
            let f = st.frames[fid].as_mut().unwrap();
            f.lock_cnt -= 1;
            f.io = false;
            cv.broadcast();
        } else if let Some(key) = infos[0].ro_cache_key() {
            st.ro_cache.remove(&key);
        }
        for info in &infos {
            let mut inner = info.inner.lock().unwrap();
            inner.frame = None;
            if inner.writable.contains(WritableTo::SWAP) {
                inner.swap_slot = swap_slot;
            }
        }
        st.frames[fid].as_mut().unwrap().infos.clear();
        k.ram.zero_page(kva);
        Ok((st, fid))
    }
}
