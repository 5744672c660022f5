//! Per-page backing-store descriptors.
//!
//! Every user page carries a [`PageInfo`] describing how to bring its
//! contents in and out: zero-filled, seeded from a kernel page built at
//! load time, or backed by a span of a file. The descriptor also tracks
//! where a writable page goes on eviction and whether it currently sits in
//! swap.

use super::page_dir::PageDir;
use super::swap::SwapSlot;
use super::{Kva, Va, PAGE_SIZE};
use crate::fs::RegularFile;
use std::sync::{Arc, Mutex as StdMutex, Weak};

bitflags::bitflags! {
    /// Where a writable page's contents go when its frame is reclaimed.
    /// Empty means the page is read-only.
    pub struct WritableTo: u8 {
        /// Written back to the backing file.
        const FILE = 1;
        /// Written to the swap device.
        const SWAP = 2;
    }
}

/// What backs a page before it is first loaded.
#[derive(Clone)]
pub enum Backing {
    /// A page of zeros.
    Zero,
    /// A kernel page holding pre-built contents; consumed by the first
    /// load, after which the page becomes [`Backing::Zero`].
    KernelSeed(Kva),
    /// A span of a file ending at `end_offset`; the span starts at
    /// `end_offset` rounded down to a page boundary.
    File {
        /// Backing file handle.
        file: RegularFile,
        /// File offset one past the last mapped byte.
        end_offset: u32,
    },
}

pub(crate) struct PageInfoInner {
    pub backing: Backing,
    pub writable: WritableTo,
    pub pd: Weak<PageDir>,
    pub upage: Va,
    /// Set while the page's contents live in swap.
    pub swap_slot: Option<SwapSlot>,
    /// The frame currently backing the page, if resident.
    pub frame: Option<usize>,
}

/// Metadata for one user virtual page.
///
/// Fields are mutated only under the frame table's lock; the descriptor is
/// shared between the page directory's side slot and the backing frame's
/// sharer list.
pub struct PageInfo {
    pub(crate) inner: StdMutex<PageInfoInner>,
}

impl PageInfo {
    fn new(pd: &Arc<PageDir>, upage: Va, backing: Backing, writable: WritableTo) -> Arc<Self> {
        debug_assert_eq!(upage.page_offset(), 0);
        Arc::new(Self {
            inner: StdMutex::new(PageInfoInner {
                backing,
                writable,
                pd: Arc::downgrade(pd),
                upage,
                swap_slot: None,
                frame: None,
            }),
        })
    }

    /// A zero page.
    pub fn zero(pd: &Arc<PageDir>, upage: Va, writable: WritableTo) -> Arc<Self> {
        Self::new(pd, upage, Backing::Zero, writable)
    }

    /// A page seeded from kernel page `kva`.
    pub fn kernel_seed(pd: &Arc<PageDir>, upage: Va, kva: Kva, writable: WritableTo) -> Arc<Self> {
        Self::new(pd, upage, Backing::KernelSeed(kva), writable)
    }

    /// A file-backed page ending at `end_offset`.
    pub fn file(
        pd: &Arc<PageDir>,
        upage: Va,
        file: RegularFile,
        end_offset: u32,
        writable: WritableTo,
    ) -> Arc<Self> {
        Self::new(
            pd,
            upage,
            Backing::File { file, end_offset },
            writable,
        )
    }

    /// The page's writable-to flags.
    pub fn writable(&self) -> WritableTo {
        self.inner.lock().unwrap().writable
    }

    pub(crate) fn frame(&self) -> Option<usize> {
        self.inner.lock().unwrap().frame
    }

    /// The read-only file cache key, when this page is a read-only file
    /// page.
    pub(crate) fn ro_cache_key(&self) -> Option<(u64, u32)> {
        let inner = self.inner.lock().unwrap();
        match (&inner.backing, inner.writable.is_empty()) {
            (Backing::File { file, end_offset }, true) => Some((file.ino(), *end_offset)),
            _ => None,
        }
    }
}

/// File offset of the first byte of the span ending at `end_offset`.
pub(crate) fn span_offset(end_offset: u32) -> u32 {
    if end_offset > 0 {
        (end_offset - 1) & !(PAGE_SIZE as u32 - 1)
    } else {
        0
    }
}

/// Length of the span ending at `end_offset`.
pub(crate) fn span_size(end_offset: u32) -> u32 {
    end_offset - span_offset(end_offset)
}
