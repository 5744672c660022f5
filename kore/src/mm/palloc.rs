//! Page allocator.
//!
//! Physical memory is split into two pools: the kernel pool holds thread
//! stacks, allocator arenas and kernel-seed pages; the user pool holds the
//! frames that back user pages. Each pool keeps a free list and a high-water
//! "uninitialized" index; allocation drains the free list first and only
//! then extends into untouched memory, so a freshly booted kernel never
//! touches pages it has not handed out.

use super::{Kva, Ram, PAGE_SIZE};
use std::sync::Mutex;

bitflags::bitflags! {
    /// Flags controlling a page allocation.
    pub struct AllocFlags: u32 {
        /// Zero the page before returning it.
        const ZERO = 1;
        /// Allocate from the user pool instead of the kernel pool.
        const USER = 2;
        /// Panic instead of returning `None` on exhaustion.
        const ASSERT = 4;
    }
}

struct Pool {
    /// First page index owned by this pool.
    base: usize,
    /// One past the last page index.
    end: usize,
    /// Pages in `base..next_uninit` have been handed out at least once.
    next_uninit: usize,
    free: Vec<Kva>,
}

impl Pool {
    fn alloc(&mut self) -> Option<Kva> {
        if let Some(kva) = self.free.pop() {
            return Some(kva);
        }
        if self.next_uninit < self.end {
            let kva = Kva::new(self.next_uninit * PAGE_SIZE);
            self.next_uninit += 1;
            return Some(kva);
        }
        None
    }

    fn contains(&self, kva: Kva) -> bool {
        let page = kva.into_usize() / PAGE_SIZE;
        self.base <= page && page < self.end
    }
}

/// The two page pools.
pub struct Pools {
    kernel: Mutex<Pool>,
    user: Mutex<Pool>,
}

impl Pools {
    pub(crate) fn new(total_pages: usize, user_pages: usize) -> Self {
        assert!(user_pages < total_pages, "user pool must leave kernel pages");
        let split = total_pages - user_pages;
        Self {
            kernel: Mutex::new(Pool {
                base: 0,
                end: split,
                next_uninit: 0,
                free: Vec::new(),
            }),
            user: Mutex::new(Pool {
                base: split,
                end: total_pages,
                next_uninit: split,
                free: Vec::new(),
            }),
        }
    }

    /// Allocates one page.
    pub fn alloc(&self, ram: &Ram, flags: AllocFlags) -> Option<Kva> {
        let pool = if flags.contains(AllocFlags::USER) {
            &self.user
        } else {
            &self.kernel
        };
        let kva = pool.lock().unwrap().alloc();
        match kva {
            Some(kva) => {
                if flags.contains(AllocFlags::ZERO) {
                    ram.zero_page(kva);
                }
                Some(kva)
            }
            None if flags.contains(AllocFlags::ASSERT) => {
                panic!("palloc: out of pages (flags: {flags:?})")
            }
            None => None,
        }
    }

    /// Returns `page` to the pool that contains it.
    pub fn free(&self, kva: Kva) {
        assert!(kva.into_usize() % PAGE_SIZE == 0, "freeing unaligned page");
        let mut pool = self.kernel.lock().unwrap();
        if !pool.contains(kva) {
            drop(pool);
            pool = self.user.lock().unwrap();
            assert!(pool.contains(kva), "freeing a page outside both pools");
        }
        debug_assert!(!pool.free.contains(&kva), "double free of {kva:?}");
        pool.free.push(kva);
    }

    /// Number of pages in the user pool.
    pub fn user_pages(&self) -> usize {
        let p = self.user.lock().unwrap();
        p.end - p.base
    }
}
