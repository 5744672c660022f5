//! Small-object allocator.
//!
//! Power-of-two size classes from 16 bytes up to 2048, each carving its
//! blocks out of single-page arenas obtained from the page allocator. An
//! arena's header carries a back-reference to its size class; free blocks
//! are threaded into a per-class singly linked free list through the block
//! bytes themselves. Requests too large for the biggest class get a whole
//! page of their own.
//!
//! Not thread-safe above the page allocator's guarantees beyond its own
//! state lock: callers own the blocks they are handed.

use super::palloc::AllocFlags;
use super::{Kva, PAGE_SIZE};
use crate::kernel::kernel;
use std::sync::Mutex as StdMutex;

const ARENA_MAGIC: u32 = 0x9a54_8eed;
const ARENA_HDR: usize = 16;
const CLASS_BIG: u32 = u32::MAX;
const NONE: u64 = u64::MAX;
const CLASS_CNT: usize = 8;

fn class_size(idx: usize) -> usize {
    16 << idx
}

fn slots_per_arena(idx: usize) -> u32 {
    ((PAGE_SIZE - ARENA_HDR) / class_size(idx)) as u32
}

struct ClassState {
    /// Head of the free list: address of a free block, threaded through
    /// the block bytes.
    free: u64,
}

/// Allocator state: one free list per size class.
pub struct Heap {
    classes: StdMutex<[ClassState; CLASS_CNT]>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            classes: StdMutex::new(core::array::from_fn(|_| ClassState { free: NONE })),
        }
    }
}

// Arena header accessors; the header lives in the first bytes of the page.

fn hdr_write(kva: Kva, magic: u32, class: u32, free_cnt: u32) {
    let k = kernel();
    let mut hdr = [0u8; ARENA_HDR];
    hdr[0..4].copy_from_slice(&magic.to_le_bytes());
    hdr[4..8].copy_from_slice(&class.to_le_bytes());
    hdr[8..12].copy_from_slice(&free_cnt.to_le_bytes());
    k.ram.write(kva, &hdr);
}

fn hdr_read(kva: Kva) -> (u32, u32) {
    let k = kernel();
    let mut hdr = [0u8; ARENA_HDR];
    k.ram.read(kva, &mut hdr);
    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    assert_eq!(magic, ARENA_MAGIC, "freeing a block outside any arena");
    (
        u32::from_le_bytes(hdr[4..8].try_into().unwrap()),
        u32::from_le_bytes(hdr[8..12].try_into().unwrap()),
    )
}

fn hdr_set_free_cnt(kva: Kva, free_cnt: u32) {
    let k = kernel();
    k.ram.write(kva + 8, &free_cnt.to_le_bytes());
}

/// Allocates a block of at least `size` bytes, or `None` when memory or
/// the size classes are exhausted.
pub fn alloc(size: usize) -> Option<Kva> {
    if size == 0 {
        return None;
    }
    let k = kernel();
    let Some(class) = (0..CLASS_CNT).find(|&i| class_size(i) >= size) else {
        // Too big for any class: hand out a whole page.
        if size > PAGE_SIZE - ARENA_HDR {
            return None;
        }
        let page = k.pools.alloc(&k.ram, AllocFlags::empty())?;
        hdr_write(page, ARENA_MAGIC, CLASS_BIG, 0);
        return Some(page + ARENA_HDR);
    };
    let mut classes = k.heap.classes.lock().unwrap();
    if classes[class].free == NONE {
        // Lazily create a new arena and thread its slots.
        let page = k.pools.alloc(&k.ram, AllocFlags::empty())?;
        let slots = slots_per_arena(class);
        hdr_write(page, ARENA_MAGIC, class as u32, slots);
        for i in 0..slots {
            let slot = page + ARENA_HDR + i as usize * class_size(class);
            let next = if i + 1 < slots {
                (slot + class_size(class)).into_usize() as u64
            } else {
                NONE
            };
            k.ram.write_u64(slot, next);
        }
        classes[class].free = (page + ARENA_HDR).into_usize() as u64;
    }
    let block = Kva::new(classes[class].free as usize);
    classes[class].free = k.ram.read_u64(block);
    let arena = block.page_down();
    let (_, free_cnt) = hdr_read(arena);
    hdr_set_free_cnt(arena, free_cnt - 1);
    Some(block)
}

/// Frees a block returned by [`alloc`].
pub fn free(block: Kva) {
    let k = kernel();
    let arena = block.page_down();
    let (class, free_cnt) = hdr_read(arena);
    if class == CLASS_BIG {
        k.pools.free(arena);
        return;
    }
    let class = class as usize;
    let mut classes = k.heap.classes.lock().unwrap();
    k.ram.write_u64(block, classes[class].free);
    classes[class].free = block.into_usize() as u64;
    let free_cnt = free_cnt + 1;
    hdr_set_free_cnt(arena, free_cnt);
    if free_cnt == slots_per_arena(class) {
        // Arena fully free: unthread its slots and return the page.
        let in_arena = |addr: u64| addr != NONE && Kva::new(addr as usize).page_down() == arena;
        while in_arena(classes[class].free) {
            classes[class].free = k.ram.read_u64(Kva::new(classes[class].free as usize));
        }
        let mut prev = classes[class].free;
        while prev != NONE {
            let next = k.ram.read_u64(Kva::new(prev as usize));
            if in_arena(next) {
                k.ram.write_u64(
                    Kva::new(prev as usize),
                    k.ram.read_u64(Kva::new(next as usize)),
                );
            } else {
                prev = next;
            }
        }
        k.pools.free(arena);
    }
}
