//! The free map: sector allocation state, stored as an ordinary file.
//!
//! Sector 0 holds the free-map inode; its bytes are a bitmap with one bit
//! per device sector, set when the sector is allocated. All reads and
//! writes go through the buffer cache like any other file, so concurrent
//! allocators serialize on the map lock and the cache's per-buffer locks.

use crate::inode::Inode;
use kore::sync::Mutex;
use std::sync::{Arc, OnceLock};

const CHUNK: usize = 512;

pub(crate) struct FreeMap {
    lock: Mutex<()>,
    inode: OnceLock<Arc<Inode>>,
}

impl FreeMap {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            inode: OnceLock::new(),
        }
    }

    /// Binds the free-map file. Called once at mount.
    pub fn init(&self, inode: Arc<Inode>) {
        self.inode
            .set(inode)
            .unwrap_or_else(|_| panic!("free map initialized twice"));
    }

    fn inode(&self) -> &Arc<Inode> {
        self.inode.get().expect("free map not initialized")
    }

    /// Allocates one sector, or `None` when the device is full.
    pub fn allocate(&self) -> Option<u32> {
        let guard = self.lock.lock();
        let inode = self.inode();
        let len = inode.length() as usize;
        let mut chunk = [0u8; CHUNK];
        let mut base = 0;
        while base < len {
            let n = inode
                .read_at(&mut chunk[..CHUNK.min(len - base)], base as u32)
                .expect("free map read failed");
            for i in 0..n {
                if chunk[i] != 0xFF {
                    let bit = (0..8).find(|b| chunk[i] & (1 << b) == 0).unwrap();
                    let byte = [chunk[i] | (1 << bit)];
                    inode
                        .write_at(&byte, (base + i) as u32)
                        .expect("free map write failed");
                    guard.unlock();
                    return Some(((base + i) * 8 + bit) as u32);
                }
            }
            base += n;
        }
        guard.unlock();
        None
    }

    /// Frees `sector`.
    pub fn release(&self, sector: u32) {
        let guard = self.lock.lock();
        let inode = self.inode();
        let mut byte = [0u8];
        let at = sector / 8;
        inode
            .read_at(&mut byte, at)
            .expect("free map read failed");
        assert!(
            byte[0] & (1 << (sector % 8)) != 0,
            "freeing unallocated sector {sector}"
        );
        byte[0] &= !(1 << (sector % 8));
        inode
            .write_at(&byte, at)
            .expect("free map write failed");
        guard.unlock();
    }

    /// Count of allocated sectors. Walks the whole map; test support.
    pub fn used(&self) -> usize {
        let guard = self.lock.lock();
        let inode = self.inode();
        let len = inode.length() as usize;
        let mut chunk = [0u8; CHUNK];
        let mut base = 0;
        let mut used = 0;
        while base < len {
            let n = inode
                .read_at(&mut chunk[..CHUNK.min(len - base)], base as u32)
                .expect("free map read failed");
            used += chunk[..n]
                .iter()
                .map(|b| b.count_ones() as usize)
                .sum::<usize>();
            base += n;
        }
        guard.unlock();
        used
    }
}
