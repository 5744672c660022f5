//! Indexed inodes.
//!
//! An inode occupies exactly one sector: length, magic, a directory flag,
//! 124 direct sector numbers and one doubly-indirect sector number whose
//! tree of pointer sectors covers the rest of the 8 MiB maximum. Files are
//! sparse: a zero entry anywhere in the index means "not allocated yet",
//! and [`byte_to_sector`] materializes missing sectors (zeroed) on first
//! touch.
//!
//! To avoid deadlocking the buffer cache, no code path here ever holds two
//! buffers at once: translation reads a sector, releases it, allocates if
//! needed, reacquires, installs, releases.
//!
//! [`byte_to_sector`]: Inode::byte_to_sector

use crate::FsInner;
use kore::dev::{Sector, SECTOR_SIZE};
use kore::sync::Mutex;
use kore::KernelError;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

/// Identifies an inode sector.
pub const INODE_MAGIC: u16 = 0x494E;
/// Sector numbers stored directly in the inode.
pub const NDIRECT: usize = 124;
/// Sector numbers per pointer sector.
pub const NINDIRECT: usize = 128;
/// Bytes covered by the direct index.
pub const NDIRECT_BYTES: usize = NDIRECT * SECTOR_SIZE;
/// Largest representable file.
pub const MAX_FILE_SIZE: usize = (NDIRECT + NINDIRECT * NINDIRECT) * SECTOR_SIZE;

/// Field accessors for the on-disk inode record.
///
/// Layout: `length: u32` at 0, `magic: u16` at 4, `is_dir: u16` at 6, the
/// unified slot table (`direct[124]` then the doubly-indirect slot) at 8,
/// and 4 reserved bytes of padding at 508.
pub(crate) mod layout {
    use super::{NDIRECT, SECTOR_SIZE};

    pub fn length(b: &[u8; SECTOR_SIZE]) -> u32 {
        u32::from_le_bytes(b[0..4].try_into().unwrap())
    }

    pub fn set_length(b: &mut [u8; SECTOR_SIZE], v: u32) {
        b[0..4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn magic(b: &[u8; SECTOR_SIZE]) -> u16 {
        u16::from_le_bytes(b[4..6].try_into().unwrap())
    }

    pub fn set_magic(b: &mut [u8; SECTOR_SIZE], v: u16) {
        b[4..6].copy_from_slice(&v.to_le_bytes());
    }

    pub fn is_dir(b: &[u8; SECTOR_SIZE]) -> bool {
        u16::from_le_bytes(b[6..8].try_into().unwrap()) != 0
    }

    pub fn set_is_dir(b: &mut [u8; SECTOR_SIZE], v: bool) {
        b[6..8].copy_from_slice(&(v as u16).to_le_bytes());
    }

    /// Slots 0..124 are direct; slot 124 is the doubly-indirect sector.
    pub fn slot(b: &[u8; SECTOR_SIZE], idx: usize) -> u32 {
        debug_assert!(idx <= NDIRECT);
        let at = 8 + idx * 4;
        u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
    }

    pub fn set_slot(b: &mut [u8; SECTOR_SIZE], idx: usize, v: u32) {
        debug_assert!(idx <= NDIRECT);
        let at = 8 + idx * 4;
        b[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

fn ptr_at(b: &[u8; SECTOR_SIZE], idx: usize) -> u32 {
    u32::from_le_bytes(b[idx * 4..idx * 4 + 4].try_into().unwrap())
}

fn set_ptr_at(b: &mut [u8; SECTOR_SIZE], idx: usize, v: u32) {
    b[idx * 4..idx * 4 + 4].copy_from_slice(&v.to_le_bytes());
}

/// An open inode. At most one exists per sector; opening the same sector
/// again returns the same object.
pub struct Inode {
    fs: Weak<FsInner>,
    sector: u32,
    removed: AtomicBool,
    deny_write_cnt: AtomicI32,
    /// Serializes directory operations and index allocation.
    pub(crate) lock: Mutex<()>,
}

impl Inode {
    pub(crate) fn new(fs: &Arc<FsInner>, sector: u32) -> Arc<Self> {
        Arc::new(Self {
            fs: Arc::downgrade(fs),
            sector,
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicI32::new(0),
            lock: Mutex::new(()),
        })
    }

    fn fs(&self) -> Arc<FsInner> {
        self.fs.upgrade().expect("inode outlived its file system")
    }

    /// The sector holding this inode, which doubles as its inode number.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Current file length in bytes.
    pub fn length(&self) -> u32 {
        let fs = self.fs();
        let buf = fs.cache.acquire(Sector(self.sector), true);
        let len = layout::length(buf.bytes());
        fs.cache.release(buf, false);
        len
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        let fs = self.fs();
        let buf = fs.cache.acquire(Sector(self.sector), true);
        assert_eq!(
            layout::magic(buf.bytes()),
            INODE_MAGIC,
            "inode magic mismatch at sector {}",
            self.sector
        );
        let is_dir = layout::is_dir(buf.bytes());
        fs.cache.release(buf, false);
        is_dir
    }

    /// Marks the inode for deletion once the last opener closes it.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    /// Whether the inode has been removed.
    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "allow_write without deny_write");
    }

    pub(crate) fn write_denied(&self) -> bool {
        self.deny_write_cnt.load(Ordering::SeqCst) > 0
    }

    /// The data sector for byte offset `pos`, allocating any of the direct
    /// slot, the doubly-indirect sector, its leaf pointer sector, or the
    /// data sector itself that does not yet exist. Fresh sectors come back
    /// zeroed. `None` when the free map is exhausted.
    fn byte_to_sector(&self, is_dir: bool, pos: usize) -> Option<u32> {
        assert!(pos < MAX_FILE_SIZE);
        let fs = self.fs();
        let cache = &fs.cache;
        // Directories arrive already locked; files lock here so racing
        // writers do not both allocate the same index slot.
        let guard = (!is_dir).then(|| self.lock.lock());
        let slot_idx = (pos / SECTOR_SIZE).min(NDIRECT);
        let buf = cache.acquire(Sector(self.sector), true);
        let mut next = layout::slot(buf.bytes(), slot_idx);
        if next == 0 {
            cache.release(buf, false);
            let Some(ns) = fs.free_map.allocate() else {
                if let Some(g) = guard {
                    g.unlock();
                }
                return None;
            };
            let mut b = cache.acquire(Sector(self.sector), true);
            layout::set_slot(b.bytes_mut(), slot_idx, ns);
            cache.release(b, true);
            let mut b = cache.acquire(Sector(ns), slot_idx >= NDIRECT);
            b.bytes_mut().fill(0);
            cache.release(b, true);
            next = ns;
        } else {
            cache.release(buf, false);
        }
        if pos / SECTOR_SIZE < NDIRECT {
            if let Some(g) = guard {
                g.unlock();
            }
            return Some(next);
        }
        let rem = pos - NDIRECT_BYTES;
        let leaf_idx = rem / (NINDIRECT * SECTOR_SIZE);
        let data_idx = (rem / SECTOR_SIZE) % NINDIRECT;
        for (idx, target_is_meta) in [(leaf_idx, true), (data_idx, false)] {
            let here = next;
            let buf = cache.acquire(Sector(here), true);
            next = ptr_at(buf.bytes(), idx);
            if next == 0 {
                cache.release(buf, false);
                let Some(ns) = fs.free_map.allocate() else {
                    if let Some(g) = guard {
                        g.unlock();
                    }
                    return None;
                };
                let mut b = cache.acquire(Sector(here), true);
                set_ptr_at(b.bytes_mut(), idx, ns);
                cache.release(b, true);
                let mut b = cache.acquire(Sector(ns), target_is_meta);
                b.bytes_mut().fill(0);
                cache.release(b, true);
                next = ns;
            } else {
                cache.release(buf, false);
            }
        }
        if let Some(g) = guard {
            g.unlock();
        }
        Some(next)
    }

    /// Reads up to `buf.len()` bytes at `offset`. Stops at end of file;
    /// holes read as zeros.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs();
        let length = self.length() as usize;
        let is_dir = self.is_dir();
        let mut offset = offset as usize;
        if offset >= length {
            return Ok(0);
        }
        let mut bytes_read = 0;
        let mut size = buf.len();
        while size > 0 {
            let Some(sector) = self.byte_to_sector(is_dir, offset) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = length - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(inode_left.min(sector_left));
            if chunk == 0 {
                break;
            }
            let cached = fs.cache.acquire(Sector(sector), false);
            buf[bytes_read..bytes_read + chunk]
                .copy_from_slice(&cached.bytes()[sector_ofs..sector_ofs + chunk]);
            fs.cache.release(cached, false);
            size -= chunk;
            offset += chunk;
            bytes_read += chunk;
        }
        // Hint the next sector into the cache for sequential readers.
        let ahead = offset + SECTOR_SIZE - 1;
        if size == 0 && ahead < length {
            if let Some(sector) = self.byte_to_sector(is_dir, ahead) {
                fs.cache.read_ahead(Sector(sector), false);
            }
        }
        Ok(bytes_read)
    }

    /// Writes `buf` at `offset`, extending the file when the write ends
    /// past the current length. Writes reaching past the maximum file size
    /// come back short.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let fs = self.fs();
        let is_dir = self.is_dir();
        let mut offset = offset as usize;
        let mut bytes_written = 0;
        let mut size = buf.len();
        while size > 0 && offset < MAX_FILE_SIZE {
            let Some(sector) = self.byte_to_sector(is_dir, offset) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let file_left = MAX_FILE_SIZE - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(file_left.min(sector_left));
            if chunk == 0 {
                break;
            }
            let mut cached = fs.cache.acquire(Sector(sector), false);
            cached.bytes_mut()[sector_ofs..sector_ofs + chunk]
                .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
            fs.cache.release(cached, true);
            size -= chunk;
            offset += chunk;
            bytes_written += chunk;
        }
        let length = self.update_length(offset as u32);
        let ahead = offset + SECTOR_SIZE - 1;
        if size == 0 && ahead < length as usize {
            if let Some(sector) = self.byte_to_sector(is_dir, ahead) {
                fs.cache.read_ahead(Sector(sector), false);
            }
        }
        Ok(bytes_written)
    }

    /// Grows the recorded length to `end` if the file got longer; returns
    /// the current length either way.
    fn update_length(&self, end: u32) -> u32 {
        let fs = self.fs();
        let mut buf = fs.cache.acquire(Sector(self.sector), true);
        let length = layout::length(buf.bytes());
        if end > length {
            layout::set_length(buf.bytes_mut(), end);
            fs.cache.release(buf, true);
            end
        } else {
            fs.cache.release(buf, false);
            length
        }
    }

    /// Releases every sector the inode references, and the inode sector
    /// itself. Runs when a removed inode is closed for the last time;
    /// holds at most one buffer at a time, like the rest of this module.
    fn free_blocks(&self, fs: &Arc<FsInner>) {
        let cache = &fs.cache;
        let buf = cache.acquire(Sector(self.sector), true);
        let mut direct = [0u32; NDIRECT];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = layout::slot(buf.bytes(), i);
        }
        let top = layout::slot(buf.bytes(), NDIRECT);
        cache.release(buf, false);
        for s in direct {
            if s != 0 {
                fs.free_map.release(s);
            }
        }
        fs.free_map.release(self.sector);
        if top == 0 {
            return;
        }
        for i in 0..NINDIRECT {
            let b = cache.acquire(Sector(top), true);
            let leaf = ptr_at(b.bytes(), i);
            cache.release(b, false);
            if leaf == 0 {
                continue;
            }
            for j in 0..NINDIRECT {
                let b = cache.acquire(Sector(leaf), true);
                let s = ptr_at(b.bytes(), j);
                cache.release(b, false);
                if s != 0 {
                    fs.free_map.release(s);
                }
            }
            fs.free_map.release(leaf);
        }
        fs.free_map.release(top);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let Some(fs) = self.fs.upgrade() else {
            return;
        };
        {
            let mut reg = fs.inodes.lock().unwrap();
            if let Some(w) = reg.get(&self.sector) {
                if w.strong_count() == 0 {
                    reg.remove(&self.sector);
                }
            }
        }
        if self.removed.load(Ordering::SeqCst) {
            self.free_blocks(&fs);
        }
    }
}

/// Writes a fresh inode record for a file or directory of `length` bytes
/// into `sector`. No data sectors are allocated; the file starts sparse.
pub(crate) fn create(fs: &Arc<FsInner>, sector: u32, length: u32, is_dir: bool) {
    let mut buf = fs.cache.acquire(Sector(sector), true);
    let b = buf.bytes_mut();
    b.fill(0);
    layout::set_length(b, length);
    layout::set_magic(b, INODE_MAGIC);
    layout::set_is_dir(b, is_dir);
    fs.cache.release(buf, true);
}
