//! # tinyfs: a synchronous on-disk file system with a buffer cache.
//!
//! The on-disk format reserves sector 0 for the free-map inode and sector
//! 1 for the root directory inode. The free map is an ordinary file whose
//! bytes form a bitmap of sector usage; directories are ordinary files
//! holding 16-byte entries. All device traffic funnels through a 64-buffer
//! write-back cache with read-ahead.
//!
//! The crate plugs into the kernel through [`kore::fs::traits`]; mount it
//! inside `Kernel::run` and register the result with `kore::fs::register`.

pub mod cache;
pub mod dir;
pub mod file;
pub mod free_map;
pub mod inode;
pub mod path;

use crate::cache::BufferCache;
use crate::file::{DirHandle, FileHandle};
use crate::free_map::FreeMap;
use crate::inode::{layout, Inode, INODE_MAGIC, NDIRECT};
use kore::dev::{BlockDevice, Sector, SECTOR_SIZE};
use kore::fs::{self, traits};
use kore::KernelError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

pub(crate) struct FsInner {
    pub cache: Arc<BufferCache>,
    pub free_map: FreeMap,
    pub inodes: StdMutex<BTreeMap<u32, Weak<Inode>>>,
    pub root_sector: u32,
}

impl FsInner {
    /// Opens the inode at `sector`, returning the existing object if that
    /// sector is already open.
    pub fn open_inode(fs: &Arc<FsInner>, sector: u32) -> Result<Arc<Inode>, KernelError> {
        let mut reg = fs.inodes.lock().unwrap();
        if let Some(w) = reg.get(&sector) {
            if let Some(inode) = w.upgrade() {
                return Ok(inode);
            }
        }
        let inode = Inode::new(fs, sector);
        reg.insert(sector, Arc::downgrade(&inode));
        Ok(inode)
    }
}

/// A mounted file system.
pub struct TinyFs {
    inner: Arc<FsInner>,
}

impl TinyFs {
    /// Mounts the file system on `dev`, starting the cache's background
    /// threads. Must run on a kernel thread.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<TinyFs>, KernelError> {
        let sectors = dev.sector_count();
        let cache = BufferCache::new(dev);
        let inner = Arc::new(FsInner {
            cache,
            free_map: FreeMap::new(),
            inodes: StdMutex::new(BTreeMap::new()),
            root_sector: ROOT_DIR_SECTOR,
        });
        for sector in [FREE_MAP_SECTOR, ROOT_DIR_SECTOR] {
            let buf = inner.cache.acquire(Sector(sector), true);
            let magic = layout::magic(buf.bytes());
            inner.cache.release(buf, false);
            if magic != INODE_MAGIC {
                inner.cache.shutdown();
                return Err(KernelError::FilesystemCorrupted("bad inode magic"));
            }
        }
        let map_inode = FsInner::open_inode(&inner, FREE_MAP_SECTOR)?;
        inner.free_map.init(map_inode);
        log::info!("tinyfs: mounted, {sectors} sectors");
        Ok(Arc::new(TinyFs { inner }))
    }

    /// Writes an empty file system onto `dev`: free-map inode, root
    /// directory with `.` and `..`, and the bitmap marking all of it.
    pub fn format(dev: &dyn BlockDevice) {
        let nsectors = dev.sector_count() as usize;
        let bitmap_bytes = nsectors.div_ceil(8);
        let bitmap_sectors = bitmap_bytes.div_ceil(SECTOR_SIZE);
        assert!(bitmap_sectors <= NDIRECT, "device too large for the free map");
        let root_data = 2 + bitmap_sectors;
        assert!(nsectors > root_data + 1, "device too small to format");

        let mut sec = [0u8; SECTOR_SIZE];
        layout::set_length(&mut sec, bitmap_bytes as u32);
        layout::set_magic(&mut sec, INODE_MAGIC);
        layout::set_is_dir(&mut sec, false);
        for i in 0..bitmap_sectors {
            layout::set_slot(&mut sec, i, (2 + i) as u32);
        }
        dev.write(Sector(FREE_MAP_SECTOR), &sec)
            .expect("format: free-map inode write failed");

        let mut sec = [0u8; SECTOR_SIZE];
        layout::set_length(&mut sec, 2 * dir::ENTRY_SIZE as u32);
        layout::set_magic(&mut sec, INODE_MAGIC);
        layout::set_is_dir(&mut sec, true);
        layout::set_slot(&mut sec, 0, root_data as u32);
        dev.write(Sector(ROOT_DIR_SECTOR), &sec)
            .expect("format: root inode write failed");

        let mut sec = [0u8; SECTOR_SIZE];
        for (i, name) in [".", ".."].into_iter().enumerate() {
            let entry = dir::DirEntry {
                sector: ROOT_DIR_SECTOR,
                name: name.to_string(),
                in_use: true,
            };
            sec[i * dir::ENTRY_SIZE..(i + 1) * dir::ENTRY_SIZE].copy_from_slice(&entry.encode());
        }
        dev.write(Sector(root_data as u32), &sec)
            .expect("format: root data write failed");

        let mut bitmap = vec![0u8; bitmap_sectors * SECTOR_SIZE];
        let mut mark = |sector: usize| bitmap[sector / 8] |= 1 << (sector % 8);
        mark(FREE_MAP_SECTOR as usize);
        mark(ROOT_DIR_SECTOR as usize);
        for s in 2..root_data {
            mark(s);
        }
        mark(root_data);
        // Bits past the device end must never be handed out.
        for s in nsectors..bitmap_sectors * SECTOR_SIZE * 8 {
            mark(s);
        }
        for i in 0..bitmap_sectors {
            let chunk: &[u8; SECTOR_SIZE] = bitmap[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            dev.write(Sector((2 + i) as u32), chunk)
                .expect("format: bitmap write failed");
        }
    }

    /// Count of allocated sectors.
    pub fn used_sectors(&self) -> usize {
        self.inner.free_map.used()
    }

    /// Cache accesses and hits so far.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.inner.cache.stats()
    }

    fn cwd_inode(
        &self,
        cwd: Option<&fs::Directory>,
    ) -> Result<Option<Arc<Inode>>, KernelError> {
        cwd.map(|d| FsInner::open_inode(&self.inner, d.ino() as u32))
            .transpose()
    }

    fn wrap(&self, inode: Arc<Inode>) -> fs::File {
        if inode.is_dir() {
            fs::File::Directory(fs::Directory::new(DirHandle::new(inode)))
        } else {
            fs::File::Regular(fs::RegularFile::new(FileHandle::new(inode)))
        }
    }

    fn do_create(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        initial_size: u32,
        is_dir: bool,
    ) -> Result<(), KernelError> {
        if parent.removed() {
            return Err(KernelError::NoSuchEntry);
        }
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > dir::NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if dir::lookup(parent, name)?.is_some() {
            return Err(KernelError::FileExist);
        }
        let sector = self.inner.free_map.allocate().ok_or(KernelError::NoSpace)?;
        inode::create(&self.inner, sector, initial_size, is_dir);
        let result = (|| {
            if is_dir {
                let child = FsInner::open_inode(&self.inner, sector)?;
                let guard = child.lock.lock();
                let r = dir::add(&child, ".", sector)
                    .and_then(|_| dir::add(&child, "..", parent.sector()));
                guard.unlock();
                r?;
            }
            dir::add(parent, name, sector)
        })();
        if result.is_err() {
            // Unwind the allocation through the regular removal path.
            if let Ok(orphan) = FsInner::open_inode(&self.inner, sector) {
                orphan.remove();
            }
        }
        result
    }
}

impl traits::FileSystem for TinyFs {
    fn root(&self) -> Result<fs::Directory, KernelError> {
        Ok(fs::Directory::new(DirHandle::new(
            FsInner::open_inode(&self.inner, self.inner.root_sector)?,
        )))
    }

    fn open(&self, cwd: Option<&fs::Directory>, path: &str) -> Result<fs::File, KernelError> {
        let cwd = self.cwd_inode(cwd)?;
        let inode = path::resolve(&self.inner, cwd.as_ref(), path)?;
        Ok(self.wrap(inode))
    }

    fn create(
        &self,
        cwd: Option<&fs::Directory>,
        path: &str,
        initial_size: u32,
        is_dir: bool,
    ) -> Result<(), KernelError> {
        let cwd = self.cwd_inode(cwd)?;
        let (parent, name) = path::resolve_parent(&self.inner, cwd.as_ref(), path)?;
        let guard = parent.lock.lock();
        let r = self.do_create(&parent, &name, initial_size, is_dir);
        guard.unlock();
        r
    }

    fn remove(&self, cwd: Option<&fs::Directory>, path: &str) -> Result<(), KernelError> {
        let cwd = self.cwd_inode(cwd)?;
        let (parent, name) = path::resolve_parent(&self.inner, cwd.as_ref(), path)?;
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let guard = parent.lock.lock();
        let r = (|| {
            let (sector, _) = dir::lookup(&parent, &name)?.ok_or(KernelError::NoSuchEntry)?;
            let child = FsInner::open_inode(&self.inner, sector)?;
            if child.is_dir() {
                if sector == self.inner.root_sector {
                    return Err(KernelError::OperationNotPermitted);
                }
                let child_guard = child.lock.lock();
                let empty = dir::is_empty(&child);
                let r = match empty {
                    Ok(true) => {
                        dir::remove(&parent, &name)?;
                        child.remove();
                        Ok(())
                    }
                    Ok(false) => Err(KernelError::DirectoryNotEmpty),
                    Err(e) => Err(e),
                };
                child_guard.unlock();
                r
            } else {
                dir::remove(&parent, &name)?;
                child.remove();
                Ok(())
            }
        })();
        guard.unlock();
        r
    }

    fn shutdown(&self) {
        self.inner.cache.shutdown();
    }
}
