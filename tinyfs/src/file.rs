//! Open-file and open-directory handles.

use crate::dir;
use crate::inode::Inode;
use kore::fs::{self, traits};
use kore::KernelError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// An open regular file: an inode, a position, and this handle's
/// deny-write state.
pub struct FileHandle {
    inode: Arc<Inode>,
    pos: StdMutex<u32>,
    denies: AtomicBool,
}

impl FileHandle {
    pub(crate) fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: StdMutex::new(0),
            denies: AtomicBool::new(false),
        }
    }
}

impl traits::RegularFile for FileHandle {
    fn ino(&self) -> u64 {
        self.inode.sector() as u64
    }

    fn length(&self) -> u32 {
        self.inode.length()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let pos = *self.pos.lock().unwrap();
        let n = self.inode.read_at(buf, pos)?;
        *self.pos.lock().unwrap() = pos + n as u32;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if self.inode.write_denied() {
            return Ok(0);
        }
        let pos = *self.pos.lock().unwrap();
        let n = self.inode.write_at(buf, pos)?;
        *self.pos.lock().unwrap() = pos + n as u32;
        Ok(n)
    }

    fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, KernelError> {
        self.inode.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, KernelError> {
        self.inode.write_at(buf, offset)
    }

    fn seek(&self, pos: u32) {
        *self.pos.lock().unwrap() = pos;
    }

    fn tell(&self) -> u32 {
        *self.pos.lock().unwrap()
    }

    fn deny_write(&self) {
        if !self.denies.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    fn allow_write(&self) {
        if self.denies.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }

    fn reopen(&self) -> Result<fs::RegularFile, KernelError> {
        Ok(fs::RegularFile::new(FileHandle::new(self.inode.clone())))
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.denies.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }
}

/// An open directory with a listing cursor.
pub struct DirHandle {
    inode: Arc<Inode>,
    pos: StdMutex<u32>,
}

impl DirHandle {
    pub(crate) fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: StdMutex::new(0),
        }
    }
}

impl traits::Directory for DirHandle {
    fn ino(&self) -> u64 {
        self.inode.sector() as u64
    }

    fn readdir(&self) -> Result<Option<String>, KernelError> {
        loop {
            let ofs = *self.pos.lock().unwrap();
            let Some(e) = dir::read_entry(&self.inode, ofs)? else {
                return Ok(None);
            };
            *self.pos.lock().unwrap() = ofs + dir::ENTRY_SIZE as u32;
            if e.in_use && e.name != "." && e.name != ".." {
                return Ok(Some(e.name));
            }
        }
    }

    fn reopen(&self) -> Result<fs::Directory, KernelError> {
        Ok(fs::Directory::new(DirHandle::new(self.inode.clone())))
    }
}
