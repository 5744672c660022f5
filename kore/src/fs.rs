//! File-system abstraction.
//!
//! The kernel consumes the file system through the traits in [`traits`];
//! the concrete implementation registers itself at mount time. Handles are
//! reference-counted trait objects so the frame table and processes can
//! hold files across suspensions.

use crate::kernel::kernel;
use crate::KernelError;
use std::sync::Arc;

/// Defines traits for file-system operations.
pub mod traits {
    use crate::KernelError;

    /// A mounted file system.
    pub trait FileSystem: Send + Sync {
        /// A fresh handle to the root directory.
        fn root(&self) -> Result<super::Directory, KernelError>;

        /// Opens `path`, relative to `cwd` unless absolute.
        fn open(
            &self,
            cwd: Option<&super::Directory>,
            path: &str,
        ) -> Result<super::File, KernelError>;

        /// Creates a file of `initial_size` bytes, or a directory.
        fn create(
            &self,
            cwd: Option<&super::Directory>,
            path: &str,
            initial_size: u32,
            is_dir: bool,
        ) -> Result<(), KernelError>;

        /// Removes the file or empty directory at `path`.
        fn remove(&self, cwd: Option<&super::Directory>, path: &str) -> Result<(), KernelError>;

        /// Flushes caches and stops background threads.
        fn shutdown(&self);
    }

    /// An open regular file with a position.
    pub trait RegularFile: Send + Sync {
        /// A stable identifier for the underlying inode.
        fn ino(&self) -> u64;

        /// Current length in bytes.
        fn length(&self) -> u32;

        /// Reads at the current position, advancing it.
        fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes at the current position, advancing it. Respects the
        /// handle's deny-write state.
        fn write(&self, buf: &[u8]) -> Result<usize, KernelError>;

        /// Reads at `offset` without touching the position.
        fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, KernelError>;

        /// Writes at `offset` without touching the position. Used by the
        /// frame table for write-back; bypasses deny-write.
        fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, KernelError>;

        /// Sets the position.
        fn seek(&self, pos: u32);

        /// The current position.
        fn tell(&self) -> u32;

        /// Forbids writes to the underlying inode through any handle.
        fn deny_write(&self);

        /// Re-allows writes denied by this handle.
        fn allow_write(&self);

        /// An independent handle on the same inode with position 0.
        fn reopen(&self) -> Result<super::RegularFile, KernelError>;
    }

    /// An open directory.
    pub trait Directory: Send + Sync {
        /// A stable identifier for the underlying inode.
        fn ino(&self) -> u64;

        /// The next entry name in storage order, skipping `.` and `..`;
        /// `None` at the end.
        fn readdir(&self) -> Result<Option<String>, KernelError>;

        /// An independent handle on the same directory.
        fn reopen(&self) -> Result<super::Directory, KernelError>;
    }
}

/// A handle to an open regular file.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Wraps a trait implementation in a handle.
    pub fn new(f: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Inode identifier.
    pub fn ino(&self) -> u64 {
        self.0.ino()
    }

    /// File length in bytes.
    pub fn length(&self) -> u32 {
        self.0.length()
    }
}

impl core::ops::Deref for RegularFile {
    type Target = dyn traits::RegularFile;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// A handle to an open directory.
#[derive(Clone)]
pub struct Directory(pub Arc<dyn traits::Directory>);

impl Directory {
    /// Wraps a trait implementation in a handle.
    pub fn new(d: impl traits::Directory + 'static) -> Self {
        Self(Arc::new(d))
    }

    /// Inode identifier.
    pub fn ino(&self) -> u64 {
        self.0.ino()
    }
}

impl core::ops::Deref for Directory {
    type Target = dyn traits::Directory;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// An open file-system object: a regular file or a directory.
#[derive(Clone)]
pub enum File {
    /// A regular file.
    Regular(RegularFile),
    /// A directory.
    Directory(Directory),
}

impl File {
    /// Extracts the regular file, if this is one.
    pub fn into_regular(self) -> Option<RegularFile> {
        match self {
            File::Regular(f) => Some(f),
            File::Directory(_) => None,
        }
    }

    /// Extracts the directory, if this is one.
    pub fn into_directory(self) -> Option<Directory> {
        match self {
            File::Directory(d) => Some(d),
            File::Regular(_) => None,
        }
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, File::Directory(_))
    }

    /// Inode identifier, regardless of kind.
    pub fn ino(&self) -> u64 {
        match self {
            File::Regular(f) => f.ino(),
            File::Directory(d) => d.ino(),
        }
    }
}

/// Registers the mounted file system with the current kernel.
pub fn register(fs: Arc<dyn traits::FileSystem>) {
    let k = kernel();
    let mut slot = k.fs.lock().unwrap();
    assert!(slot.is_none(), "a file system is already mounted");
    *slot = Some(fs);
}

/// The mounted file system.
pub fn instance() -> Result<Arc<dyn traits::FileSystem>, KernelError> {
    let k = kernel();
    let slot = k.fs.lock().unwrap();
    slot.clone().ok_or(KernelError::NoSuchEntry)
}
