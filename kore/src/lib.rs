//! # kore: a teaching operating-system kernel core.
//!
//! `kore` hosts preemptively scheduled kernel threads, runs isolated user
//! processes with demand-paged virtual memory, and exposes the system-call
//! surface those processes see. The file system plugs in through the traits
//! in [`fs`]; the `tinyfs` crate provides the on-disk implementation.
//!
//! ## The execution model
//!
//! The kernel simulates a single CPU. Kernel threads are host threads, but
//! exactly one of them runs at any instant; the others are parked until the
//! scheduler hands them the CPU. "Disabling interrupts" is entering the
//! scheduler's atomic section, and time is a virtual tick counter that
//! advances when a timer interrupt is injected or when the CPU would
//! otherwise idle with sleepers pending.
//!
//! All global state lives in a [`Kernel`] instance built by
//! [`KernelBuilder`]; tests construct a fresh instance per run, so runs are
//! isolated from each other.
//!
//! [`Kernel`]: crate::Kernel
//! [`KernelBuilder`]: crate::KernelBuilder

pub mod dev;
pub mod fs;
mod kernel;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod util;

pub use kernel::{Kernel, KernelBuilder};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while handling a kernel operation. These errors can be returned to the
/// user program to indicate the nature of the failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}
