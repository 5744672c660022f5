//! System-call surface.
//!
//! On entry the handler reads the call number and arguments from the user
//! stack with validated byte reads. Pointer arguments must lie below the
//! user/kernel split and every byte touched must be reachable through the
//! current page directory; strings are validated byte by byte, buffers at
//! both ends and every page boundary, with the pages pinned for the
//! duration of the copy. Any invalid memory access, descriptor or argument
//! terminates the offending process with status -1.

pub mod uaccess;

use crate::fs;
use crate::kernel::kernel;
use crate::mm::Va;
use crate::process::{self, Process};
use crate::thread;
use crate::KernelError;
use num_enum::TryFromPrimitive;
use std::sync::Arc;

/// System-call numbers.
#[derive(Clone, Copy, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    /// Halt the system.
    Halt = 0,
    /// Terminate this process.
    Exit = 1,
    /// Start another process.
    Exec = 2,
    /// Wait for a child process to die.
    Wait = 3,
    /// Create a file.
    Create = 4,
    /// Delete a file.
    Remove = 5,
    /// Open a file.
    Open = 6,
    /// Obtain a file's size.
    Filesize = 7,
    /// Read from a file.
    Read = 8,
    /// Write to a file.
    Write = 9,
    /// Change position in a file.
    Seek = 10,
    /// Report current position in a file.
    Tell = 11,
    /// Close a file.
    Close = 12,
    /// Map a file into memory.
    Mmap = 13,
    /// Remove a memory mapping.
    Munmap = 14,
    /// Change the current directory.
    Chdir = 15,
    /// Create a directory.
    Mkdir = 16,
    /// Read a directory entry.
    Readdir = 17,
    /// Test if a descriptor is a directory.
    Isdir = 18,
    /// Report a file's inode number.
    Inumber = 19,
}

/// Console input descriptor.
pub const STDIN_FILENO: u32 = 0;
/// Console output descriptor.
pub const STDOUT_FILENO: u32 = 1;

const MAX_PATH: usize = 4096;

fn kill() -> ! {
    log::debug!("syscall: killing offender");
    process::exit(-1)
}

/// Unwraps a user-memory or argument validation result, terminating the
/// process on failure.
fn must<T>(r: Result<T, KernelError>) -> T {
    match r {
        Ok(v) => v,
        Err(_) => kill(),
    }
}

struct Args<'a> {
    proc: &'a Arc<Process>,
    base: Va,
    esp: Va,
}

impl Args<'_> {
    fn word(&self, idx: usize) -> u32 {
        must(uaccess::read_u32(
            &self.proc.pd,
            Va::new(self.base.into_usize() + 4 * idx),
            self.esp,
        ))
    }

    fn str_arg(&self, idx: usize) -> String {
        let ptr = self.word(idx);
        must(uaccess::read_cstr(
            &self.proc.pd,
            Va::new(ptr as usize),
            self.esp,
            MAX_PATH,
        ))
    }
}

/// Dispatches the system call whose frame starts at `esp` on the user
/// stack. Records `esp` as the thread's user stack pointer first, since
/// stack growth consults it.
pub fn dispatch(esp: Va) -> isize {
    let k = kernel();
    let proc = thread::current_process(&k).expect("system call without a process");
    *proc.user_esp.lock().unwrap() = esp;
    let nr = must(uaccess::read_u32(&proc.pd, esp, esp));
    let Ok(nr) = SyscallNumber::try_from(nr) else {
        kill()
    };
    let args = Args {
        proc: &proc,
        base: Va::new(esp.into_usize() + 4),
        esp,
    };
    match nr {
        SyscallNumber::Halt => {
            log::info!("halt requested; ending this process");
            process::exit(0)
        }
        SyscallNumber::Exit => process::exit(args.word(0) as i32),
        SyscallNumber::Exec => {
            let cmdline = args.str_arg(0);
            match process::exec(&cmdline) {
                Ok(pid) => pid as isize,
                Err(_) => -1,
            }
        }
        SyscallNumber::Wait => process::wait(args.word(0) as u64) as isize,
        SyscallNumber::Create => {
            let path = args.str_arg(0);
            let size = args.word(1);
            let ok = fs_create(&proc, &path, size, false);
            ok as isize
        }
        SyscallNumber::Remove => {
            let path = args.str_arg(0);
            let cwd = proc.cwd.lock().unwrap().clone();
            let ok = fs::instance()
                .and_then(|fs| fs.remove(cwd.as_ref(), &path))
                .is_ok();
            ok as isize
        }
        SyscallNumber::Open => {
            let path = args.str_arg(0);
            let cwd = proc.cwd.lock().unwrap().clone();
            match fs::instance().and_then(|fs| fs.open(cwd.as_ref(), &path)) {
                Ok(file) => proc.install_fd(file).map(|fd| fd as isize).unwrap_or(-1),
                Err(_) => -1,
            }
        }
        SyscallNumber::Filesize => {
            let file = must(proc.regular_fd(args.word(0)));
            file.length() as isize
        }
        SyscallNumber::Read => sys_read(&args),
        SyscallNumber::Write => sys_write(&args),
        SyscallNumber::Seek => {
            let file = must(proc.regular_fd(args.word(0)));
            file.seek(args.word(1));
            0
        }
        SyscallNumber::Tell => {
            let file = must(proc.regular_fd(args.word(0)));
            file.tell() as isize
        }
        SyscallNumber::Close => {
            must(proc.close_fd(args.word(0)));
            0
        }
        SyscallNumber::Mmap => process::mmap(&proc, args.word(0), Va::new(args.word(1) as usize)),
        SyscallNumber::Munmap => {
            process::munmap(&proc, args.word(0) as isize);
            0
        }
        SyscallNumber::Chdir => {
            let path = args.str_arg(0);
            let cwd = proc.cwd.lock().unwrap().clone();
            match fs::instance()
                .and_then(|fs| fs.open(cwd.as_ref(), &path))
                .and_then(|f| f.into_directory().ok_or(KernelError::NotDirectory))
            {
                Ok(dir) => {
                    *proc.cwd.lock().unwrap() = Some(dir);
                    1
                }
                Err(_) => 0,
            }
        }
        SyscallNumber::Mkdir => {
            let path = args.str_arg(0);
            let ok = fs_create(&proc, &path, 0, true);
            ok as isize
        }
        SyscallNumber::Readdir => {
            let fd = args.word(0);
            let name_ptr = Va::new(args.word(1) as usize);
            let dir = must(proc.directory_fd(fd));
            match must(dir.readdir()) {
                Some(name) => {
                    let mut bytes = name.into_bytes();
                    bytes.push(0);
                    must(uaccess::copy_out(&proc.pd, name_ptr, &bytes, args.esp));
                    1
                }
                None => 0,
            }
        }
        SyscallNumber::Isdir => {
            let file = must(proc.lookup_fd(args.word(0)));
            file.is_dir() as isize
        }
        SyscallNumber::Inumber => {
            let file = must(proc.lookup_fd(args.word(0)));
            file.ino() as isize
        }
    }
}

fn fs_create(proc: &Arc<Process>, path: &str, size: u32, is_dir: bool) -> bool {
    let cwd = proc.cwd.lock().unwrap().clone();
    fs::instance()
        .and_then(|fs| fs.create(cwd.as_ref(), path, size, is_dir))
        .is_ok()
}

fn sys_read(args: &Args<'_>) -> isize {
    let fd = args.word(0);
    let buf = Va::new(args.word(1) as usize);
    let len = args.word(2) as usize;
    if fd == STDIN_FILENO {
        let k = kernel();
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(k.console.getc());
        }
        must(uaccess::copy_out(&args.proc.pd, buf, &out, args.esp));
        return out.len() as isize;
    }
    let file = must(args.proc.regular_fd(fd));
    let mut data = vec![0u8; len];
    let n = must(file.read(&mut data));
    must(uaccess::copy_out(&args.proc.pd, buf, &data[..n], args.esp));
    n as isize
}

fn sys_write(args: &Args<'_>) -> isize {
    let fd = args.word(0);
    let buf = Va::new(args.word(1) as usize);
    let len = args.word(2) as usize;
    let data = must(uaccess::copy_in(&args.proc.pd, buf, len, args.esp));
    if fd == STDOUT_FILENO {
        let k = kernel();
        k.console.write(&data);
        return len as isize;
    }
    let file = must(args.proc.regular_fd(fd));
    let n = must(file.write(&data));
    n as isize
}
