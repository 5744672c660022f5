//! User-side system-call wrappers.
//!
//! The thin layer a user program calls instead of hand-building syscall
//! frames: arguments go onto the user stack, pointers point into user
//! memory, and the kernel reads everything back through its validated
//! access path.

use kore::mm::Va;
use kore::process::UserCtx;
use kore::syscall::SyscallNumber;

/// Terminates the calling process with `status`.
pub fn exit(ctx: &mut UserCtx, status: i32) -> ! {
    ctx.syscall(SyscallNumber::Exit, &[status as u32]);
    unreachable!("exit returned")
}

/// Starts the program named by `cmdline`; returns its pid or -1.
pub fn exec(ctx: &mut UserCtx, cmdline: &str) -> i32 {
    let p = ctx.push_str(cmdline);
    ctx.syscall(SyscallNumber::Exec, &[p.into_usize() as u32]) as i32
}

/// Waits for child `pid` and returns its exit status.
pub fn wait(ctx: &mut UserCtx, pid: i32) -> i32 {
    ctx.syscall(SyscallNumber::Wait, &[pid as u32]) as i32
}

/// Creates a file of `size` bytes.
pub fn create(ctx: &mut UserCtx, name: &str, size: u32) -> bool {
    let p = ctx.push_str(name);
    ctx.syscall(SyscallNumber::Create, &[p.into_usize() as u32, size]) != 0
}

/// Removes a file or empty directory.
pub fn remove(ctx: &mut UserCtx, name: &str) -> bool {
    let p = ctx.push_str(name);
    ctx.syscall(SyscallNumber::Remove, &[p.into_usize() as u32]) != 0
}

/// Opens a file; returns a descriptor or -1.
pub fn open(ctx: &mut UserCtx, name: &str) -> i32 {
    let p = ctx.push_str(name);
    ctx.syscall(SyscallNumber::Open, &[p.into_usize() as u32]) as i32
}

/// The size of the file on `fd`.
pub fn filesize(ctx: &mut UserCtx, fd: i32) -> i32 {
    ctx.syscall(SyscallNumber::Filesize, &[fd as u32]) as i32
}

/// Reads `len` bytes from `fd` into user memory at `buf`.
pub fn read(ctx: &mut UserCtx, fd: i32, buf: Va, len: u32) -> i32 {
    ctx.syscall(SyscallNumber::Read, &[fd as u32, buf.into_usize() as u32, len]) as i32
}

/// Writes `len` bytes from user memory at `buf` to `fd`.
pub fn write(ctx: &mut UserCtx, fd: i32, buf: Va, len: u32) -> i32 {
    ctx.syscall(
        SyscallNumber::Write,
        &[fd as u32, buf.into_usize() as u32, len],
    ) as i32
}

/// Moves `fd`'s position.
pub fn seek(ctx: &mut UserCtx, fd: i32, pos: u32) {
    ctx.syscall(SyscallNumber::Seek, &[fd as u32, pos]);
}

/// Reports `fd`'s position.
pub fn tell(ctx: &mut UserCtx, fd: i32) -> u32 {
    ctx.syscall(SyscallNumber::Tell, &[fd as u32]) as u32
}

/// Closes `fd`.
pub fn close(ctx: &mut UserCtx, fd: i32) {
    ctx.syscall(SyscallNumber::Close, &[fd as u32]);
}

/// Maps the file on `fd` at `addr`; returns a map descriptor or -1.
pub fn mmap(ctx: &mut UserCtx, fd: i32, addr: Va) -> i32 {
    ctx.syscall(SyscallNumber::Mmap, &[fd as u32, addr.into_usize() as u32]) as i32
}

/// Removes mapping `md`.
pub fn munmap(ctx: &mut UserCtx, md: i32) {
    ctx.syscall(SyscallNumber::Munmap, &[md as u32]);
}

/// Changes the working directory; returns success.
pub fn chdir(ctx: &mut UserCtx, path: &str) -> bool {
    let p = ctx.push_str(path);
    ctx.syscall(SyscallNumber::Chdir, &[p.into_usize() as u32]) != 0
}

/// Creates a directory; returns success.
pub fn mkdir(ctx: &mut UserCtx, path: &str) -> bool {
    let p = ctx.push_str(path);
    ctx.syscall(SyscallNumber::Mkdir, &[p.into_usize() as u32]) != 0
}

/// Reads the next entry of the directory on `fd` into `name_buf`.
pub fn readdir(ctx: &mut UserCtx, fd: i32, name_buf: Va) -> bool {
    ctx.syscall(
        SyscallNumber::Readdir,
        &[fd as u32, name_buf.into_usize() as u32],
    ) != 0
}

/// Whether `fd` names a directory.
pub fn isdir(ctx: &mut UserCtx, fd: i32) -> bool {
    ctx.syscall(SyscallNumber::Isdir, &[fd as u32]) != 0
}

/// The inode number behind `fd`.
pub fn inumber(ctx: &mut UserCtx, fd: i32) -> i32 {
    ctx.syscall(SyscallNumber::Inumber, &[fd as u32]) as i32
}
