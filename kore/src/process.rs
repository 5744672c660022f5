//! Process lifecycle: executable load, argument passing, exec/wait/exit,
//! descriptor and memory-map tables.
//!
//! A process is a kernel thread with a page directory and the per-process
//! tables. The executable format is a flat segment table (the real ELF
//! loader is outside the core); the program text itself is a registered
//! function that runs against the process's address space through
//! [`UserCtx`], entering the kernel only through the system-call surface.

use crate::fs;
use crate::kernel::{kernel, Kernel};
use crate::mm::grow_stack;
use crate::mm::page_dir::PageDir;
use crate::mm::page_info::{PageInfo, WritableTo};
use crate::mm::palloc::AllocFlags;
use crate::mm::{Va, PAGE_SIZE, PHYS_BASE};
use crate::sync::Semaphore;
use crate::syscall::{self, uaccess};
use crate::thread::{self, ThreadBuilder};
use crate::KernelError;
use std::sync::{Arc, Mutex as StdMutex};

/// Executable image magic ("KIMG").
pub const IMAGE_MAGIC: u32 = 0x4B49_4D47;
/// Size of the image header sector, including the segment table.
pub const IMAGE_HEADER_LEN: usize = 512;
/// Maximum loadable segments per image.
pub const IMAGE_MAX_SEGMENTS: usize = 25;

const MAX_FILES: u32 = 128;
const MAX_MMAPS: usize = 16;
const FD_BASE: u32 = 2;

/// A registered user program: runs on the process's thread and talks to
/// the kernel through its [`UserCtx`]. The return value becomes the exit
/// status.
pub type UserProgram = fn(&mut UserCtx) -> i32;

struct MmapEntry {
    upage: Va,
    file: fs::RegularFile,
    num_pages: usize,
}

/// Per-process state hanging off the thread.
pub struct Process {
    pub(crate) pd: Arc<PageDir>,
    pub(crate) cwd: StdMutex<Option<fs::Directory>>,
    files: StdMutex<std::collections::BTreeMap<u32, fs::File>>,
    mmaps: StdMutex<Vec<Option<MmapEntry>>>,
    exe: StdMutex<Option<fs::RegularFile>>,
    pub(crate) user_esp: StdMutex<Va>,
}

impl Process {
    fn new(cwd: Option<fs::Directory>) -> Arc<Self> {
        Arc::new(Self {
            pd: PageDir::new(),
            cwd: StdMutex::new(cwd),
            files: StdMutex::new(std::collections::BTreeMap::new()),
            mmaps: StdMutex::new((0..MAX_MMAPS).map(|_| None).collect()),
            exe: StdMutex::new(None),
            user_esp: StdMutex::new(Va::new(PHYS_BASE)),
        })
    }

    /// Installs `file` at the lowest free descriptor.
    pub(crate) fn install_fd(&self, file: fs::File) -> Option<u32> {
        let mut files = self.files.lock().unwrap();
        let fd = (FD_BASE..MAX_FILES).find(|fd| !files.contains_key(fd))?;
        files.insert(fd, file);
        Some(fd)
    }

    pub(crate) fn lookup_fd(&self, fd: u32) -> Result<fs::File, KernelError> {
        self.files
            .lock()
            .unwrap()
            .get(&fd)
            .cloned()
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub(crate) fn regular_fd(&self, fd: u32) -> Result<fs::RegularFile, KernelError> {
        self.lookup_fd(fd)?
            .into_regular()
            .ok_or(KernelError::IsDirectory)
    }

    pub(crate) fn directory_fd(&self, fd: u32) -> Result<fs::Directory, KernelError> {
        self.lookup_fd(fd)?
            .into_directory()
            .ok_or(KernelError::NotDirectory)
    }

    pub(crate) fn close_fd(&self, fd: u32) -> Result<(), KernelError> {
        self.files
            .lock()
            .unwrap()
            .remove(&fd)
            .map(|_| ())
            .ok_or(KernelError::BadFileDescriptor)
    }
}

/// Starts the program named by the first whitespace-delimited token of
/// `cmdline`, passing the whole command line as its arguments. Blocks
/// until the child has loaded; a load failure surfaces here instead of a
/// pid.
pub fn exec(cmdline: &str) -> Result<u64, KernelError> {
    let k = kernel();
    let name = cmdline
        .split_whitespace()
        .next()
        .ok_or(KernelError::InvalidArgument)?
        .to_string();
    let cwd = match thread::current_process(&k) {
        Some(p) => {
            let cwd = p.cwd.lock().unwrap().clone();
            match cwd {
                Some(d) => Some(d.reopen()?),
                None => None,
            }
        }
        None => None,
    };
    let process = Process::new(cwd);
    let loaded = Arc::new((Semaphore::new(0), StdMutex::new(false)));
    let cmdline_owned = cmdline.to_string();
    let loaded_child = loaded.clone();
    let handle = ThreadBuilder::new(&name)
        .process(process)
        .spawn(move || child_main(cmdline_owned, loaded_child));
    loaded.0.down();
    if *loaded.1.lock().unwrap() {
        Ok(handle.tid)
    } else {
        Err(KernelError::NoExec)
    }
}

/// Waits for direct child `pid` to exit and returns its status. Returns -1
/// for a pid that is not an unwaited direct child.
pub fn wait(pid: u64) -> i32 {
    let k = kernel();
    let Some(child) = thread::current_child(&k, pid) else {
        return -1;
    };
    let mut g = child.exit.state.lock();
    if g.waited {
        g.unlock();
        return -1;
    }
    while g.status.is_none() {
        g = child.exit.cond.wait(g);
    }
    g.waited = true;
    let status = g.status.unwrap();
    g.unlock();
    status
}

/// Terminates the current process with `status`.
pub fn exit(status: i32) -> ! {
    thread::exit_current(status)
}

/// Teardown run by the thread trampoline once the thread's work has ended,
/// normally or by a kill: releases mmaps, descriptors and the address
/// space, and re-allows writes to the executable.
pub(crate) fn on_thread_exit(k: &Arc<Kernel>, status: i32) {
    let Some(proc) = thread::current_process(k) else {
        return;
    };
    let name = thread::current_name();
    k.console
        .write(format!("{name}: exit({status})\n").as_bytes());
    let mmaps: Vec<MmapEntry> = proc
        .mmaps
        .lock()
        .unwrap()
        .iter_mut()
        .filter_map(|m| m.take())
        .collect();
    for m in mmaps {
        unmap_entry(k, &proc, m);
    }
    proc.files.lock().unwrap().clear();
    for va in proc.pd.mapped_pages() {
        k.frames.unload(&proc.pd, va);
    }
    if let Some(exe) = proc.exe.lock().unwrap().take() {
        exe.allow_write();
    }
    *proc.cwd.lock().unwrap() = None;
}

fn child_main(cmdline: String, loaded: Arc<(Semaphore, StdMutex<bool>)>) {
    let k = kernel();
    let proc = thread::current_process(&k).expect("process thread without a process");
    match load(&k, &proc, &cmdline) {
        Ok((entry, esp)) => {
            *loaded.1.lock().unwrap() = true;
            *proc.user_esp.lock().unwrap() = esp;
            loaded.0.up();
            let mut ctx = UserCtx { esp };
            let status = entry(&mut ctx);
            thread::exit_current(status)
        }
        Err(e) => {
            log::warn!("load of '{cmdline}' failed: {e:?}");
            loaded.0.up();
            thread::exit_current(-1)
        }
    }
}

struct Segment {
    vaddr: u32,
    file_ofs: u32,
    file_len: u32,
    mem_len: u32,
    writable: bool,
}

fn parse_header(header: &[u8]) -> Result<Vec<Segment>, KernelError> {
    let word =
        |i: usize| -> u32 { u32::from_le_bytes(header[i * 4..i * 4 + 4].try_into().unwrap()) };
    if word(0) != IMAGE_MAGIC {
        return Err(KernelError::NoExec);
    }
    let nsegs = word(1) as usize;
    if nsegs > IMAGE_MAX_SEGMENTS {
        return Err(KernelError::NoExec);
    }
    Ok((0..nsegs)
        .map(|i| {
            let base = 2 + i * 5;
            Segment {
                vaddr: word(base),
                file_ofs: word(base + 1),
                file_len: word(base + 2),
                mem_len: word(base + 3),
                writable: word(base + 4) != 0,
            }
        })
        .collect())
}

/// Loads the executable: builds the page-level state of the new address
/// space and the initial stack, and resolves the program entry.
fn load(k: &Arc<Kernel>, proc: &Arc<Process>, cmdline: &str) -> Result<(UserProgram, Va), KernelError> {
    let args: Vec<&str> = cmdline.split_whitespace().collect();
    let path = args[0];
    let entry_name = path.rsplit('/').next().unwrap_or(path);
    let entry = k.user_program(entry_name).ok_or(KernelError::NoExec)?;
    let cwd = proc.cwd.lock().unwrap().clone();
    let exe = fs::instance()?
        .open(cwd.as_ref(), path)?
        .into_regular()
        .ok_or(KernelError::NoExec)?;
    let mut header = [0u8; IMAGE_HEADER_LEN];
    if exe.read_at(&mut header, 0)? != IMAGE_HEADER_LEN {
        return Err(KernelError::NoExec);
    }
    let segments = parse_header(&header)?;
    // Writes to a running executable are denied until exit.
    exe.deny_write();
    *proc.exe.lock().unwrap() = Some(exe.clone());
    for seg in &segments {
        load_segment(proc, &exe, seg)?;
    }
    let esp = setup_stack(k, proc, &args)?;
    Ok((entry, esp))
}

/// Creates the page-infos for one loadable segment. File-covered pages are
/// file-backed; a writable segment's pages travel to swap once dirtied,
/// while read-only pages stay shareable across processes. Pages past the
/// file extent are zero pages.
fn load_segment(proc: &Arc<Process>, exe: &fs::RegularFile, seg: &Segment) -> Result<(), KernelError> {
    if seg.vaddr as usize % PAGE_SIZE != 0
        || seg.file_ofs as usize % PAGE_SIZE != 0
        || seg.mem_len < seg.file_len
    {
        return Err(KernelError::NoExec);
    }
    let start = seg.vaddr as usize;
    let end = start.checked_add(seg.mem_len as usize).ok_or(KernelError::NoExec)?;
    if end > PHYS_BASE {
        return Err(KernelError::NoExec);
    }
    let pages = (seg.mem_len as usize).div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let upage = Va::new(start + i * PAGE_SIZE);
        if proc.pd.get_info(upage).is_some() {
            return Err(KernelError::NoExec);
        }
        let file_here = (seg.file_len as usize).saturating_sub(i * PAGE_SIZE).min(PAGE_SIZE);
        let writable = if seg.writable {
            WritableTo::SWAP
        } else {
            WritableTo::empty()
        };
        let info = if file_here > 0 {
            let end_offset = seg.file_ofs + (i * PAGE_SIZE + file_here) as u32;
            PageInfo::file(&proc.pd, upage, exe.clone(), end_offset, writable)
        } else {
            PageInfo::zero(&proc.pd, upage, writable)
        };
        proc.pd.set_info(upage, Some(info));
    }
    Ok(())
}

/// Builds the initial user stack in a kernel seed page: each argument's
/// bytes at the top in order, word alignment, the argv array with its
/// trailing null, argc, and a zero sentinel return address.
fn setup_stack(k: &Arc<Kernel>, proc: &Arc<Process>, args: &[&str]) -> Result<Va, KernelError> {
    let seed = k
        .pools
        .alloc(&k.ram, AllocFlags::ZERO)
        .ok_or(KernelError::NoMemory)?;
    let stack_page = Va::new(PHYS_BASE - PAGE_SIZE);
    let mut page = vec![0u8; PAGE_SIZE];
    let mut top = PAGE_SIZE;
    let mut addrs = Vec::with_capacity(args.len());
    let needed: usize = args.iter().map(|a| a.len() + 1).sum::<usize>() + 4 * (args.len() + 3) + 4;
    if needed > PAGE_SIZE {
        k.pools.free(seed);
        return Err(KernelError::NoExec);
    }
    for arg in args {
        top -= arg.len() + 1;
        page[top..top + arg.len()].copy_from_slice(arg.as_bytes());
        addrs.push((stack_page.into_usize() + top) as u32);
    }
    top &= !3;
    let mut push = |page: &mut Vec<u8>, top: &mut usize, word: u32| {
        *top -= 4;
        page[*top..*top + 4].copy_from_slice(&word.to_le_bytes());
    };
    push(&mut page, &mut top, 0); // argv[argc]
    for &addr in addrs.iter().rev() {
        push(&mut page, &mut top, addr);
    }
    push(&mut page, &mut top, args.len() as u32); // argc
    push(&mut page, &mut top, 0); // sentinel return address
    k.ram.write(seed, &page);
    let info = PageInfo::kernel_seed(&proc.pd, stack_page, seed, WritableTo::SWAP);
    proc.pd.set_info(stack_page, Some(info));
    Ok(Va::new(stack_page.into_usize() + top))
}

/// Maps the file open on `fd` at `addr`. Returns the map descriptor, or -1
/// when the address is unusable, the descriptor does not name a mappable
/// file, or the table is full.
pub(crate) fn mmap(proc: &Arc<Process>, fd: u32, addr: Va) -> isize {
    if addr.into_usize() == 0
        || addr.page_offset() != 0
        || fd == syscall::STDIN_FILENO
        || fd == syscall::STDOUT_FILENO
    {
        return -1;
    }
    let Ok(file) = proc.regular_fd(fd) else {
        return -1;
    };
    let length = file.length() as usize;
    if length == 0 {
        return -1;
    }
    let esp = *proc.user_esp.lock().unwrap();
    let num_pages = length.div_ceil(PAGE_SIZE);
    for i in 0..num_pages {
        let upage = Va::new(addr.into_usize() + i * PAGE_SIZE);
        if !upage.is_user()
            || proc.pd.get_info(upage).is_some()
            || grow_stack::is_stack_access(upage, esp)
        {
            return -1;
        }
    }
    let Ok(file) = file.reopen() else {
        return -1;
    };
    let mut mmaps = proc.mmaps.lock().unwrap();
    let Some(md) = mmaps.iter().position(|m| m.is_none()) else {
        return -1;
    };
    for i in 0..num_pages {
        let upage = Va::new(addr.into_usize() + i * PAGE_SIZE);
        let end_offset = (length.min((i + 1) * PAGE_SIZE)) as u32;
        let info = PageInfo::file(&proc.pd, upage, file.clone(), end_offset, WritableTo::FILE);
        proc.pd.set_info(upage, Some(info));
    }
    mmaps[md] = Some(MmapEntry {
        upage: addr,
        file,
        num_pages,
    });
    md as isize
}

/// Removes mapping `md`, writing dirty pages back to the file.
pub(crate) fn munmap(proc: &Arc<Process>, md: isize) {
    if md < 0 || md as usize >= MAX_MMAPS {
        return;
    }
    let entry = proc.mmaps.lock().unwrap()[md as usize].take();
    if let Some(entry) = entry {
        let k = kernel();
        unmap_entry(&k, proc, entry);
    }
}

fn unmap_entry(k: &Arc<Kernel>, proc: &Arc<Process>, entry: MmapEntry) {
    for i in 0..entry.num_pages {
        let upage = Va::new(entry.upage.into_usize() + i * PAGE_SIZE);
        k.frames.unload(&proc.pd, upage);
    }
    drop(entry.file);
}

/// The user-mode execution context handed to a registered program.
///
/// Memory accessors behave like user-mode loads and stores: they translate
/// through the process's page directory, drive the demand-paging and
/// stack-growth machinery, and kill the process with status -1 on an
/// illegal access.
pub struct UserCtx {
    esp: Va,
}

impl UserCtx {
    /// The current user stack pointer.
    pub fn esp(&self) -> Va {
        self.esp
    }

    /// Moves the user stack pointer.
    pub fn set_esp(&mut self, esp: Va) {
        self.esp = esp;
        let k = kernel();
        if let Some(p) = thread::current_process(&k) {
            *p.user_esp.lock().unwrap() = esp;
        }
    }

    fn proc(&self) -> Arc<Process> {
        let k = kernel();
        thread::current_process(&k).expect("user context outside a process")
    }

    /// A user-mode read of `buf.len()` bytes at `va`.
    pub fn read(&self, va: Va, buf: &mut [u8]) {
        let proc = self.proc();
        match uaccess::copy_in(&proc.pd, va, buf.len(), self.esp) {
            Ok(data) => buf.copy_from_slice(&data),
            Err(_) => exit(-1),
        }
    }

    /// A user-mode write of `buf` at `va`.
    pub fn write(&self, va: Va, buf: &[u8]) {
        let proc = self.proc();
        if uaccess::copy_out(&proc.pd, va, buf, self.esp).is_err() {
            exit(-1)
        }
    }

    /// Pushes `bytes` onto the user stack (word-aligned) and returns their
    /// address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Va {
        let sp = (self.esp.into_usize() - bytes.len()) & !3;
        self.set_esp(Va::new(sp));
        self.write(Va::new(sp), bytes);
        Va::new(sp)
    }

    /// Pushes a NUL-terminated copy of `s` onto the user stack.
    pub fn push_str(&mut self, s: &str) -> Va {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    /// A user-mode u32 load.
    pub fn read_u32(&self, va: Va) -> u32 {
        let mut b = [0u8; 4];
        self.read(va, &mut b);
        u32::from_le_bytes(b)
    }

    /// The program's arguments, decoded from the initial stack layout.
    pub fn args(&self) -> Vec<String> {
        let base = self.esp.into_usize();
        let argc = self.read_u32(Va::new(base + 4)) as usize;
        (0..argc)
            .map(|i| {
                let ptr = self.read_u32(Va::new(base + 8 + 4 * i)) as usize;
                let mut s = Vec::new();
                let mut addr = ptr;
                loop {
                    let mut b = [0u8; 1];
                    self.read(Va::new(addr), &mut b);
                    if b[0] == 0 {
                        break;
                    }
                    s.push(b[0]);
                    addr += 1;
                }
                String::from_utf8_lossy(&s).into_owned()
            })
            .collect()
    }

    /// Issues a system call: the number and arguments are stored on the
    /// user stack and the kernel reads them back from there, exactly as a
    /// trap would.
    pub fn syscall<N: SyscallNumberLike>(&mut self, nr: N, args: &[u32]) -> isize {
        let frame = 4 * (1 + args.len());
        let sp = Va::new(self.esp.into_usize() - frame);
        let mut bytes = Vec::with_capacity(frame);
        bytes.extend_from_slice(&nr.into_u32().to_le_bytes());
        for a in args {
            bytes.extend_from_slice(&a.to_le_bytes());
        }
        let old_esp = self.esp;
        self.set_esp(sp);
        self.write(sp, &bytes);
        let r = syscall::dispatch(sp);
        self.set_esp(old_esp);
        r
    }

    /// Issues a system call with a raw, possibly bogus stack pointer.
    /// Exercises the argument-validation path directly.
    pub fn syscall_at(&mut self, esp: Va) -> isize {
        syscall::dispatch(esp)
    }
}

/// Anything convertible to a raw system-call number.
pub trait SyscallNumberLike: Copy {
    /// The raw call number.
    fn into_u32(self) -> u32;
}

impl SyscallNumberLike for syscall::SyscallNumber {
    fn into_u32(self) -> u32 {
        self as u32
    }
}

impl SyscallNumberLike for u32 {
    fn into_u32(self) -> u32 {
        self
    }
}
