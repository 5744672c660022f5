//! Assembles a bootable machine: kernel, disks, mounted file system and
//! user programs.
//!
//! Tests describe a machine with [`MachineBuilder`], hand it user programs
//! and run a scenario against the booted instance. Executable images are
//! produced by [`ImageBuilder`] and installed into the file system like
//! any other file; [`usys`] is the thin user-side wrapper over the raw
//! system-call surface that user programs call.

use kore::dev::MemDisk;
use kore::fs;
use kore::process::{self, UserProgram};
use kore::{Kernel, KernelBuilder};
use std::sync::Arc;
use tinyfs::TinyFs;

pub mod usys;

/// Executable image layout constants live in the kernel's process module;
/// this builder produces matching images.
pub struct ImageBuilder {
    segments: Vec<Segment>,
}

struct Segment {
    vaddr: u32,
    data: Vec<u8>,
    mem_len: u32,
    writable: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// An image with no segments yet.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Adds a loadable segment at page-aligned `vaddr`, occupying
    /// `mem_len` bytes of which the first `data.len()` come from the
    /// file.
    pub fn segment(mut self, vaddr: u32, data: &[u8], mem_len: u32, writable: bool) -> Self {
        assert_eq!(vaddr as usize % kore::mm::PAGE_SIZE, 0);
        assert!(data.len() as u32 <= mem_len);
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            mem_len,
            writable,
        });
        self
    }

    /// Serializes the image: a header sector with the segment table, then
    /// each segment's bytes at page-aligned file offsets.
    pub fn build(self) -> Vec<u8> {
        assert!(self.segments.len() <= process::IMAGE_MAX_SEGMENTS);
        let mut header = vec![0u8; process::IMAGE_HEADER_LEN];
        header[0..4].copy_from_slice(&process::IMAGE_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(self.segments.len() as u32).to_le_bytes());
        let mut image = header;
        image.resize(kore::mm::PAGE_SIZE, 0);
        for (i, seg) in self.segments.iter().enumerate() {
            let file_ofs = image.len() as u32;
            let base = 8 + i * 20;
            for (j, word) in [
                seg.vaddr,
                file_ofs,
                seg.data.len() as u32,
                seg.mem_len,
                seg.writable as u32,
            ]
            .into_iter()
            .enumerate()
            {
                image[base + j * 4..base + j * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            image.extend_from_slice(&seg.data);
            let padded = image.len().div_ceil(kore::mm::PAGE_SIZE) * kore::mm::PAGE_SIZE;
            image.resize(padded, 0);
        }
        image
    }
}

/// A minimal valid executable: one read-only page of "text" and one
/// writable page of "data".
pub fn trivial_image() -> Vec<u8> {
    ImageBuilder::new()
        .segment(0x0804_8000, &[0x90; 64], 4096, false)
        .segment(0x0804_9000, b"static data", 8192, true)
        .build()
}

/// Configuration for a machine.
pub struct MachineBuilder {
    fs_sectors: u32,
    swap_sectors: u32,
    kernel: KernelBuilder,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBuilder {
    /// A machine with default disk and memory geometry.
    pub fn new() -> Self {
        Self {
            fs_sectors: 4096,
            swap_sectors: 4096,
            kernel: Kernel::builder(),
        }
    }

    /// Registers a user program.
    pub fn program(mut self, name: &str, prog: UserProgram) -> Self {
        self.kernel = self.kernel.program(name, prog);
        self
    }

    /// Shrinks or grows the user frame pool; small pools force eviction.
    pub fn user_pages(mut self, pages: usize) -> Self {
        self.kernel = self.kernel.user_pages(pages);
        self
    }

    /// Total physical pages.
    pub fn ram_pages(mut self, pages: usize) -> Self {
        self.kernel = self.kernel.ram_pages(pages);
        self
    }

    /// Formats the disks, boots the kernel, mounts the file system, runs
    /// `f`, and shuts everything down.
    pub fn run<R>(self, f: impl FnOnce(&Machine) -> R) -> R {
        let fs_disk = Arc::new(MemDisk::new(self.fs_sectors));
        TinyFs::format(&*fs_disk);
        let swap_disk = Arc::new(MemDisk::new(self.swap_sectors));
        log::info!(
            "machine: fs disk {} sectors, swap disk {} sectors",
            self.fs_sectors,
            self.swap_sectors
        );
        let kernel = self.kernel.swap_device(swap_disk).build();
        let k = kernel.clone();
        kernel.run(move || {
            let fs = TinyFs::mount(fs_disk).expect("mounting the file system failed");
            fs::register(fs.clone());
            f(&Machine { kernel: k, fs })
        })
    }
}

/// A booted machine, handed to the scenario closure.
pub struct Machine {
    kernel: Arc<Kernel>,
    fs: Arc<TinyFs>,
}

impl Machine {
    /// The kernel instance.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The mounted file system.
    pub fn fs(&self) -> &TinyFs {
        &self.fs
    }

    /// Writes an executable image into the file system at `path`.
    pub fn install(&self, path: &str, image: &[u8]) {
        use kore::fs::traits::FileSystem;
        self.fs
            .create(None, path, 0, false)
            .expect("creating the executable failed");
        let file = self
            .fs
            .open(None, path)
            .expect("opening the executable failed")
            .into_regular()
            .unwrap();
        assert_eq!(file.write(image).unwrap(), image.len());
    }

    /// Installs a [`trivial_image`] under `name`, the usual way to make a
    /// registered program runnable.
    pub fn install_trivial(&self, name: &str) {
        self.install(name, &trivial_image());
    }

    /// Starts `cmdline` and waits for the process to exit, returning its
    /// status (-1 when the load already failed).
    pub fn exec_wait(&self, cmdline: &str) -> i32 {
        match process::exec(cmdline) {
            Ok(pid) => process::wait(pid),
            Err(_) => -1,
        }
    }

    /// Bytes written to the console so far.
    pub fn console(&self) -> Vec<u8> {
        self.kernel.console_output()
    }

    /// Types `bytes` on the simulated keyboard.
    pub fn type_input(&self, bytes: &[u8]) {
        self.kernel.feed_input(bytes);
    }
}
