//! Virtual memory: demand loading, eviction to swap, read-only frame
//! sharing, file write-back, kernel seed pages, and the small-object
//! allocator.

use kore::dev::MemDisk;
use kore::fs::{self, RegularFile};
use kore::mm::malloc;
use kore::mm::page_dir::PageDir;
use kore::mm::page_info::{PageInfo, WritableTo};
use kore::mm::palloc::AllocFlags;
use kore::mm::{Va, PAGE_SIZE, PHYS_BASE};
use kore::syscall::uaccess;
use kore::{Kernel, KernelError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

/// A file living in plain memory, for exercising file-backed pages
/// without a real file system.
struct MemFile {
    ino: u64,
    data: Arc<StdMutex<Vec<u8>>>,
    pos: StdMutex<u32>,
    reads: Arc<AtomicUsize>,
}

impl MemFile {
    fn new(ino: u64, data: Vec<u8>) -> (RegularFile, Arc<StdMutex<Vec<u8>>>, Arc<AtomicUsize>) {
        let data = Arc::new(StdMutex::new(data));
        let reads = Arc::new(AtomicUsize::new(0));
        (
            RegularFile::new(MemFile {
                ino,
                data: data.clone(),
                pos: StdMutex::new(0),
                reads: reads.clone(),
            }),
            data,
            reads,
        )
    }
}

impl fs::traits::RegularFile for MemFile {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn length(&self) -> u32 {
        self.data.lock().unwrap().len() as u32
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut pos = self.pos.lock().unwrap();
        let n = self.read_at(buf, *pos)?;
        *pos += n as u32;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut pos = self.pos.lock().unwrap();
        let n = self.write_at(buf, *pos)?;
        *pos += n as u32;
        Ok(n)
    }

    fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, KernelError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        let n = data.len().saturating_sub(offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, KernelError> {
        let mut data = self.data.lock().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn seek(&self, pos: u32) {
        *self.pos.lock().unwrap() = pos;
    }

    fn tell(&self) -> u32 {
        *self.pos.lock().unwrap()
    }

    fn deny_write(&self) {}

    fn allow_write(&self) {}

    fn reopen(&self) -> Result<RegularFile, KernelError> {
        Ok(RegularFile::new(MemFile {
            ino: self.ino,
            data: self.data.clone(),
            pos: StdMutex::new(0),
            reads: self.reads.clone(),
        }))
    }
}

const ESP: Va = Va::new(PHYS_BASE);
const BASE: usize = 0x1000_0000;

fn page(i: usize) -> Va {
    Va::new(BASE + i * PAGE_SIZE)
}

#[test]
fn zero_pages_evict_to_swap_and_come_back() {
    let kernel = Kernel::builder()
        .ram_pages(64)
        .user_pages(4)
        .swap_device(Arc::new(MemDisk::new(512)))
        .build();
    let k = kernel.clone();
    kernel.run(move || {
        let pd = PageDir::new();
        // Twice as many pages as user frames: touching them all forces
        // eviction through the clock.
        for i in 0..8 {
            pd.set_info(page(i), Some(PageInfo::zero(&pd, page(i), WritableTo::SWAP)));
        }
        for i in 0..8 {
            uaccess::copy_out(&pd, page(i), &[i as u8 + 1; 64], ESP).unwrap();
        }
        for i in (0..8).rev() {
            let data = uaccess::copy_in(&pd, page(i), 64, ESP).unwrap();
            assert!(data.iter().all(|&b| b == i as u8 + 1), "page {i} corrupted");
        }
        for i in 0..8 {
            k.frames().unload(&pd, page(i));
        }
        // Unload released every swap slot.
        assert_eq!(k.swap().unwrap().used_slots(), 0);
    });
}

#[test]
fn read_only_file_pages_share_one_frame() {
    let kernel = Kernel::builder().build();
    let k = kernel.clone();
    kernel.run(move || {
        let (file, _, reads) = MemFile::new(7, vec![0x5A; PAGE_SIZE]);
        let pd1 = PageDir::new();
        let pd2 = PageDir::new();
        let va = page(0);
        for pd in [&pd1, &pd2] {
            pd.set_info(
                va,
                Some(PageInfo::file(
                    pd,
                    va,
                    file.clone(),
                    PAGE_SIZE as u32,
                    WritableTo::empty(),
                )),
            );
        }
        let a = uaccess::copy_in(&pd1, va, 16, ESP).unwrap();
        let b = uaccess::copy_in(&pd2, va, 16, ESP).unwrap();
        assert_eq!(a, vec![0x5A; 16]);
        assert_eq!(b, vec![0x5A; 16]);
        // The second mapping hit the read-only cache instead of reading
        // the file again.
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        k.frames().unload(&pd1, va);
        let c = uaccess::copy_in(&pd2, va, 16, ESP).unwrap();
        assert_eq!(c, vec![0x5A; 16]);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        k.frames().unload(&pd2, va);
    });
}

#[test]
fn writes_to_read_only_pages_fail() {
    Kernel::builder().build().run(|| {
        let (file, _, _) = MemFile::new(9, vec![1; PAGE_SIZE]);
        let pd = PageDir::new();
        let va = page(0);
        pd.set_info(
            va,
            Some(PageInfo::file(
                &pd,
                va,
                file,
                PAGE_SIZE as u32,
                WritableTo::empty(),
            )),
        );
        assert_eq!(
            uaccess::copy_out(&pd, va, &[2; 8], ESP),
            Err(KernelError::InvalidAccess)
        );
    });
}

#[test]
fn dirty_file_pages_write_back_on_unload() {
    let kernel = Kernel::builder().build();
    let k = kernel.clone();
    kernel.run(move || {
        let (file, data, _) = MemFile::new(11, vec![0; 6000]);
        let pd = PageDir::new();
        // Two pages; the second is partial (6000 bytes total).
        pd.set_info(
            page(0),
            Some(PageInfo::file(
                &pd,
                page(0),
                file.clone(),
                PAGE_SIZE as u32,
                WritableTo::FILE,
            )),
        );
        pd.set_info(
            page(1),
            Some(PageInfo::file(&pd, page(1), file, 6000, WritableTo::FILE)),
        );
        uaccess::copy_out(&pd, page(0), &[0xAB; 100], ESP).unwrap();
        uaccess::copy_out(&pd, Va::new(BASE + PAGE_SIZE), &[0xCD; 100], ESP).unwrap();
        k.frames().unload(&pd, page(0));
        k.frames().unload(&pd, page(1));
        let data = data.lock().unwrap();
        assert!(data[..100].iter().all(|&b| b == 0xAB));
        assert!(data[PAGE_SIZE..PAGE_SIZE + 100].iter().all(|&b| b == 0xCD));
        assert_eq!(data.len(), 6000);
    });
}

#[test]
fn kernel_seed_page_becomes_zero_page() {
    let kernel = Kernel::builder()
        .swap_device(Arc::new(MemDisk::new(64)))
        .build();
    let k = kernel.clone();
    kernel.run(move || {
        let pd = PageDir::new();
        let seed = k
            .pools()
            .alloc(k.ram(), AllocFlags::ZERO | AllocFlags::ASSERT)
            .unwrap();
        k.ram().write(seed, b"seeded contents");
        let va = page(0);
        pd.set_info(
            va,
            Some(PageInfo::kernel_seed(&pd, va, seed, WritableTo::SWAP)),
        );
        let data = uaccess::copy_in(&pd, va, 15, ESP).unwrap();
        assert_eq!(&data, b"seeded contents");
        k.frames().unload(&pd, va);
    });
}

#[test]
fn unmapped_addresses_fault() {
    Kernel::builder().build().run(|| {
        let pd = PageDir::new();
        assert_eq!(
            uaccess::copy_in(&pd, page(3), 8, ESP),
            Err(KernelError::BadAddress)
        );
        // Kernel addresses are never valid user pointers.
        assert_eq!(
            uaccess::copy_in(&pd, Va::new(PHYS_BASE + 64), 8, ESP),
            Err(KernelError::BadAddress)
        );
    });
}

#[test]
fn stack_faults_materialize_pages_at_legal_offsets() {
    Kernel::builder()
        .swap_device(Arc::new(MemDisk::new(64)))
        .build()
        .run(|| {
            let pd = PageDir::new();
            let esp = Va::new(PHYS_BASE - PAGE_SIZE);
            // A push 32 bytes below the stack pointer grows the stack.
            uaccess::copy_out(&pd, Va::new(esp.into_usize() - 32), &[1; 4], esp).unwrap();
            // Far below the stack pointer is fatal.
            assert_eq!(
                uaccess::copy_out(&pd, Va::new(esp.into_usize() - 4096 * 8), &[1; 4], esp),
                Err(KernelError::BadAddress)
            );
        });
}

#[test]
fn malloc_recycles_blocks_and_arenas() {
    let kernel = Kernel::builder().build();
    let k = kernel.clone();
    kernel.run(move || {
        let a = malloc::alloc(24).unwrap();
        let b = malloc::alloc(24).unwrap();
        assert_ne!(a, b);
        k.ram().write(a, &[0x11; 24]);
        k.ram().write(b, &[0x22; 24]);
        let mut buf = [0u8; 24];
        k.ram().read(a, &mut buf);
        assert_eq!(buf, [0x11; 24]);
        malloc::free(a);
        // The freed block is reused first.
        assert_eq!(malloc::alloc(20), Some(a));
        malloc::free(a);
        malloc::free(b);
        // Distinct classes come from distinct arenas.
        let small = malloc::alloc(16).unwrap();
        let large = malloc::alloc(1500).unwrap();
        assert_ne!(small.page_down(), large.page_down());
        malloc::free(small);
        malloc::free(large);
        // Oversize requests take a whole page; absurd ones fail.
        let big = malloc::alloc(3000).unwrap();
        malloc::free(big);
        assert_eq!(malloc::alloc(8000), None);
    });
}
