//! Validated access to user memory from kernel context.
//!
//! Kernel code must be re-entrant against page faults on user addresses.
//! The strategy here is the pre-fault-and-lock one: every page of a user
//! range is faulted in and pinned through the frame table before the copy,
//! so eviction cannot pull a page out mid-access, and a fault surfaces as
//! an error instead of killing the kernel. Stack growth applies during the
//! fault-in, so a system call may touch not-yet-materialized stack pages.

use crate::kernel::kernel;
use crate::mm::grow_stack;
use crate::mm::page_dir::PageDir;
use crate::mm::{Va, PAGE_SIZE};
use crate::KernelError;
use std::sync::Arc;

fn pages_of(va: Va, len: usize) -> impl Iterator<Item = Va> {
    let first = va.page_down().into_usize();
    let last = (va.into_usize() + len.max(1) - 1) & !(PAGE_SIZE - 1);
    (first..=last).step_by(PAGE_SIZE).map(Va::new)
}

/// Faults in and pins every page of `[va, va+len)` with the required
/// access. On failure nothing stays pinned.
pub fn lock_range(
    pd: &Arc<PageDir>,
    va: Va,
    len: usize,
    write: bool,
    esp: Va,
) -> Result<(), KernelError> {
    if len == 0 {
        return Ok(());
    }
    if !va.is_user() || !Va::new(va.into_usize() + len - 1).is_user() {
        return Err(KernelError::BadAddress);
    }
    let k = kernel();
    let mut pinned: Vec<Va> = Vec::new();
    for page in pages_of(va, len) {
        // The heuristically relevant address is the first byte actually
        // touched on this page.
        let touched = Va::new(page.into_usize().max(va.into_usize()));
        if pd.get_info(page).is_none() && !grow_stack::maybe_grow(pd, touched, esp) {
            for p in pinned {
                k.frames.unlock(pd, p);
            }
            return Err(KernelError::BadAddress);
        }
        if let Err(e) = k.frames.lock(pd, page, write) {
            for p in pinned {
                k.frames.unlock(pd, p);
            }
            return Err(e);
        }
        pinned.push(page);
    }
    Ok(())
}

/// Unpins a range pinned with [`lock_range`].
pub fn unlock_range(pd: &Arc<PageDir>, va: Va, len: usize) {
    if len == 0 {
        return;
    }
    let k = kernel();
    for page in pages_of(va, len) {
        k.frames.unlock(pd, page);
    }
}

/// Copies `len` bytes from user memory.
pub fn copy_in(
    pd: &Arc<PageDir>,
    va: Va,
    len: usize,
    esp: Va,
) -> Result<Vec<u8>, KernelError> {
    lock_range(pd, va, len, false, esp)?;
    let k = kernel();
    let mut out = vec![0u8; len];
    let mut copied = 0;
    while copied < len {
        let addr = Va::new(va.into_usize() + copied);
        let page = addr.page_down();
        let pte = pd.lookup(page).expect("pinned page not present");
        let n = (PAGE_SIZE - addr.page_offset()).min(len - copied);
        k.ram
            .read(pte.kva + addr.page_offset(), &mut out[copied..copied + n]);
        pd.set_accessed(page, true);
        copied += n;
    }
    unlock_range(pd, va, len);
    Ok(out)
}

/// Copies `buf` into user memory.
pub fn copy_out(pd: &Arc<PageDir>, va: Va, buf: &[u8], esp: Va) -> Result<(), KernelError> {
    lock_range(pd, va, buf.len(), true, esp)?;
    let k = kernel();
    let mut copied = 0;
    while copied < buf.len() {
        let addr = Va::new(va.into_usize() + copied);
        let page = addr.page_down();
        let pte = pd.lookup(page).expect("pinned page not present");
        let n = (PAGE_SIZE - addr.page_offset()).min(buf.len() - copied);
        k.ram
            .write(pte.kva + addr.page_offset(), &buf[copied..copied + n]);
        pd.set_accessed(page, true);
        pd.set_dirty(page, true);
        copied += n;
    }
    unlock_range(pd, va, buf.len());
    Ok(())
}

/// Reads a little-endian u32 from user memory.
pub fn read_u32(pd: &Arc<PageDir>, va: Va, esp: Va) -> Result<u32, KernelError> {
    let b = copy_in(pd, va, 4, esp)?;
    Ok(u32::from_le_bytes(b.try_into().unwrap()))
}

/// Reads a NUL-terminated string, validating byte by byte until the
/// terminator. Fails with [`KernelError::NameTooLong`] past `max` bytes.
pub fn read_cstr(
    pd: &Arc<PageDir>,
    va: Va,
    esp: Va,
    max: usize,
) -> Result<String, KernelError> {
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = copy_in(pd, Va::new(va.into_usize() + i), 1, esp)?[0];
        if b == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
        }
        bytes.push(b);
    }
    Err(KernelError::NameTooLong)
}
