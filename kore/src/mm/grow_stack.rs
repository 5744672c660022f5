//! Stack growth heuristic.

use super::page_dir::PageDir;
use super::page_info::{PageInfo, WritableTo};
use super::{Va, PAGE_SIZE, PHYS_BASE};
use std::sync::Arc;

/// The stack cannot grow beyond 256 KiB below the top of user space.
pub const MAX_STACK_SIZE: usize = PHYS_BASE - PAGE_SIZE * 64;

/// Whether `vaddr` looks like a stack access relative to stack pointer
/// `esp`.
///
/// Pushes fault 8 or 32 bytes below the stack pointer; faults at or above
/// it happen when the pointer was decremented first and the slot written
/// afterwards.
pub fn is_stack_access(vaddr: Va, esp: Va) -> bool {
    let (vaddr, esp) = (vaddr.into_usize(), esp.into_usize());
    vaddr >= MAX_STACK_SIZE
        && vaddr < PHYS_BASE
        && (vaddr >= esp || esp - vaddr == 8 || esp - vaddr == 32)
}

/// If `vaddr` has no page-info and passes the heuristic, lazily creates a
/// zero page writable to swap; the following demand-load produces an empty
/// frame. Returns whether the fault may be retried.
pub fn maybe_grow(pd: &Arc<PageDir>, vaddr: Va, esp: Va) -> bool {
    let upage = vaddr.page_down();
    if pd.get_info(upage).is_some() {
        return true;
    }
    if !is_stack_access(vaddr, esp) {
        return false;
    }
    let info = PageInfo::zero(pd, upage, WritableTo::SWAP);
    pd.set_info(upage, Some(info));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_offsets() {
        let esp = Va::new(PHYS_BASE - 0x1000);
        assert!(is_stack_access(esp, esp));
        assert!(is_stack_access(Va::new(esp.into_usize() + 4), esp));
        assert!(is_stack_access(Va::new(esp.into_usize() - 8), esp));
        assert!(is_stack_access(Va::new(esp.into_usize() - 32), esp));
        assert!(!is_stack_access(Va::new(esp.into_usize() - 4), esp));
        assert!(!is_stack_access(Va::new(esp.into_usize() - 64), esp));
    }

    #[test]
    fn capped_at_256k() {
        let esp = Va::new(MAX_STACK_SIZE - 100);
        // Below the window nothing is a stack access, even above esp.
        assert!(!is_stack_access(Va::new(MAX_STACK_SIZE - 50), esp));
        assert!(is_stack_access(Va::new(MAX_STACK_SIZE), esp));
    }
}
