//! Swap device: page-granularity slots over a block device.

use super::{Kva, Ram, PAGE_SIZE};
use crate::dev::{BlockDevice, Sector, SECTOR_SIZE};
use crate::util::Bitmap;
use std::sync::{Arc, Mutex as StdMutex};

/// Sectors per page-sized swap slot.
pub const SECTORS_PER_PAGE: u32 = (PAGE_SIZE / SECTOR_SIZE) as u32;

/// One page's worth of consecutive sectors on the swap device, identified
/// by its first sector.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SwapSlot(pub u32);

/// The swap device and its slot map.
pub struct Swap {
    dev: Arc<dyn BlockDevice>,
    map: StdMutex<Bitmap>,
}

impl Swap {
    pub(crate) fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = (dev.sector_count() / SECTORS_PER_PAGE) as usize;
        Self {
            dev,
            map: StdMutex::new(Bitmap::new(slots)),
        }
    }

    /// Writes the page at `kva` to a fresh swap slot. Running out of swap
    /// during eviction has no fallback, so exhaustion panics.
    pub fn write(&self, ram: &Ram, kva: Kva) -> SwapSlot {
        let slot = self
            .map
            .lock()
            .unwrap()
            .scan_and_flip(0)
            .expect("out of swap space");
        let first = slot as u32 * SECTORS_PER_PAGE;
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            ram.read(kva + (i as usize * SECTOR_SIZE), &mut buf);
            self.dev
                .write(Sector(first + i), &buf)
                .expect("swap write failed");
        }
        SwapSlot(first)
    }

    /// Reads `slot` into the page at `kva` and releases the slot. Every
    /// swap-in is followed by a remapping or an explicit release, and
    /// writable frames are never shared, so no second reader exists.
    pub fn read(&self, ram: &Ram, slot: SwapSlot, kva: Kva) {
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.dev
                .read(Sector(slot.0 + i), &mut buf)
                .expect("swap read failed");
            ram.write(kva + (i as usize * SECTOR_SIZE), &buf);
        }
        self.release(slot);
    }

    /// Frees `slot` without reading it. Used when a swapped-out page is
    /// unloaded.
    pub fn release(&self, slot: SwapSlot) {
        let mut map = self.map.lock().unwrap();
        let idx = (slot.0 / SECTORS_PER_PAGE) as usize;
        assert!(map.test(idx), "releasing a free swap slot");
        map.set(idx, false);
    }

    /// Allocated slot count.
    pub fn used_slots(&self) -> usize {
        self.map.lock().unwrap().count()
    }
}
