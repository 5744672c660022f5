//! Per-process page directory.
//!
//! Maps user virtual pages to frames with writable, accessed and dirty
//! bits, plus an opaque per-page slot holding the page's [`PageInfo`]. The
//! hardware would keep these in page-table entries; this façade keeps them
//! in an associative table keyed by virtual page number, which the design
//! treats as an implementation choice.

use super::page_info::PageInfo;
use super::{Kva, Va, PAGE_SHIFT};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

#[derive(Clone, Copy)]
pub(crate) struct Pte {
    pub kva: Kva,
    pub present: bool,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

#[derive(Default)]
struct PageSlot {
    pte: Option<Pte>,
    info: Option<Arc<PageInfo>>,
}

/// A process's page directory.
pub struct PageDir {
    map: StdMutex<BTreeMap<usize, PageSlot>>,
}

impl PageDir {
    /// Creates an empty directory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: StdMutex::new(BTreeMap::new()),
        })
    }

    fn vpn(va: Va) -> usize {
        va.into_usize() >> PAGE_SHIFT
    }

    /// Installs a mapping from `upage` to the frame at `kva`. The new
    /// mapping starts accessed and clean.
    pub(crate) fn set_page(&self, upage: Va, kva: Kva, writable: bool) {
        let mut map = self.map.lock().unwrap();
        let slot = map.entry(Self::vpn(upage)).or_default();
        slot.pte = Some(Pte {
            kva,
            present: true,
            writable,
            accessed: true,
            dirty: false,
        });
    }

    /// Marks `upage` not present. Accessed and dirty bits survive until the
    /// slot itself is dropped, so eviction can still read them.
    pub(crate) fn clear_page(&self, upage: Va) {
        let mut map = self.map.lock().unwrap();
        if let Some(slot) = map.get_mut(&Self::vpn(upage)) {
            if let Some(pte) = slot.pte.as_mut() {
                pte.present = false;
            }
        }
    }

    /// The present translation for `upage`, if any.
    pub(crate) fn lookup(&self, upage: Va) -> Option<Pte> {
        let map = self.map.lock().unwrap();
        map.get(&Self::vpn(upage))
            .and_then(|s| s.pte)
            .filter(|p| p.present)
    }

    pub(crate) fn is_accessed(&self, upage: Va) -> bool {
        let map = self.map.lock().unwrap();
        map.get(&Self::vpn(upage))
            .and_then(|s| s.pte)
            .map(|p| p.accessed)
            .unwrap_or(false)
    }

    pub(crate) fn set_accessed(&self, upage: Va, accessed: bool) {
        let mut map = self.map.lock().unwrap();
        if let Some(pte) = map.get_mut(&Self::vpn(upage)).and_then(|s| s.pte.as_mut()) {
            pte.accessed = accessed;
        }
    }

    pub(crate) fn is_dirty(&self, upage: Va) -> bool {
        let map = self.map.lock().unwrap();
        map.get(&Self::vpn(upage))
            .and_then(|s| s.pte)
            .map(|p| p.dirty)
            .unwrap_or(false)
    }

    pub(crate) fn set_dirty(&self, upage: Va, dirty: bool) {
        let mut map = self.map.lock().unwrap();
        if let Some(pte) = map.get_mut(&Self::vpn(upage)).and_then(|s| s.pte.as_mut()) {
            pte.dirty = dirty;
        }
    }

    /// Stores the page-info slot for `upage`.
    pub fn set_info(&self, upage: Va, info: Option<Arc<PageInfo>>) {
        let mut map = self.map.lock().unwrap();
        match info {
            Some(info) => {
                map.entry(Self::vpn(upage)).or_default().info = Some(info);
            }
            None => {
                map.remove(&Self::vpn(upage));
            }
        }
    }

    /// The page-info slot for `upage`.
    pub fn get_info(&self, upage: Va) -> Option<Arc<PageInfo>> {
        let map = self.map.lock().unwrap();
        map.get(&Self::vpn(upage)).and_then(|s| s.info.clone())
    }

    /// Every user page address that has a page-info slot.
    pub(crate) fn mapped_pages(&self) -> Vec<Va> {
        let map = self.map.lock().unwrap();
        map.iter()
            .filter(|(_, s)| s.info.is_some())
            .map(|(&vpn, _)| Va::new(vpn << PAGE_SHIFT))
            .collect()
    }
}
