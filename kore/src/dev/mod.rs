//! Devices: block devices and the console.
//!
//! A block device exposes 512-byte sectors under the roles "filesystem" and
//! "swap". [`MemDisk`] is the in-memory implementation standing in for the
//! IDE choreography this kernel does not carry. The console couples an
//! interrupt-fed input queue with a captured output buffer.

use crate::kernel::Kernel;
use crate::sync::IntQueue;
use crate::thread::scheduler;
use crate::KernelError;
use std::sync::Mutex as StdMutex;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// A sector number on a block device.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct Sector(pub u32);

impl Sector {
    /// The byte offset of this sector on its device.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 as usize * SECTOR_SIZE
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Sector;
    fn add(self, rhs: u32) -> Sector {
        Sector(self.0 + rhs)
    }
}

/// A device addressed in 512-byte sectors.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> u32;

    /// Reads one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Writes one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: StdMutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Creates a zero-filled disk of `sector_count` sectors.
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: StdMutex::new(vec![[0; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock().unwrap();
        let s = sectors.get(sector.0 as usize).ok_or(KernelError::IOError)?;
        buf.copy_from_slice(s);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock().unwrap();
        let s = sectors
            .get_mut(sector.0 as usize)
            .ok_or(KernelError::IOError)?;
        s.copy_from_slice(buf);
        Ok(())
    }
}

/// The console: keyboard input through an interrupt queue, output into a
/// capture buffer readable by tests.
pub struct Console {
    input: IntQueue,
    output: StdMutex<Vec<u8>>,
}

impl Console {
    pub(crate) fn new() -> Self {
        Self {
            input: IntQueue::new(),
            output: StdMutex::new(Vec::new()),
        }
    }

    /// Reads one byte of keyboard input, waiting for a keystroke.
    pub fn getc(&self) -> u8 {
        self.input.getc()
    }

    /// Appends `bytes` to the console output.
    pub fn write(&self, bytes: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(bytes);
        if let Ok(s) = core::str::from_utf8(bytes) {
            log::debug!("console: {s:?}");
        }
    }

    pub(crate) fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }

    /// Delivers keystrokes from a simulated external interrupt. Bytes that
    /// arrive while the queue is full are dropped.
    pub(crate) fn feed(&self, k: &Kernel, bytes: &[u8]) {
        for &b in bytes {
            {
                let mut st = scheduler::lock(k);
                st.in_interrupt = true;
            }
            if !self.input.is_full() {
                self.input.putc(b);
            }
            let yield_pending = {
                let mut st = scheduler::lock(k);
                st.in_interrupt = false;
                core::mem::take(&mut st.yield_pending)
            };
            if yield_pending {
                scheduler::yield_now(k);
            }
        }
    }
}
